/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

//! Bus configuration with XDG-compliant file lookup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::BusError;
use crate::message::MAX_MESSAGE_SIZE;
use crate::names::MAX_NAME_LENGTH;
use crate::wire::MAX_ARRAY_LENGTH;

/// Configuration shared by client connections and the daemon.
///
/// Loaded from `$XDG_CONFIG_HOME/ferrobus/bus.toml`. Every section is
/// optional and missing keys keep their defaults.
///
/// # Example Configuration File
///
/// ```toml
/// [limits]
/// max_message_size = 134217728  # 128 MiB
/// max_array_length = 67108864   # 64 MiB
///
/// [timeouts]
/// call_timeout_ms = 20000
///
/// [workers]
/// count = 4
///
/// [connection]
/// pending_errors_capacity = 64
///
/// [daemon]
/// match_policy = "evaluate"
/// socket_mode = 0o660
/// max_connections = 256
///
/// [logging]
/// directory = "/var/log/ferrobus"
/// file_prefix = "bus"
/// level = "info"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Message and name limits.
    pub limits: Limits,
    /// Timeouts.
    pub timeouts: TimeoutsConfig,
    /// Callback worker pool.
    pub workers: WorkersConfig,
    /// Per-connection bookkeeping.
    pub connection: ConnectionConfig,
    /// Daemon behavior.
    pub daemon: DaemonConfig,
    /// Log output.
    pub logging: LoggingConfig,
}

/// Limits applied while framing and validating messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Largest accepted frame in bytes.
    pub max_message_size: usize,
    /// Largest accepted array payload in bytes.
    pub max_array_length: usize,
    /// Longest accepted bus, interface or member name.
    pub max_name_length: usize,
}

/// Timeout configuration, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Default timeout of an awaited method call.
    #[serde(rename = "call_timeout_ms")]
    pub call: u64,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Number of callback workers per connection.
    pub count: usize,
}

/// Connection bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// How many unmatched error replies are kept before the oldest is dropped.
    pub pending_errors_capacity: usize,
}

/// How the daemon decides which peers receive a broadcast signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPolicy {
    /// Deliver when one of the peer's rules matches the signal.
    #[default]
    Evaluate,
    /// Deliver to every peer holding at least one rule.
    Presence,
}

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Broadcast filtering.
    pub match_policy: MatchPolicy,
    /// Permissions of created unix sockets.
    pub socket_mode: u32,
    /// Maximum concurrent peers.
    pub max_connections: usize,
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for rolling log files. Logs go to stderr only when unset.
    pub directory: Option<PathBuf>,
    /// File name prefix for rolling log files.
    pub file_prefix: String,
    /// Default filter directive when `RUST_LOG` is not set.
    pub level: String,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
            max_array_length: MAX_ARRAY_LENGTH,
            max_name_length: MAX_NAME_LENGTH,
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self { call: 20_000 }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self { count: 4 }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pending_errors_capacity: 64,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            match_policy: MatchPolicy::Evaluate,
            socket_mode: 0o660,
            max_connections: 256,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            file_prefix: "ferrobus".to_string(),
            level: "info".to_string(),
        }
    }
}

impl BusConfig {
    /// Load configuration from XDG-compliant locations.
    ///
    /// Looks for `ferrobus/bus.toml` under `$XDG_CONFIG_HOME` and the XDG
    /// config dirs. If no file is found or it cannot be parsed, returns the
    /// default configuration.
    #[must_use]
    pub fn load() -> Self {
        let xdg_dirs = match xdg::BaseDirectories::with_prefix("ferrobus") {
            Ok(dirs) => dirs,
            Err(e) => {
                warn!("Failed to initialize XDG directories for bus config: {}", e);
                return Self::default();
            }
        };

        xdg_dirs.find_config_file("bus.toml").map_or_else(
            || {
                info!("No bus configuration file found, using defaults");
                Self::default()
            },
            |path| {
                Self::load_from(&path).unwrap_or_else(|e| {
                    warn!(
                        "Failed to load bus configuration file {}: {}",
                        path.display(),
                        e
                    );
                    Self::default()
                })
            },
        )
    }

    /// Load configuration from an explicit file.
    pub fn load_from(path: &Path) -> Result<Self, BusError> {
        info!("Loading bus configuration from: {}", path.display());
        let config_str = std::fs::read_to_string(path)?;
        let config = toml::from_str::<Self>(&config_str).map_err(|e| {
            BusError::Parse(format!(
                "Failed to parse bus configuration file {}: {}",
                path.display(),
                e
            ))
        })?;
        info!("Successfully loaded bus configuration");
        Ok(config)
    }

    /// Default timeout of an awaited call as a `Duration`.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = BusConfig::default();
        assert_eq!(config.limits.max_message_size, 128 * 1024 * 1024);
        assert_eq!(config.limits.max_array_length, 64 * 1024 * 1024);
        assert_eq!(config.limits.max_name_length, 255);
        assert_eq!(config.workers.count, 4);
        assert_eq!(config.connection.pending_errors_capacity, 64);
        assert_eq!(config.daemon.match_policy, MatchPolicy::Evaluate);
        assert_eq!(config.call_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[timeouts]\ncall_timeout_ms = 500\n\n[daemon]\nmatch_policy = \"presence\""
        )
        .unwrap();

        let config = BusConfig::load_from(file.path()).unwrap();
        assert_eq!(config.call_timeout(), Duration::from_millis(500));
        assert_eq!(config.daemon.match_policy, MatchPolicy::Presence);
        assert_eq!(config.daemon.max_connections, 256);
        assert_eq!(config.workers.count, 4);
    }

    #[test]
    fn test_invalid_file_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[workers]\ncount = \"many\"").unwrap();
        let err = BusConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, BusError::Parse(msg) if msg.contains("Failed to parse")));
    }

    #[test]
    fn test_config_serialization() {
        let config = BusConfig::default();
        let toml_str = toml::to_string(&config).unwrap();

        let parsed: BusConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.limits, config.limits);
        assert_eq!(parsed.logging.file_prefix, "ferrobus");
    }
}
