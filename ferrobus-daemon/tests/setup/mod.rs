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

#![allow(dead_code)]

use std::sync::Once;

use ferrobus::prelude::*;
use ferrobus_core::BusAddress;
use ferrobus_daemon::Daemon;
use tempfile::TempDir;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Ensures tracing initialization happens only once across all tests.
static INIT: Once = Once::new();

/// Initializes the global tracing subscriber for tests.
///
/// Output goes to `logs/ferrobus_daemon_tests.txt`.
pub fn initialize_tracing() {
    INIT.call_once(|| {
        std::fs::create_dir_all("logs").expect("could not create logs dir");

        let file_appender =
            RollingFileAppender::new(Rotation::NEVER, "logs", "ferrobus_daemon_tests.txt");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        Box::leak(Box::new(guard));

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info")
                .add_directive("ferrobus_daemon=trace".parse().unwrap())
                .add_directive("ferrobus=debug".parse().unwrap())
        });

        let subscriber = FmtSubscriber::builder()
            .with_span_events(FmtSpan::NONE)
            .with_max_level(Level::TRACE)
            .compact()
            .with_line_number(true)
            .without_time()
            .with_target(true)
            .with_env_filter(filter)
            .with_writer(non_blocking)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .expect("setting default subscriber failed");
    });
}

/// Configuration with short timeouts for tests.
pub fn test_config() -> BusConfig {
    let mut config = BusConfig::default();
    config.timeouts.call = 10_000;
    config
}

/// A daemon listening on a socket in its own temporary directory.
pub struct TestBus {
    pub daemon: Daemon,
    pub address: String,
    _dir: TempDir,
}

impl TestBus {
    pub async fn start() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let listen = BusAddress::unix(dir.path().join("bus"));
        let daemon = Daemon::bind(test_config(), &[listen]).await?;
        let address = daemon.address();
        Ok(Self {
            daemon,
            address,
            _dir: dir,
        })
    }

    /// Path of the unix socket.
    pub fn socket_path(&self) -> std::path::PathBuf {
        self._dir.path().join("bus")
    }

    /// A fresh, unshared client connection.
    pub async fn client(&self) -> anyhow::Result<Connection> {
        Ok(ConnectionBuilder::address(&self.address)?
            .config(test_config())
            .build()
            .await?)
    }
}
