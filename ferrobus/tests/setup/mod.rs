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
use tokio::net::UnixStream;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Ensures tracing initialization happens only once across all tests.
static INIT: Once = Once::new();

/// Initializes the global tracing subscriber for tests.
///
/// Output goes to `logs/ferrobus_tests.txt`; `RUST_LOG` overrides the
/// default `ferrobus=trace` filter.
pub fn initialize_tracing() {
    INIT.call_once(|| {
        std::fs::create_dir_all("logs").expect("could not create logs dir");

        let file_appender = RollingFileAppender::new(Rotation::NEVER, "logs", "ferrobus_tests.txt");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // Leak the guard so the non-blocking writer is not dropped before process exit
        Box::leak(Box::new(guard));

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info")
                .add_directive("ferrobus=trace".parse().unwrap())
                .add_directive("ferrobus_core=debug".parse().unwrap())
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

/// Two peer-to-peer connections joined by a socket pair.
pub async fn connected_pair() -> anyhow::Result<(Connection, Connection)> {
    connected_pair_with(test_config()).await
}

/// Like [`connected_pair`], with `client_config` on the calling side.
pub async fn connected_pair_with(
    client_config: BusConfig,
) -> anyhow::Result<(Connection, Connection)> {
    let (a, b) = UnixStream::pair()?;
    let client = ConnectionBuilder::new()
        .peer_to_peer(true)
        .config(client_config)
        .build_with_stream(a)
        .await?;
    let server = ConnectionBuilder::new()
        .peer_to_peer(true)
        .config(test_config())
        .build_with_stream(b)
        .await?;
    Ok((client, server))
}
