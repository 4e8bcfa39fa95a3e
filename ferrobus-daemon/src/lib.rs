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

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Ferrobus Daemon
//!
//! The message broker peers connect to. It assigns unique names, keeps the
//! registry of well-known names, serves the `org.freedesktop.DBus` object
//! and routes method calls, replies and signals between peers.
//!
//! ## Tasks
//!
//! - one reader per peer, pushing decoded messages to the dispatcher
//! - the dispatcher, routing every message in arrival order
//! - the bus driver, answering calls addressed to the bus itself
//! - the sender, writing queued messages to their peers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ferrobus_core::{BusAddress, BusConfig};
//! use ferrobus_daemon::Daemon;
//!
//! let address = BusAddress::unix("/tmp/ferrobus-demo");
//! let daemon = Daemon::bind(BusConfig::load(), &[address]).await?;
//! println!("{}", daemon.address());
//! daemon.wait().await;
//! ```

mod driver;
mod listener;
mod matches;
mod names;
mod peer;
mod state;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};

use ferrobus_core::address::generate_guid;
use ferrobus_core::{BusAddress, BusConfig, BusError};

pub use listener::DaemonStats;
pub use matches::MatchStats;

use state::{BusState, Queues};

/// A running bus daemon.
#[derive(Debug)]
pub struct Daemon {
    state: Arc<BusState>,
    addresses: Vec<BusAddress>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Daemon {
    /// Listen on every address in `listen` and start routing.
    ///
    /// Unix socket paths are created with `config.daemon.socket_mode`; a
    /// tcp port of 0 is replaced by the port actually bound.
    pub async fn bind(config: BusConfig, listen: &[BusAddress]) -> Result<Self, BusError> {
        if listen.is_empty() {
            return Err(BusError::Parse("No address to listen on".to_string()));
        }
        let guid = generate_guid();
        let (state, queues) = BusState::new(config, guid);

        let mut listeners = Vec::with_capacity(listen.len());
        let mut addresses = Vec::with_capacity(listen.len());
        for address in listen {
            let (listener, reported) = listener::bind(address, &state).await?;
            listeners.push(listener);
            addresses.push(reported);
        }

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        spawn_router(&state, queues);
        for listener in listeners {
            tasks.spawn(listener::accept_loop(
                listener,
                Arc::clone(&state),
                cancel.clone(),
                tasks.clone(),
            ));
        }
        tasks.close();

        info!(guid = %state.guid, listeners = addresses.len(), "daemon started");
        Ok(Self {
            state,
            addresses,
            cancel,
            tasks,
        })
    }

    /// Addresses clients can connect to, each with the bus `guid`.
    #[must_use]
    pub fn addresses(&self) -> &[BusAddress] {
        &self.addresses
    }

    /// All listen addresses joined with `;`.
    #[must_use]
    pub fn address(&self) -> String {
        self.addresses
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Identifier of this bus instance.
    #[must_use]
    pub fn guid(&self) -> &str {
        &self.state.guid
    }

    /// Traffic counters.
    #[must_use]
    pub fn stats(&self) -> &DaemonStats {
        &self.state.stats
    }

    /// Match rule counters.
    #[must_use]
    pub fn match_stats(&self) -> &MatchStats {
        self.state.matches.stats()
    }

    /// Stop accepting peers and disconnect everyone.
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            info!("daemon shutting down");
            self.cancel.cancel();
        }
    }

    /// Wait until every listener and peer task has finished.
    pub async fn wait(&self) {
        self.tasks.wait().await;
        debug!("daemon tasks finished");
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Spawn the dispatcher, bus driver and sender tasks. They end once every
/// sender of their queue is gone, which happens when the state is dropped.
fn spawn_router(state: &Arc<BusState>, queues: Queues) {
    let Queues {
        mut inbound,
        mut local,
        mut outbound,
    } = queues;
    let weak = Arc::downgrade(state);

    let dispatcher = weak.clone();
    tokio::spawn(async move {
        while let Some((message, from)) = inbound.recv().await {
            let Some(state) = dispatcher.upgrade() else {
                break;
            };
            state.dispatch(message, from);
        }
        trace!("dispatcher stopped");
    });

    let driver = weak.clone();
    tokio::spawn(async move {
        while let Some((call, from)) = local.recv().await {
            let Some(state) = driver.upgrade() else {
                break;
            };
            if let Some(peer) = from.upgrade().filter(|peer| !peer.is_closed()) {
                state.serve(&call, &peer);
            }
        }
        trace!("bus driver stopped");
    });

    let sender = weak;
    tokio::spawn(async move {
        while let Some((message, to)) = outbound.recv().await {
            let Some(peer) = to.upgrade().filter(|peer| !peer.is_closed()) else {
                continue;
            };
            if let Err(error) = peer.write(message).await {
                debug!(peer = peer.id(), %error, "write failed, dropping peer");
                if let Some(state) = sender.upgrade() {
                    state.stats.errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    state.teardown(&peer);
                }
            }
        }
        trace!("sender stopped");
    });
}
