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

//! Transport listeners and the per-peer read loop.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use ferrobus_core::{BusAddress, BusError, Endpoint, Frame, MessageCodec};

use crate::peer::{Credentials, Peer};
use crate::state::BusState;

/// Counters describing daemon traffic.
#[derive(Debug, Default)]
pub struct DaemonStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicUsize,
    /// Currently connected peers.
    pub connections_active: AtomicUsize,
    /// Total messages read from peers.
    pub messages_received: AtomicUsize,
    /// Total messages delivered to another peer.
    pub messages_routed: AtomicUsize,
    /// Total errors, including error replies generated by the bus.
    pub errors: AtomicUsize,
}

impl DaemonStats {
    /// Create zeroed statistics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of connections accepted.
    #[must_use]
    pub fn connections_accepted(&self) -> usize {
        self.connections_accepted.load(Ordering::Relaxed)
    }

    /// Get the number of connected peers.
    #[must_use]
    pub fn connections_active(&self) -> usize {
        self.connections_active.load(Ordering::Relaxed)
    }

    /// Get the number of messages read from peers.
    #[must_use]
    pub fn messages_received(&self) -> usize {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Get the number of messages delivered to peers.
    #[must_use]
    pub fn messages_routed(&self) -> usize {
        self.messages_routed.load(Ordering::Relaxed)
    }

    /// Get the number of errors.
    #[must_use]
    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }
}

/// A bound listening socket.
pub(crate) enum Listener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

/// Bind `address` and return the listener with the address clients should
/// use, carrying the bus `guid`.
pub(crate) async fn bind(
    address: &BusAddress,
    state: &BusState,
) -> Result<(Listener, BusAddress), BusError> {
    match address.endpoint()? {
        Endpoint::Unix(path) => {
            let listener = bind_unix(&path, state.config.daemon.socket_mode).await?;
            let reported = BusAddress::unix(&path).with_param("guid", state.guid.clone());
            info!(address = %reported, "listening on unix socket");
            Ok((Listener::Unix { listener, path }, reported))
        }
        Endpoint::Tcp { host, port } => {
            let listener = TcpListener::bind((host.as_str(), port)).await.map_err(|e| {
                BusError::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to bind {host}:{port}: {e}"),
                ))
            })?;
            let port = listener.local_addr()?.port();
            let reported = BusAddress::tcp(host, port).with_param("guid", state.guid.clone());
            info!(address = %reported, "listening on tcp socket");
            Ok((Listener::Tcp(listener), reported))
        }
    }
}

async fn bind_unix(path: &Path, mode: u32) -> Result<UnixListener, BusError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            return Err(BusError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("Another daemon is already listening at {}", path.display()),
            )));
        }
        warn!("Removing stale socket: {}", path.display());
        tokio::fs::remove_file(path).await?;
    }

    let listener = UnixListener::bind(path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }

    Ok(listener)
}

/// Accept peers until `cancel` fires, then remove the socket file.
pub(crate) async fn accept_loop(
    listener: Listener,
    state: Arc<BusState>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    let permits = Arc::new(Semaphore::new(state.config.daemon.max_connections));
    loop {
        let accepted = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!("accept loop received shutdown signal");
                break;
            }
            accepted = accept(&listener) => accepted,
        };
        let (reader, writer, credentials) = match accepted {
            Ok(parts) => parts,
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                state.stats.errors.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };
        let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
            warn!("Maximum concurrent connections reached, rejecting connection");
            state.stats.errors.fetch_add(1, Ordering::Relaxed);
            continue;
        };
        state.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        state.stats.connections_active.fetch_add(1, Ordering::Relaxed);

        let state = Arc::clone(&state);
        let cancel = cancel.clone();
        tracker.spawn(async move {
            serve_peer(reader, writer, credentials, state, cancel).await;
            drop(permit);
        });
    }

    if let Listener::Unix { path, .. } = &listener {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!("Failed to remove socket file on shutdown: {}", e);
        } else {
            debug!("Socket file removed: {}", path.display());
        }
    }
}

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

async fn accept(listener: &Listener) -> std::io::Result<(Reader, Writer, Credentials)> {
    match listener {
        Listener::Unix { listener, .. } => {
            let (stream, _) = listener.accept().await?;
            let credentials = stream
                .peer_cred()
                .map(|cred| Credentials {
                    uid: Some(cred.uid()),
                    pid: cred.pid().and_then(|pid| u32::try_from(pid).ok()),
                })
                .unwrap_or_default();
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer), credentials))
        }
        Listener::Tcp(listener) => {
            let (stream, remote) = listener.accept().await?;
            trace!(%remote, "tcp peer connected");
            stream.set_nodelay(true)?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer), Credentials::default()))
        }
    }
}

/// Read messages from one peer until it disconnects or is torn down.
async fn serve_peer(
    reader: Reader,
    writer: Writer,
    credentials: Credentials,
    state: Arc<BusState>,
    cancel: CancellationToken,
) {
    let limits = state.config.limits.clone();
    let peer = Arc::new(Peer::new(
        state.next_peer_id(),
        credentials,
        FramedWrite::new(writer, MessageCodec::with_limits(limits.clone())),
    ));
    state.add_peer(Arc::clone(&peer));
    debug!(peer = peer.id(), ?credentials, "peer connected");

    let weak = Arc::downgrade(&peer);
    let mut frames = FramedRead::new(reader, MessageCodec::with_limits(limits));
    loop {
        let frame = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = peer.closed() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(Frame::Message(message))) => {
                state.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                state.receive(message, weak.clone());
            }
            Some(Ok(Frame::Malformed { serial, error })) => {
                warn!(peer = peer.id(), serial, %error, "malformed message skipped");
                state.stats.errors.fetch_add(1, Ordering::Relaxed);
            }
            Some(Err(error)) => {
                debug!(peer = peer.id(), %error, "read failed");
                break;
            }
            None => {
                trace!(peer = peer.id(), "peer closed its end");
                break;
            }
        }
    }

    state.teardown(&peer);
    peer.shutdown_writer().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_new() {
        let stats = DaemonStats::new();
        assert_eq!(stats.connections_accepted(), 0);
        assert_eq!(stats.connections_active(), 0);
        assert_eq!(stats.messages_received(), 0);
        assert_eq!(stats.messages_routed(), 0);
        assert_eq!(stats.errors(), 0);
    }

    #[test]
    fn test_stats_increment() {
        let stats = DaemonStats::new();
        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        stats.messages_received.fetch_add(5, Ordering::Relaxed);
        stats.errors.fetch_add(2, Ordering::Relaxed);
        assert_eq!(stats.connections_accepted(), 1);
        assert_eq!(stats.messages_received(), 5);
        assert_eq!(stats.errors(), 2);
    }
}
