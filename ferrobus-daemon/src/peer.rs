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

//! One accepted transport.

use std::fmt;

use futures::SinkExt;
use parking_lot::RwLock;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use ferrobus_core::{BusError, Message, MessageCodec};

/// Daemon-internal identifier of a peer, stable for its lifetime.
pub(crate) type PeerId = u64;

/// Write half of a peer transport.
pub(crate) type PeerWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, MessageCodec>;

/// Credentials of the process on the other end of a unix socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Credentials {
    pub(crate) uid: Option<u32>,
    pub(crate) pid: Option<u32>,
}

/// A connected peer.
///
/// The unique name is assigned by `Hello`; until then the peer may only
/// greet the bus.
pub(crate) struct Peer {
    id: PeerId,
    unique_name: RwLock<Option<String>>,
    credentials: Credentials,
    writer: Mutex<PeerWriter>,
    closed: CancellationToken,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("unique_name", &*self.unique_name.read())
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Peer {
    pub(crate) fn new(id: PeerId, credentials: Credentials, writer: PeerWriter) -> Self {
        Self {
            id,
            unique_name: RwLock::new(None),
            credentials,
            writer: Mutex::new(writer),
            closed: CancellationToken::new(),
        }
    }

    pub(crate) const fn id(&self) -> PeerId {
        self.id
    }

    pub(crate) fn unique_name(&self) -> Option<String> {
        self.unique_name.read().clone()
    }

    /// Record the name assigned by `Hello`. Fails if one was already set.
    pub(crate) fn assign_unique_name(&self, name: &str) -> bool {
        let mut slot = self.unique_name.write();
        if slot.is_some() {
            return false;
        }
        *slot = Some(name.to_string());
        true
    }

    pub(crate) const fn credentials(&self) -> Credentials {
        self.credentials
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Mark the peer closed. Returns `false` if it already was.
    pub(crate) fn close(&self) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        self.closed.cancel();
        true
    }

    pub(crate) async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Write one message to the transport.
    pub(crate) async fn write(&self, message: Message) -> Result<(), BusError> {
        let serial = message.serial();
        self.writer.lock().await.send(message).await?;
        trace!(peer = self.id, serial, "message written");
        Ok(())
    }

    /// Flush and shut down the write half.
    pub(crate) async fn shutdown_writer(&self) {
        let _ = self.writer.lock().await.close().await;
    }
}
