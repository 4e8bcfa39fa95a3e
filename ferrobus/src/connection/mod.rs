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

//! The per-process connection engine.
//!
//! A [`Connection`] owns one transport and three kinds of tasks: a reader
//! that decodes and routes incoming frames, a writer that drains the
//! outbound FIFO, and a resizable pool of workers that runs every
//! application callback (method handlers, reply callbacks, signal handlers).
//!
//! Serial assignment, pending-call registration and enqueueing happen under
//! one lock, so messages leave in serial order and a reply can never arrive
//! before its call is registered.

mod dispatch;
mod pending;
mod signals;
mod transport;
mod workers;

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use lazy_static::lazy_static;
use parking_lot::{Mutex, RwLock};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, trace, warn};

use ferrobus_core::bus::{
    machine_id, ReleaseNameReply, RequestNameReply, NAME_FLAG_DO_NOT_QUEUE,
    NAME_FLAG_REPLACE_EXISTING,
};
use ferrobus_core::names::{check_bus_name, is_unique_name, ObjectPath, LOCAL_INTERFACE};
use ferrobus_core::{
    BusAddress, BusConfig, BusError, Frame, Message, MessageCodec, MessageType, Value,
};

use crate::bus::BusProxy;
use crate::exporter::{ExportLease, ObjectRegistry};
use crate::object::{BusObject, InterfaceDescriptor};
use crate::proxy::Proxy;

pub use pending::{ErrorCallback, PendingReply, ReplyCallback};
pub use signals::{HandlerId, SignalHandler, SignalKey};
pub use transport::{BoxedTransport, Handshake, PreAuthenticated, Transport};

use pending::{PendingCall, PendingTable};
use signals::SignalTable;
use workers::WorkerPool;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The transport is being opened.
    Connecting,
    /// The handshake completed; the bus greeting may still be in flight.
    Authenticated,
    /// Messages flow in both directions.
    Running,
    /// Closed for good.
    Disconnected,
}

lazy_static! {
    /// Shared connections by address, with their reference counts.
    static ref SHARED: Mutex<HashMap<String, SharedEntry>> = Mutex::new(HashMap::new());
}

struct SharedEntry {
    connection: Connection,
    refs: usize,
}

/// State shared by every handle of one connection.
pub(crate) struct ConnectionInner {
    config: BusConfig,
    peer_to_peer: bool,
    shared_key: Option<String>,
    machine_id: String,
    state: Mutex<ConnectionState>,
    unique_name: RwLock<Option<String>>,
    names: RwLock<BTreeSet<String>>,
    /// Last serial handed out. Held while a message is registered and queued.
    serial: Mutex<u32>,
    outbound: mpsc::UnboundedSender<Message>,
    pending: PendingTable,
    pending_errors: Mutex<VecDeque<Message>>,
    objects: Arc<ObjectRegistry>,
    signals: SignalTable,
    interfaces: RwLock<HashMap<String, InterfaceDescriptor>>,
    workers: WorkerPool,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.workers.shutdown();
    }
}

/// Handle to a connection. Cloning is cheap; every clone drives the same
/// transport.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("unique_name", &self.unique_name())
            .field("peer_to_peer", &self.inner.peer_to_peer)
            .field("pending", &self.inner.pending.len())
            .field("objects", &self.inner.objects)
            .finish_non_exhaustive()
    }
}

/// Options for opening a private connection.
pub struct ConnectionBuilder {
    addresses: Vec<BusAddress>,
    config: Option<BusConfig>,
    peer_to_peer: bool,
    handshake: Arc<dyn Handshake>,
    shared_key: Option<String>,
}

impl fmt::Debug for ConnectionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionBuilder")
            .field("addresses", &self.addresses)
            .field("peer_to_peer", &self.peer_to_peer)
            .finish_non_exhaustive()
    }
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionBuilder {
    /// Builder without addresses, for use with [`ConnectionBuilder::build_with_stream`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            addresses: Vec::new(),
            config: None,
            peer_to_peer: false,
            handshake: Arc::new(PreAuthenticated),
            shared_key: None,
        }
    }

    /// Builder connecting to the alternatives in `address`.
    pub fn address(address: &str) -> Result<Self, BusError> {
        Ok(Self {
            addresses: BusAddress::parse_list(address)?,
            ..Self::new()
        })
    }

    /// Builder connecting to the session bus.
    pub fn session() -> Result<Self, BusError> {
        Ok(Self {
            addresses: BusAddress::session()?,
            ..Self::new()
        })
    }

    /// Builder connecting to the system bus.
    pub fn system() -> Result<Self, BusError> {
        Ok(Self {
            addresses: BusAddress::system()?,
            ..Self::new()
        })
    }

    /// Use `config` instead of the XDG configuration.
    #[must_use]
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Talk directly to a peer: no `Hello`, no daemon-side match rules.
    #[must_use]
    pub fn peer_to_peer(mut self, peer_to_peer: bool) -> Self {
        self.peer_to_peer = peer_to_peer;
        self
    }

    /// Authenticate new transports with `handshake`.
    #[must_use]
    pub fn handshake(mut self, handshake: impl Handshake) -> Self {
        self.handshake = Arc::new(handshake);
        self
    }

    /// Open the first reachable address and start the connection.
    pub async fn build(self) -> Result<Connection, BusError> {
        let stream = transport::open_first(&self.addresses).await?;
        self.start(stream).await
    }

    /// Start the connection on an already open stream.
    pub async fn build_with_stream<T: Transport>(self, stream: T) -> Result<Connection, BusError> {
        self.start(Box::new(stream)).await
    }

    #[instrument(skip_all)]
    async fn start(self, stream: BoxedTransport) -> Result<Connection, BusError> {
        let config = self.config.unwrap_or_else(BusConfig::load);
        let stream = self.handshake.authenticate(stream).await?;
        debug!("transport authenticated");

        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FramedRead::new(read_half, MessageCodec::with_limits(config.limits.clone()));
        let writer = FramedWrite::new(write_half, MessageCodec::with_limits(config.limits.clone()));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ConnectionInner {
            workers: WorkerPool::new(config.workers.count),
            config,
            peer_to_peer: self.peer_to_peer,
            shared_key: self.shared_key,
            machine_id: machine_id(),
            state: Mutex::new(ConnectionState::Authenticated),
            unique_name: RwLock::new(None),
            names: RwLock::new(BTreeSet::new()),
            serial: Mutex::new(0),
            outbound,
            pending: PendingTable::default(),
            pending_errors: Mutex::new(VecDeque::new()),
            objects: Arc::new(ObjectRegistry::default()),
            signals: SignalTable::default(),
            interfaces: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        inner.tasks.spawn(write_loop(
            writer,
            outbound_rx,
            Arc::downgrade(&inner),
            inner.cancel.clone(),
        ));
        inner
            .tasks
            .spawn(read_loop(reader, Arc::downgrade(&inner), inner.cancel.clone()));
        inner.tasks.close();

        let connection = Connection { inner };
        if !connection.inner.peer_to_peer {
            match connection.bus().hello().await {
                Ok(unique_name) => {
                    debug!(%unique_name, "registered on the bus");
                    *connection.inner.unique_name.write() = Some(unique_name);
                }
                Err(error) => {
                    warn!(%error, "bus greeting failed");
                    connection.disconnect();
                    return Err(error);
                }
            }
        }
        connection.inner.set_state(ConnectionState::Running);
        info!(unique_name = ?connection.unique_name(), "connection running");
        Ok(connection)
    }
}

impl Connection {
    /// Shared connection to the session bus.
    pub async fn session() -> Result<Self, BusError> {
        let addresses = BusAddress::session()?;
        Self::shared(join_addresses(&addresses), addresses).await
    }

    /// Shared connection to the system bus.
    pub async fn system() -> Result<Self, BusError> {
        let addresses = BusAddress::system()?;
        Self::shared(join_addresses(&addresses), addresses).await
    }

    /// Shared connection to `address`.
    ///
    /// Connections are shared per address and reference counted; every
    /// handle obtained here should be released with [`Connection::close`].
    pub async fn connect(address: &str) -> Result<Self, BusError> {
        let addresses = BusAddress::parse_list(address)?;
        Self::shared(address.to_string(), addresses).await
    }

    /// Peer-to-peer connection over an already open stream.
    pub async fn from_stream<T: Transport>(stream: T) -> Result<Self, BusError> {
        ConnectionBuilder::new()
            .peer_to_peer(true)
            .build_with_stream(stream)
            .await
    }

    async fn shared(key: String, addresses: Vec<BusAddress>) -> Result<Self, BusError> {
        if let Some(existing) = acquire_shared(&key) {
            trace!(address = %key, "reusing shared connection");
            return Ok(existing);
        }
        let connection = ConnectionBuilder {
            addresses,
            shared_key: Some(key.clone()),
            ..ConnectionBuilder::new()
        }
        .build()
        .await?;

        let mut shared = SHARED.lock();
        if let Some(entry) = shared.get_mut(&key) {
            if entry.connection.is_connected() {
                entry.refs += 1;
                let existing = entry.connection.clone();
                drop(shared);
                connection.disconnect();
                return Ok(existing);
            }
        }
        shared.insert(
            key,
            SharedEntry {
                connection: connection.clone(),
                refs: 1,
            },
        );
        Ok(connection)
    }

    /// Release this handle of a shared connection.
    ///
    /// The transport is closed when the last handle for the address is
    /// released. Private connections are disconnected immediately.
    pub fn close(&self) {
        if let Some(key) = &self.inner.shared_key {
            let mut shared = SHARED.lock();
            if let Some(entry) = shared.get_mut(key) {
                if Arc::ptr_eq(&entry.connection.inner, &self.inner) {
                    entry.refs = entry.refs.saturating_sub(1);
                    if entry.refs > 0 {
                        trace!(address = %key, refs = entry.refs, "shared connection released");
                        return;
                    }
                    shared.remove(key);
                }
            }
        }
        self.disconnect();
    }

    /// Close the connection now.
    ///
    /// Registered handlers receive the local `Disconnected` signal, every
    /// outstanding call fails with [`BusError::Disconnected`], the reader and
    /// writer stop and the workers drain their queue.
    pub fn disconnect(&self) {
        self.inner.shutdown();
    }

    /// Wait until every task of the connection has stopped.
    pub async fn wait_closed(&self) {
        self.inner.cancel.cancelled().await;
        self.inner.tasks.wait().await;
        self.inner.workers.wait().await;
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Whether the connection can still carry messages.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() != ConnectionState::Disconnected
    }

    /// Whether the connection talks to a peer rather than a bus.
    #[must_use]
    pub fn is_peer_to_peer(&self) -> bool {
        self.inner.peer_to_peer
    }

    /// Unique name assigned by the bus.
    #[must_use]
    pub fn unique_name(&self) -> Option<String> {
        self.inner.unique_name.read().clone()
    }

    /// Well-known names currently owned.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.inner.names.read().iter().cloned().collect()
    }

    /// Configuration in force.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Send a method call and wait for the reply, up to the configured timeout.
    ///
    /// Error replies are returned as `Err`.
    pub async fn call(&self, message: Message) -> Result<Message, BusError> {
        self.call_with_timeout(message, self.inner.config.call_timeout())
            .await
    }

    /// Send a method call and wait for the reply, up to `timeout`.
    #[instrument(skip(self, message), fields(member = ?message.member()))]
    pub async fn call_with_timeout(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<Message, BusError> {
        expect_call(&message)?;
        let (tx, rx) = oneshot::channel();
        let serial = self
            .inner
            .send_with(message, Some(PendingCall::Waiter(tx)))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BusError::Disconnected),
            Err(_) => {
                self.inner.pending.take(serial);
                debug!(serial, ?timeout, "call timed out");
                Err(BusError::Timeout(timeout))
            }
        }
    }

    /// Send a method call and return a handle to its reply.
    pub fn call_async(&self, message: Message) -> Result<PendingReply, BusError> {
        expect_call(&message)?;
        let (tx, rx) = oneshot::channel();
        let serial = self
            .inner
            .send_with(message, Some(PendingCall::Waiter(tx)))?;
        Ok(PendingReply::new(serial, rx))
    }

    /// Send a method call; one of the callbacks runs on a worker when the
    /// call completes. Returns the serial of the call.
    ///
    /// A call still unanswered after the configured call timeout fails with
    /// [`BusError::Timeout`].
    pub fn call_with_callback<R, E>(
        &self,
        message: Message,
        on_reply: R,
        on_error: E,
    ) -> Result<u32, BusError>
    where
        R: FnOnce(Message) + Send + 'static,
        E: FnOnce(BusError) + Send + 'static,
    {
        expect_call(&message)?;
        let serial = self.inner.send_with(
            message,
            Some(PendingCall::Callback {
                on_reply: Box::new(on_reply),
                on_error: Box::new(on_error),
            }),
        )?;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(expire_callback(
                    Arc::downgrade(&self.inner),
                    serial,
                    self.inner.config.call_timeout(),
                    self.inner.cancel.clone(),
                ));
            }
            Err(_) => warn!(serial, "no runtime to time the callback call out"),
        }
        Ok(serial)
    }

    /// Send a message without waiting for anything. Returns its serial.
    pub fn send_no_reply(&self, message: Message) -> Result<u32, BusError> {
        self.inner.send_with(message, None)
    }

    /// Emit `interface.member` from `path`.
    pub fn emit_signal(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        args: Vec<Value>,
    ) -> Result<u32, BusError> {
        let signal = Message::signal(path, interface, member)?.body(args).build()?;
        self.send_no_reply(signal)
    }

    /// Oldest error reply that matched no outstanding call.
    pub fn take_error(&self) -> Option<Message> {
        self.inner.pending_errors.lock().pop_front()
    }

    /// Number of callback workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.inner.workers.count()
    }

    /// Resize the callback worker pool (at least one worker).
    pub fn set_worker_count(&self, count: usize) {
        self.inner.workers.resize(count);
    }

    /// Typed access to the bus daemon.
    #[must_use]
    pub fn bus(&self) -> BusProxy {
        BusProxy::new(self.clone())
    }

    /// Acquire the well-known name `name`.
    ///
    /// Fails with [`BusError::NameTaken`] when another connection owns it.
    pub async fn request_name(&self, name: &str) -> Result<(), BusError> {
        check_bus_name(name)?;
        if is_unique_name(name) {
            return Err(BusError::InvalidArgs(format!(
                "`{name}' is a unique name and cannot be requested"
            )));
        }
        let reply = self
            .bus()
            .request_name(name, NAME_FLAG_REPLACE_EXISTING | NAME_FLAG_DO_NOT_QUEUE)
            .await?;
        match reply {
            RequestNameReply::PrimaryOwner | RequestNameReply::AlreadyOwner => {
                self.inner.names.write().insert(name.to_string());
                debug!(name, "name acquired");
                Ok(())
            }
            RequestNameReply::Exists | RequestNameReply::InQueue => {
                Err(BusError::NameTaken(name.to_string()))
            }
        }
    }

    /// Give up the well-known name `name`. Returns whether it was owned.
    pub async fn release_name(&self, name: &str) -> Result<bool, BusError> {
        check_bus_name(name)?;
        let reply = self.bus().release_name(name).await?;
        self.inner.names.write().remove(name);
        Ok(reply == ReleaseNameReply::Released)
    }

    /// Make `interface` available to dynamic proxies.
    pub fn register_interface(&self, interface: InterfaceDescriptor) {
        self.inner
            .interfaces
            .write()
            .insert(interface.name().to_string(), interface);
    }

    /// Descriptor registered under `name`.
    #[must_use]
    pub fn registered_interface(&self, name: &str) -> Option<InterfaceDescriptor> {
        self.inner.interfaces.read().get(name).cloned()
    }

    /// Run `handler` for every signal selected by `key`.
    ///
    /// On bus connections the first handler of a key adds the equivalent
    /// match rule on the daemon.
    pub async fn add_signal_handler<F>(&self, key: SignalKey, handler: F) -> Result<HandlerId, BusError>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let (id, first) = self.inner.signals.add(key.clone(), Arc::new(handler));
        if first && self.needs_match_rule(&key) {
            if let Err(error) = self.bus().add_match(&key.match_rule().to_string()).await {
                self.inner.signals.remove(id);
                return Err(error);
            }
        }
        trace!(?id, interface = key.interface(), member = key.member(), "signal handler added");
        Ok(id)
    }

    /// Remove a signal handler. Returns whether it was registered.
    pub async fn remove_signal_handler(&self, id: HandlerId) -> Result<bool, BusError> {
        let Some((key, last)) = self.inner.signals.remove(id) else {
            return Ok(false);
        };
        if last && self.needs_match_rule(&key) && self.is_connected() {
            self.bus()
                .remove_match(&key.match_rule().to_string())
                .await?;
        }
        Ok(true)
    }

    fn needs_match_rule(&self, key: &SignalKey) -> bool {
        !self.inner.peer_to_peer && key.interface() != LOCAL_INTERFACE
    }

    /// Export `object` at `path`.
    pub fn export(&self, path: &str, object: Arc<dyn BusObject>) -> Result<(), BusError> {
        self.inner.objects.export(ObjectPath::new(path)?, object)
    }

    /// Export `object` at `path` until the returned lease is dropped.
    pub fn export_leased(
        &self,
        path: &str,
        object: Arc<dyn BusObject>,
    ) -> Result<ExportLease, BusError> {
        let path = ObjectPath::new(path)?;
        let entry = self.inner.objects.export_entry(path.clone(), object)?;
        Ok(ExportLease::new(&self.inner.objects, path, entry))
    }

    /// Remove the object exported at `path`. Returns whether one was.
    pub fn unexport(&self, path: &str) -> Result<bool, BusError> {
        Ok(self.inner.objects.unexport(&ObjectPath::new(path)?))
    }

    /// Serve every path under `prefix` that has no exact export.
    pub fn add_fallback(&self, prefix: &str, object: Arc<dyn BusObject>) -> Result<(), BusError> {
        self.inner.objects.add_fallback(ObjectPath::new(prefix)?, object)
    }

    /// Remove the fallback at `prefix`. Returns whether one was registered.
    pub fn remove_fallback(&self, prefix: &str) -> Result<bool, BusError> {
        Ok(self.inner.objects.remove_fallback(&ObjectPath::new(prefix)?))
    }

    /// Proxy for `interface` of the object at `path`, owned by `destination`.
    ///
    /// `destination` is `None` on peer-to-peer connections.
    pub fn proxy(
        &self,
        destination: Option<&str>,
        path: &str,
        interface: &str,
    ) -> Result<Proxy, BusError> {
        Proxy::new(self.clone(), destination, path, Some(interface))
    }

    /// Proxy bound to the first interface of the remote object that has
    /// been registered with [`Connection::register_interface`].
    pub async fn dynamic_proxy(
        &self,
        destination: Option<&str>,
        path: &str,
    ) -> Result<Proxy, BusError> {
        Proxy::resolve(self.clone(), destination, path).await
    }
}

fn expect_call(message: &Message) -> Result<(), BusError> {
    if message.message_type() == MessageType::MethodCall {
        Ok(())
    } else {
        Err(BusError::InvalidArgs(format!(
            "expected a method call, got a {} message",
            message.message_type()
        )))
    }
}

fn join_addresses(addresses: &[BusAddress]) -> String {
    addresses
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(";")
}

fn acquire_shared(key: &str) -> Option<Connection> {
    let mut shared = SHARED.lock();
    let entry = shared.get_mut(key)?;
    if entry.connection.is_connected() {
        entry.refs += 1;
        return Some(entry.connection.clone());
    }
    shared.remove(key);
    None
}

impl ConnectionInner {
    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock();
        if *current != ConnectionState::Disconnected {
            *current = state;
        }
    }

    /// Assign a serial, register the pending call and queue the message,
    /// all under the serial lock.
    fn send_with(&self, mut message: Message, pending: Option<PendingCall>) -> Result<u32, BusError> {
        if *self.state.lock() == ConnectionState::Disconnected {
            return Err(BusError::Disconnected);
        }
        let mut serial = self.serial.lock();
        *serial = serial.wrapping_add(1).max(1);
        let assigned = *serial;
        message.set_serial(assigned);
        if let Some(call) = pending {
            if self.pending.insert(assigned, call).is_err() {
                return Err(BusError::Disconnected);
            }
        }
        if self.outbound.send(message).is_err() {
            self.pending.take(assigned);
            return Err(BusError::Disconnected);
        }
        trace!(serial = assigned, "message queued");
        Ok(assigned)
    }

    /// Complete a pending call on the appropriate side.
    fn complete(&self, call: PendingCall, outcome: Result<Message, BusError>) {
        match call {
            PendingCall::Waiter(tx) => {
                let _ = tx.send(outcome);
            }
            PendingCall::Callback { on_reply, on_error } => {
                self.workers.submit(async move {
                    match outcome {
                        Ok(reply) => on_reply(reply),
                        Err(error) => on_error(error),
                    }
                });
            }
        }
    }

    fn push_unmatched_error(&self, message: Message) {
        let capacity = self.config.connection.pending_errors_capacity.max(1);
        let mut errors = self.pending_errors.lock();
        while errors.len() >= capacity {
            errors.pop_front();
        }
        errors.push_back(message);
    }

    /// Tear the connection down. Runs once; later calls do nothing.
    fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Disconnected {
                return;
            }
            *state = ConnectionState::Disconnected;
        }
        info!(unique_name = ?self.unique_name.read().as_deref(), "connection closing");

        self.deliver_disconnected();
        for (serial, call) in self.pending.drain() {
            trace!(serial, "failing pending call");
            self.complete(call, Err(BusError::Disconnected));
        }
        self.cancel.cancel();
        self.workers.shutdown();

        if let Some(key) = &self.shared_key {
            let mut shared = SHARED.lock();
            let ours = shared
                .get(key)
                .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(&entry.connection.inner), self));
            if ours {
                shared.remove(key);
            }
        }
    }
}

async fn write_loop(
    mut sink: FramedWrite<WriteHalf<BoxedTransport>, MessageCodec>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    inner: Weak<ConnectionInner>,
    cancel: CancellationToken,
) {
    trace!("writer started");
    loop {
        let message = tokio::select! {
            biased;

            () = cancel.cancelled() => break,
            message = outbound.recv() => message,
        };
        let Some(message) = message else {
            break;
        };
        let serial = message.serial();
        match sink.send(message).await {
            Ok(()) => trace!(serial, "message written"),
            Err(BusError::Io(error)) => {
                error!(serial, %error, "write failed");
                if let Some(inner) = inner.upgrade() {
                    inner.shutdown();
                }
                break;
            }
            Err(error) => {
                warn!(serial, %error, "message could not be encoded");
                if let Some(inner) = inner.upgrade() {
                    if let Some(call) = inner.pending.take(serial) {
                        inner.complete(call, Err(error));
                    }
                }
            }
        }
    }
    let _ = sink.close().await;
    trace!("writer stopped");
}

/// Fail the callback call `serial` if it is still pending after `timeout`.
async fn expire_callback(
    inner: Weak<ConnectionInner>,
    serial: u32,
    timeout: Duration,
    cancel: CancellationToken,
) {
    tokio::select! {
        () = tokio::time::sleep(timeout) => {}
        () = cancel.cancelled() => return,
    }
    let Some(inner) = inner.upgrade() else {
        return;
    };
    if let Some(call) = inner.pending.take(serial) {
        debug!(serial, ?timeout, "callback call timed out");
        inner.complete(call, Err(BusError::Timeout(timeout)));
    }
}

async fn read_loop(
    mut stream: FramedRead<ReadHalf<BoxedTransport>, MessageCodec>,
    weak: Weak<ConnectionInner>,
    cancel: CancellationToken,
) {
    trace!("reader started");
    loop {
        let next = tokio::select! {
            biased;

            () = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        let Some(inner) = weak.upgrade() else {
            break;
        };
        match next {
            Some(Ok(Frame::Message(message))) => inner.route(message),
            Some(Ok(Frame::Malformed { serial, error })) => {
                warn!(serial, %error, "dropping malformed message");
            }
            Some(Err(error)) => {
                error!(%error, "fatal protocol error");
                inner.shutdown();
                break;
            }
            None => {
                debug!("connection closed by peer");
                inner.shutdown();
                break;
            }
        }
    }
    trace!("reader stopped");
}

#[cfg(test)]
mod tests {
    use ferrobus_core::IntoValue;
    use tokio::net::UnixStream;

    use super::*;

    fn test_config() -> BusConfig {
        let mut config = BusConfig::default();
        config.timeouts.call = 5_000;
        config.connection.pending_errors_capacity = 2;
        config
    }

    async fn pair() -> (Connection, Connection) {
        let (a, b) = UnixStream::pair().unwrap();
        let left = ConnectionBuilder::new()
            .peer_to_peer(true)
            .config(test_config())
            .build_with_stream(a)
            .await
            .unwrap();
        let right = ConnectionBuilder::new()
            .peer_to_peer(true)
            .config(test_config())
            .build_with_stream(b)
            .await
            .unwrap();
        (left, right)
    }

    #[tokio::test]
    async fn test_serials_increase_monotonically() {
        let (left, _right) = pair().await;
        let mut last = 0;
        for _ in 0..50 {
            let signal = Message::signal("/s", "org.example.Sensor", "Tick")
                .unwrap()
                .build()
                .unwrap();
            let serial = left.send_no_reply(signal).unwrap();
            assert!(serial > last);
            last = serial;
        }
    }

    #[tokio::test]
    async fn test_peer_ping_and_machine_id() {
        let (left, right) = pair().await;
        assert_eq!(left.state(), ConnectionState::Running);
        let ping = Message::method_call("/", "Ping")
            .unwrap()
            .interface("org.freedesktop.DBus.Peer")
            .unwrap()
            .build()
            .unwrap();
        assert!(left.call(ping).await.unwrap().body().is_empty());

        let id = Message::method_call("/anything", "GetMachineId")
            .unwrap()
            .interface("org.freedesktop.DBus.Peer")
            .unwrap()
            .build()
            .unwrap();
        let reply = left.call(id).await.unwrap();
        assert_eq!(reply.body()[0].as_str(), Some(right.inner.machine_id.as_str()));
    }

    #[tokio::test]
    async fn test_unmatched_errors_are_bounded() {
        let (left, right) = pair().await;
        for serial in 1..=3_u32 {
            let error = Message::error_to(serial + 100, None, "org.example.Error.Stray", "stray")
                .unwrap()
                .build()
                .unwrap();
            right.send_no_reply(error).unwrap();
        }
        let ping = Message::method_call("/", "Ping")
            .unwrap()
            .interface("org.freedesktop.DBus.Peer")
            .unwrap()
            .build()
            .unwrap();
        right.call(ping.clone()).await.unwrap();
        left.call(ping).await.unwrap();

        let first = left.take_error().unwrap();
        assert_eq!(first.reply_serial(), Some(102));
        assert_eq!(left.take_error().unwrap().reply_serial(), Some(103));
        assert!(left.take_error().is_none());
    }

    #[tokio::test]
    async fn test_calls_after_disconnect_fail() {
        let (left, _right) = pair().await;
        left.disconnect();
        assert_eq!(left.state(), ConnectionState::Disconnected);
        let call = Message::method_call("/", "Ping").unwrap().build().unwrap();
        assert!(matches!(left.call(call).await, Err(BusError::Disconnected)));
        left.wait_closed().await;
    }

    #[tokio::test]
    async fn test_only_method_calls_can_be_awaited() {
        let (left, _right) = pair().await;
        let signal = Message::signal("/s", "org.example.Sensor", "Tick")
            .unwrap()
            .arg(1_i32.into_value())
            .build()
            .unwrap();
        assert!(matches!(left.call(signal).await, Err(BusError::InvalidArgs(_))));
    }

    #[tokio::test]
    async fn test_worker_count_is_adjustable() {
        let (left, _right) = pair().await;
        assert_eq!(left.worker_count(), 4);
        left.set_worker_count(2);
        assert_eq!(left.worker_count(), 2);
    }
}
