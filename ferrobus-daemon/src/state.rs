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

//! Shared daemon state and message routing.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use ferrobus_core::bus::{NAME_ACQUIRED, NAME_LOST, NAME_OWNER_CHANGED};
use ferrobus_core::names::{BUS_INTERFACE, BUS_NAME, BUS_PATH};
use ferrobus_core::{BusConfig, BusError, Message, MessageType, Value};

use crate::listener::DaemonStats;
use crate::matches::MatchRegistry;
use crate::names::NameRegistry;
use crate::peer::{Peer, PeerId};

/// A message together with the peer it came from or goes to.
pub(crate) type Envelope = (Message, Weak<Peer>);

/// Everything the daemon tasks share.
///
/// Locks are always taken in the order peers, names, matches, outbound and
/// never held across an `.await`.
#[derive(Debug)]
pub(crate) struct BusState {
    pub(crate) config: BusConfig,
    pub(crate) guid: String,
    pub(crate) stats: Arc<DaemonStats>,
    pub(crate) peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    pub(crate) names: RwLock<NameRegistry>,
    pub(crate) matches: MatchRegistry,
    inbound: mpsc::UnboundedSender<Envelope>,
    local: mpsc::UnboundedSender<Envelope>,
    outbound: mpsc::UnboundedSender<Envelope>,
    next_peer: AtomicU64,
    next_unique: AtomicU64,
    serial: AtomicU32,
}

/// Receiving ends of the daemon queues, consumed by the daemon tasks.
pub(crate) struct Queues {
    pub(crate) inbound: mpsc::UnboundedReceiver<Envelope>,
    pub(crate) local: mpsc::UnboundedReceiver<Envelope>,
    pub(crate) outbound: mpsc::UnboundedReceiver<Envelope>,
}

impl BusState {
    pub(crate) fn new(config: BusConfig, guid: String) -> (Arc<Self>, Queues) {
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (local, local_rx) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Self {
            config,
            guid,
            stats: Arc::new(DaemonStats::new()),
            peers: RwLock::new(HashMap::new()),
            names: RwLock::new(NameRegistry::default()),
            matches: MatchRegistry::default(),
            inbound,
            local,
            outbound,
            next_peer: AtomicU64::new(1),
            next_unique: AtomicU64::new(1),
            serial: AtomicU32::new(0),
        });
        let queues = Queues {
            inbound: inbound_rx,
            local: local_rx,
            outbound: outbound_rx,
        };
        (state, queues)
    }

    pub(crate) fn next_peer_id(&self) -> PeerId {
        self.next_peer.fetch_add(1, Ordering::Relaxed)
    }

    /// Next unique name, `:1.1` first.
    pub(crate) fn next_unique_name(&self) -> String {
        format!(":1.{}", self.next_unique.fetch_add(1, Ordering::Relaxed))
    }

    fn next_serial(&self) -> u32 {
        loop {
            let serial = self.serial.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if serial != 0 {
                return serial;
            }
        }
    }

    pub(crate) fn add_peer(&self, peer: Arc<Peer>) {
        self.peers.write().insert(peer.id(), peer);
    }

    pub(crate) fn peer(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.read().get(&id).cloned()
    }

    /// Peer owning `name`, unique or well-known.
    pub(crate) fn owner_of(&self, name: &str) -> Option<Arc<Peer>> {
        let peers = self.peers.read();
        let owner = self.names.read().owner(name)?;
        peers.get(&owner).cloned()
    }

    /// Hand a message read from `from` to the dispatcher.
    pub(crate) fn receive(&self, message: Message, from: Weak<Peer>) {
        if self.inbound.send((message, from)).is_err() {
            trace!("dispatcher stopped, dropping message");
        }
    }

    /// Route one message from a peer. Runs on the dispatcher task.
    pub(crate) fn dispatch(&self, mut message: Message, from: Weak<Peer>) {
        let Some(peer) = from.upgrade().filter(|peer| !peer.is_closed()) else {
            trace!(serial = message.serial(), "sender gone, message dropped");
            return;
        };
        let Some(unique) = peer.unique_name() else {
            if is_hello(&message) {
                self.to_local(message, from);
            } else {
                debug!(peer = peer.id(), member = ?message.member(), "message before Hello");
                self.reject(
                    &peer,
                    &message,
                    &BusError::AccessDenied("You must send a Hello message".to_string()),
                );
            }
            return;
        };
        message.set_sender(unique);

        match message.destination().map(str::to_string) {
            Some(destination) if destination == BUS_NAME => self.to_local(message, from),
            None if message.message_type() == MessageType::Signal => self.broadcast(message, &peer),
            None => {
                debug!(peer = peer.id(), kind = %message.message_type(), "message without destination");
                self.reject(
                    &peer,
                    &message,
                    &BusError::ServiceUnknown("Message has no destination".to_string()),
                );
            }
            Some(destination) => match self.owner_of(&destination) {
                Some(target) => {
                    trace!(
                        serial = message.serial(),
                        from = peer.id(),
                        to = target.id(),
                        "routing message"
                    );
                    self.send(message, &target);
                    self.stats.messages_routed.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    debug!(destination, "destination has no owner");
                    self.reject(
                        &peer,
                        &message,
                        &BusError::ServiceUnknown(format!("The name `{destination}' does not exist")),
                    );
                }
            },
        }
    }

    fn to_local(&self, message: Message, from: Weak<Peer>) {
        if self.local.send((message, from)).is_err() {
            warn!("bus driver stopped, dropping message");
        }
    }

    /// Signal to every peer whose match rules select it.
    fn broadcast(&self, message: Message, sender: &Peer) {
        let sender_names: HashSet<String> =
            self.names.read().owned_by(sender.id()).into_iter().collect();
        let recipients =
            self.matches
                .recipients(&message, self.config.daemon.match_policy, &sender_names);
        trace!(
            serial = message.serial(),
            member = ?message.member(),
            recipients = recipients.len(),
            "broadcasting signal"
        );
        for id in recipients {
            if let Some(target) = self.peer(id) {
                self.send(message.clone(), &target);
                self.stats.messages_routed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Answer `call` with `error` unless the caller asked for no reply.
    pub(crate) fn reject(&self, peer: &Arc<Peer>, call: &Message, error: &BusError) {
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        if call.message_type() != MessageType::MethodCall || call.no_reply_expected() {
            return;
        }
        match Message::error(call, error.error_name(), &error.error_message())
            .and_then(|builder| builder.build())
        {
            Ok(reply) => self.send_from_bus(reply, peer),
            Err(build_error) => warn!(%build_error, "could not build error reply"),
        }
    }

    /// Queue `message` for `peer` as is.
    pub(crate) fn send(&self, message: Message, peer: &Arc<Peer>) {
        if self.outbound.send((message, Arc::downgrade(peer))).is_err() {
            trace!(peer = peer.id(), "sender stopped, dropping message");
        }
    }

    /// Queue a message originating from the bus itself.
    pub(crate) fn send_from_bus(&self, mut message: Message, peer: &Arc<Peer>) {
        message.set_sender(BUS_NAME);
        message.set_serial(self.next_serial());
        self.send(message, peer);
    }

    /// Signal of the bus interface, addressed to `destination` when given.
    pub(crate) fn bus_signal(
        member: &str,
        destination: Option<&str>,
        args: Vec<Value>,
    ) -> Result<Message, BusError> {
        let mut builder = Message::signal(BUS_PATH, BUS_INTERFACE, member)?.body(args);
        if let Some(destination) = destination {
            builder = builder.destination(destination)?;
        }
        builder.build()
    }

    /// Send a bus signal to every peer that has completed `Hello`.
    pub(crate) fn announce(&self, signal: &Message) {
        let peers: Vec<Arc<Peer>> = self
            .peers
            .read()
            .values()
            .filter(|peer| peer.unique_name().is_some() && !peer.is_closed())
            .cloned()
            .collect();
        for peer in peers {
            self.send_from_bus(signal.clone(), &peer);
        }
    }

    /// Tell `peer` it gained or lost `name`.
    pub(crate) fn notify_name(&self, peer: &Arc<Peer>, member: &str, name: &str) {
        let destination = peer.unique_name();
        match Self::bus_signal(member, destination.as_deref(), vec![Value::String(name.to_string())]) {
            Ok(signal) => self.send_from_bus(signal, peer),
            Err(error) => warn!(%error, member, "could not build name signal"),
        }
    }

    /// Broadcast `NameOwnerChanged(name, old, new)`.
    pub(crate) fn owner_changed(&self, name: &str, old: &str, new: &str) {
        let args = vec![
            Value::String(name.to_string()),
            Value::String(old.to_string()),
            Value::String(new.to_string()),
        ];
        match Self::bus_signal(NAME_OWNER_CHANGED, None, args) {
            Ok(signal) => self.announce(&signal),
            Err(error) => warn!(%error, "could not build NameOwnerChanged"),
        }
    }

    /// Remove `peer` from the bus: its names are released with
    /// `NameOwnerChanged` broadcasts and its match rules dropped.
    pub(crate) fn teardown(&self, peer: &Arc<Peer>) {
        if !peer.close() {
            return;
        }
        let removed = self.peers.write().remove(&peer.id()).is_some();
        let released = self.names.write().release_all(peer.id());
        let rules = self.matches.remove_peer(peer.id());
        if removed {
            self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        }

        let unique = peer.unique_name().unwrap_or_default();
        for name in released.iter().filter(|name| **name != unique) {
            self.owner_changed(name, &unique, "");
        }
        if !unique.is_empty() {
            self.owner_changed(&unique, &unique, "");
        }
        info!(
            peer = peer.id(),
            unique_name = %unique,
            released = released.len(),
            rules,
            "peer disconnected"
        );
    }

    pub(crate) fn acquired(&self, peer: &Arc<Peer>, name: &str) {
        self.notify_name(peer, NAME_ACQUIRED, name);
    }

    pub(crate) fn lost(&self, peer: &Arc<Peer>, name: &str) {
        self.notify_name(peer, NAME_LOST, name);
    }
}

fn is_hello(message: &Message) -> bool {
    message.message_type() == MessageType::MethodCall
        && message.destination() == Some(BUS_NAME)
        && message.member() == Some("Hello")
        && message.interface().map_or(true, |interface| interface == BUS_INTERFACE)
}
