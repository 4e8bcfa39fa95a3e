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

//! Routing of incoming messages.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, trace, warn};

use ferrobus_core::bus::{DISCONNECTED, NAME_ACQUIRED, NAME_LOST};
use ferrobus_core::error::names::FAILED;
use ferrobus_core::names::{
    is_valid_error_name, BUS_INTERFACE, BUS_NAME, INTROSPECTABLE_INTERFACE, LOCAL_INTERFACE,
    LOCAL_PATH, PEER_INTERFACE,
};
use ferrobus_core::{BusError, Message, MessageType, MethodError, Value};

use super::{Connection, ConnectionInner};
use crate::object::CallContext;

impl ConnectionInner {
    /// Route one decoded message. Runs on the reader task.
    pub(super) fn route(self: &Arc<Self>, message: Message) {
        trace!(
            serial = message.serial(),
            kind = %message.message_type(),
            member = ?message.member(),
            "message received"
        );
        match message.message_type() {
            MessageType::MethodReturn | MessageType::Error => self.route_reply(message),
            MessageType::Signal => self.route_signal(message),
            MessageType::MethodCall => self.route_call(message),
        }
    }

    fn route_reply(&self, message: Message) {
        let Some(reply_serial) = message.reply_serial() else {
            return;
        };
        match self.pending.take(reply_serial) {
            Some(call) => {
                let outcome = if message.message_type() == MessageType::Error {
                    Err(message.to_bus_error())
                } else {
                    Ok(message)
                };
                self.complete(call, outcome);
            }
            None if message.message_type() == MessageType::Error => {
                debug!(
                    reply_serial,
                    error_name = ?message.error_name(),
                    "error reply matches no pending call"
                );
                self.push_unmatched_error(message);
            }
            None => {
                debug!(reply_serial, "reply matches no pending call, dropped");
            }
        }
    }

    fn route_signal(&self, message: Message) {
        self.track_names(&message);
        let handlers = self.signals.matching(&message);
        if handlers.is_empty() {
            trace!(member = ?message.member(), "no handler for signal");
            return;
        }
        for handler in handlers {
            let message = message.clone();
            self.workers.submit(async move { handler(message) });
        }
    }

    fn track_names(&self, message: &Message) {
        if message.sender() != Some(BUS_NAME) || message.interface() != Some(BUS_INTERFACE) {
            return;
        }
        let Some(Value::String(name)) = message.body().first() else {
            return;
        };
        match message.member() {
            Some(NAME_ACQUIRED) => {
                let unique = self.unique_name.read().clone();
                if unique.as_deref() != Some(name.as_str()) {
                    self.names.write().insert(name.clone());
                }
            }
            Some(NAME_LOST) => {
                self.names.write().remove(name);
            }
            _ => {}
        }
    }

    /// Hand the local `Disconnected` signal to its handlers.
    pub(super) fn deliver_disconnected(&self) {
        match Message::signal(LOCAL_PATH, LOCAL_INTERFACE, DISCONNECTED).and_then(|b| b.build()) {
            Ok(signal) => self.route_signal(signal),
            Err(error) => warn!(%error, "could not build the Disconnected signal"),
        }
    }

    fn route_call(self: &Arc<Self>, call: Message) {
        let (Some(path), Some(member)) = (call.path().cloned(), call.member().map(str::to_string))
        else {
            return;
        };
        let interface = call.interface().map(str::to_string);

        if let Some(reply) = self.builtin_reply(&call, &path, interface.as_deref(), &member) {
            self.reply(&call, reply);
            return;
        }

        let Some(exported) = self.objects.lookup(&path) else {
            self.reply(
                &call,
                Err(BusError::UnknownObject(format!(
                    "{path} is not an object provided by this process."
                ))
                .into()),
            );
            return;
        };

        let signature = call.signature().clone();
        let resolved = match exported.resolve(
            interface.as_deref(),
            &member,
            &signature,
            call.body().to_vec(),
        ) {
            Ok(resolved) => resolved,
            Err(error) => {
                debug!(%path, member, %error, "call not dispatched");
                self.reply(&call, Err(error.into()));
                return;
            }
        };

        let ctx = CallContext {
            sender: call.sender().map(str::to_string),
            path,
            interface,
            member: member.clone(),
            serial: call.serial(),
            no_reply_expected: call.no_reply_expected(),
            connection: Connection {
                inner: Arc::clone(self),
            },
        };
        let object = Arc::clone(&exported.object);
        let inner = Arc::downgrade(self);
        self.workers.submit(async move {
            let qualified = format!("{}.{member}", resolved.interface);
            let outcome = AssertUnwindSafe(object.invoke(ctx, &resolved.interface, &member, resolved.args))
                .catch_unwind()
                .await;
            let outcome = match outcome {
                Ok(Ok(values)) => Ok(values),
                Ok(Err(fault)) if is_valid_error_name(&fault.name) => Err(fault),
                Ok(Err(fault)) => Err(execution_failure(&qualified, &fault.message)),
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    warn!(method = %qualified, reason, "method handler panicked");
                    Err(execution_failure(&qualified, &reason))
                }
            };
            if let Some(inner) = inner.upgrade() {
                inner.reply(&call, outcome);
            }
        });
    }

    /// Replies for the Peer and Introspectable interfaces every path implements.
    fn builtin_reply(
        &self,
        call: &Message,
        path: &ferrobus_core::ObjectPath,
        interface: Option<&str>,
        member: &str,
    ) -> Option<Result<Vec<Value>, MethodError>> {
        let declared_elsewhere = || {
            interface.is_none()
                && self
                    .objects
                    .lookup(path)
                    .is_some_and(|object| object.declares(member))
        };
        match (interface, member) {
            (Some(PEER_INTERFACE) | None, "Ping") if !declared_elsewhere() => Some(Ok(Vec::new())),
            (Some(PEER_INTERFACE) | None, "GetMachineId") if !declared_elsewhere() => {
                Some(Ok(vec![Value::String(self.machine_id.clone())]))
            }
            (Some(INTROSPECTABLE_INTERFACE) | None, "Introspect") if !declared_elsewhere() => {
                trace!(%path, serial = call.serial(), "introspection requested");
                Some(match self.objects.introspect(path) {
                    Some(xml) => Ok(vec![Value::String(xml)]),
                    None => Err(BusError::UnknownObject(format!(
                        "{path} is not an object provided by this process."
                    ))
                    .into()),
                })
            }
            (Some(PEER_INTERFACE), _) => Some(Err(BusError::UnknownMethod(format!(
                "The method `{PEER_INTERFACE}.{member}' does not exist on this object."
            ))
            .into())),
            _ => None,
        }
    }

    /// Send the reply to `call`, unless the caller asked for none.
    fn reply(&self, call: &Message, outcome: Result<Vec<Value>, MethodError>) {
        if call.no_reply_expected() {
            trace!(serial = call.serial(), "reply suppressed");
            return;
        }
        let reply = match outcome {
            Ok(values) => Message::method_return(call).body(values).build(),
            Err(fault) => Message::error(call, &fault.name, &fault.message).and_then(|b| b.build()),
        };
        match reply.and_then(|reply| self.send_with(reply, None)) {
            Ok(serial) => trace!(serial, reply_serial = call.serial(), "reply queued"),
            Err(error) => debug!(reply_serial = call.serial(), %error, "reply not sent"),
        }
    }
}

fn execution_failure(method: &str, message: &str) -> MethodError {
    MethodError::new(FAILED, format!("Error Executing Method {method}: {message}"))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string())
}
