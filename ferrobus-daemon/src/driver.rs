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

//! The `org.freedesktop.DBus` object served by the daemon itself.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use ferrobus_core::bus::{machine_id, RequestNameReply, ReleaseNameReply};
use ferrobus_core::error::names::{
    FAILED, MATCH_RULE_INVALID, MATCH_RULE_NOT_FOUND, NAME_HAS_NO_OWNER,
};
use ferrobus_core::names::{
    is_unique_name, is_valid_bus_name, BUS_INTERFACE, BUS_NAME, INTROSPECTABLE_INTERFACE,
    PEER_INTERFACE,
};
use ferrobus_core::{BusError, FromReply, IntoArgs, MatchRule, Message, MessageType, Value};

use crate::names::Acquisition;
use crate::peer::Peer;
use crate::state::BusState;

const INTROSPECTION: &str = r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">
<node>
  <interface name="org.freedesktop.DBus.Introspectable">
    <method name="Introspect">
      <arg name="data" direction="out" type="s"/>
    </method>
  </interface>
  <interface name="org.freedesktop.DBus.Peer">
    <method name="Ping"/>
    <method name="GetMachineId">
      <arg name="machine_uuid" direction="out" type="s"/>
    </method>
  </interface>
  <interface name="org.freedesktop.DBus">
    <method name="Hello">
      <arg direction="out" type="s"/>
    </method>
    <method name="RequestName">
      <arg direction="in" type="s"/>
      <arg direction="in" type="u"/>
      <arg direction="out" type="u"/>
    </method>
    <method name="ReleaseName">
      <arg direction="in" type="s"/>
      <arg direction="out" type="u"/>
    </method>
    <method name="StartServiceByName">
      <arg direction="in" type="s"/>
      <arg direction="in" type="u"/>
      <arg direction="out" type="u"/>
    </method>
    <method name="NameHasOwner">
      <arg direction="in" type="s"/>
      <arg direction="out" type="b"/>
    </method>
    <method name="ListNames">
      <arg direction="out" type="as"/>
    </method>
    <method name="ListActivatableNames">
      <arg direction="out" type="as"/>
    </method>
    <method name="ListQueuedOwners">
      <arg direction="in" type="s"/>
      <arg direction="out" type="as"/>
    </method>
    <method name="AddMatch">
      <arg direction="in" type="s"/>
    </method>
    <method name="RemoveMatch">
      <arg direction="in" type="s"/>
    </method>
    <method name="GetNameOwner">
      <arg direction="in" type="s"/>
      <arg direction="out" type="s"/>
    </method>
    <method name="GetConnectionUnixUser">
      <arg direction="in" type="s"/>
      <arg direction="out" type="u"/>
    </method>
    <method name="GetConnectionUnixProcessID">
      <arg direction="in" type="s"/>
      <arg direction="out" type="u"/>
    </method>
    <method name="GetId">
      <arg direction="out" type="s"/>
    </method>
    <method name="ReloadConfig"/>
    <signal name="NameOwnerChanged">
      <arg type="s"/>
      <arg type="s"/>
      <arg type="s"/>
    </signal>
    <signal name="NameLost">
      <arg type="s"/>
    </signal>
    <signal name="NameAcquired">
      <arg type="s"/>
    </signal>
  </interface>
</node>
"#;

/// Work queued behind a reply, so the caller sees the reply first.
enum FollowUp {
    Acquired(String),
    Lost(String),
    OwnerChanged {
        name: String,
        old: String,
        new: String,
    },
}

fn no_owner(name: &str) -> BusError {
    BusError::Execution {
        name: NAME_HAS_NO_OWNER.to_string(),
        message: format!("Could not get owner of name '{name}': no such name"),
    }
}

impl BusState {
    /// Serve one call addressed to the bus. Runs on the loopback task.
    pub(crate) fn serve(&self, call: &Message, peer: &Arc<Peer>) {
        if call.message_type() != MessageType::MethodCall {
            trace!(kind = %call.message_type(), "ignoring non-call message to the bus");
            return;
        }
        let member = call.member().unwrap_or_default();
        trace!(peer = peer.id(), member, serial = call.serial(), "bus call");

        let mut follow_ups = Vec::new();
        let outcome = self.invoke(call, peer, member, &mut follow_ups);
        match outcome {
            Ok(body) if !call.no_reply_expected() => {
                match Message::method_return(call).body(body).build() {
                    Ok(mut reply) => {
                        if let Some(unique) = peer.unique_name() {
                            reply.set_destination(unique);
                        }
                        self.send_from_bus(reply, peer);
                    }
                    Err(error) => warn!(%error, member, "could not build bus reply"),
                }
            }
            Ok(_) => {}
            Err(error) => {
                debug!(member, %error, "bus call failed");
                self.reject(peer, call, &error);
            }
        }

        for follow_up in follow_ups {
            match follow_up {
                FollowUp::Acquired(name) => self.acquired(peer, &name),
                FollowUp::Lost(name) => self.lost(peer, &name),
                FollowUp::OwnerChanged { name, old, new } => self.owner_changed(&name, &old, &new),
            }
        }
    }

    fn invoke(
        &self,
        call: &Message,
        peer: &Arc<Peer>,
        member: &str,
        follow_ups: &mut Vec<FollowUp>,
    ) -> Result<Vec<Value>, BusError> {
        let args = call.body().to_vec();
        match (call.interface(), member) {
            (Some(INTROSPECTABLE_INTERFACE) | None, "Introspect") => {
                Ok((INTROSPECTION,).into_args())
            }
            (Some(PEER_INTERFACE) | None, "Ping") => Ok(Vec::new()),
            (Some(PEER_INTERFACE) | None, "GetMachineId") => Ok((machine_id(),).into_args()),
            (Some(BUS_INTERFACE) | None, _) => self.invoke_bus(peer, member, args, follow_ups),
            (Some(interface), _) => Err(BusError::UnknownMethod(format!(
                "The method `{interface}.{member}' does not exist on this object."
            ))),
        }
    }

    fn invoke_bus(
        &self,
        peer: &Arc<Peer>,
        member: &str,
        args: Vec<Value>,
        follow_ups: &mut Vec<FollowUp>,
    ) -> Result<Vec<Value>, BusError> {
        match member {
            "Hello" => self.hello(peer, follow_ups).map(|unique| (unique,).into_args()),
            "RequestName" => {
                let (name, _flags) = <(String, u32)>::from_reply(args)?;
                self.request_name(peer, &name, follow_ups)
                    .map(|reply| (reply as u32,).into_args())
            }
            "ReleaseName" => {
                let (name,) = <(String,)>::from_reply(args)?;
                self.release_name(peer, &name, follow_ups)
                    .map(|reply| (reply as u32,).into_args())
            }
            "ListNames" => {
                let mut names = vec![BUS_NAME.to_string()];
                names.extend(self.names.read().names());
                Ok((names,).into_args())
            }
            "ListActivatableNames" => Ok((vec![BUS_NAME.to_string()],).into_args()),
            "ListQueuedOwners" => {
                let (name,) = <(String,)>::from_reply(args)?;
                let owner = self.unique_owner(&name).ok_or_else(|| no_owner(&name))?;
                Ok((vec![owner],).into_args())
            }
            "NameHasOwner" => {
                let (name,) = <(String,)>::from_reply(args)?;
                Ok((self.unique_owner(&name).is_some(),).into_args())
            }
            "GetNameOwner" => {
                let (name,) = <(String,)>::from_reply(args)?;
                let owner = self.unique_owner(&name).ok_or_else(|| no_owner(&name))?;
                Ok((owner,).into_args())
            }
            "AddMatch" => {
                let (text,) = <(String,)>::from_reply(args)?;
                let rule = parse_rule(&text)?;
                self.matches.add(peer.id(), rule);
                Ok(Vec::new())
            }
            "RemoveMatch" => {
                let (text,) = <(String,)>::from_reply(args)?;
                let rule = parse_rule(&text)?;
                if self.matches.remove(peer.id(), &rule) {
                    Ok(Vec::new())
                } else {
                    Err(BusError::Execution {
                        name: MATCH_RULE_NOT_FOUND.to_string(),
                        message: format!("The given match rule wasn't found: {text}"),
                    })
                }
            }
            "GetConnectionUnixUser" => {
                let (name,) = <(String,)>::from_reply(args)?;
                let credentials = self.credentials_of(&name)?;
                credentials
                    .uid
                    .map(|uid| (uid,).into_args())
                    .ok_or_else(|| unavailable("unix user", &name))
            }
            "GetConnectionUnixProcessID" => {
                let (name,) = <(String,)>::from_reply(args)?;
                let credentials = self.credentials_of(&name)?;
                credentials
                    .pid
                    .map(|pid| (pid,).into_args())
                    .ok_or_else(|| unavailable("process id", &name))
            }
            "GetId" => Ok((self.guid.clone(),).into_args()),
            "ReloadConfig" => {
                info!("configuration reload requested; settings are fixed at startup");
                Ok(Vec::new())
            }
            "StartServiceByName" => {
                let (name, _flags) = <(String, u32)>::from_reply(args)?;
                Err(BusError::ServiceUnknown(format!(
                    "The name {name} was not provided by any .service files"
                )))
            }
            other => Err(BusError::UnknownMethod(format!(
                "The method `{BUS_INTERFACE}.{other}' does not exist on this object."
            ))),
        }
    }

    fn hello(&self, peer: &Arc<Peer>, follow_ups: &mut Vec<FollowUp>) -> Result<String, BusError> {
        if peer.unique_name().is_some() {
            return Err(BusError::AccessDenied(
                "Connection has already sent a Hello message".to_string(),
            ));
        }
        let unique = self.next_unique_name();
        peer.assign_unique_name(&unique);
        {
            let peers = self.peers.read();
            if !peers.contains_key(&peer.id()) {
                return Err(BusError::Disconnected);
            }
            self.names.write().insert_unique(&unique, peer.id());
        }
        info!(peer = peer.id(), unique_name = %unique, "peer registered");
        follow_ups.push(FollowUp::Acquired(unique.clone()));
        follow_ups.push(FollowUp::OwnerChanged {
            name: unique.clone(),
            old: String::new(),
            new: unique.clone(),
        });
        Ok(unique)
    }

    fn request_name(
        &self,
        peer: &Arc<Peer>,
        name: &str,
        follow_ups: &mut Vec<FollowUp>,
    ) -> Result<RequestNameReply, BusError> {
        check_requestable(name)?;
        let outcome = self.names.write().request(name, peer.id());
        match outcome {
            Acquisition::AlreadyOwner => Ok(RequestNameReply::AlreadyOwner),
            Acquisition::Exists => Ok(RequestNameReply::Exists),
            Acquisition::Acquired => {
                let unique = peer.unique_name().unwrap_or_default();
                info!(unique_name = %unique, name, "name acquired");
                follow_ups.push(FollowUp::Acquired(name.to_string()));
                follow_ups.push(FollowUp::OwnerChanged {
                    name: name.to_string(),
                    old: String::new(),
                    new: unique,
                });
                Ok(RequestNameReply::PrimaryOwner)
            }
        }
    }

    fn release_name(
        &self,
        peer: &Arc<Peer>,
        name: &str,
        follow_ups: &mut Vec<FollowUp>,
    ) -> Result<ReleaseNameReply, BusError> {
        check_requestable(name)?;
        if !self.names.write().release(name, peer.id()) {
            return Ok(ReleaseNameReply::NonExistent);
        }
        let unique = peer.unique_name().unwrap_or_default();
        info!(unique_name = %unique, name, "name released");
        follow_ups.push(FollowUp::Lost(name.to_string()));
        follow_ups.push(FollowUp::OwnerChanged {
            name: name.to_string(),
            old: unique,
            new: String::new(),
        });
        Ok(ReleaseNameReply::Released)
    }

    /// Unique name owning `name`; the bus owns its own name.
    fn unique_owner(&self, name: &str) -> Option<String> {
        if name == BUS_NAME {
            return Some(BUS_NAME.to_string());
        }
        self.owner_of(name).and_then(|owner| owner.unique_name())
    }

    fn credentials_of(&self, name: &str) -> Result<crate::peer::Credentials, BusError> {
        self.owner_of(name)
            .map(|owner| owner.credentials())
            .ok_or_else(|| no_owner(name))
    }
}

fn check_requestable(name: &str) -> Result<(), BusError> {
    if !is_valid_bus_name(name) || is_unique_name(name) {
        return Err(BusError::InvalidArgs(format!(
            "Cannot acquire a service named '{name}', it is not a valid well-known name"
        )));
    }
    if name == BUS_NAME {
        return Err(BusError::InvalidArgs(format!(
            "Connection is not allowed to own the service '{BUS_NAME}' because it is reserved for the bus"
        )));
    }
    Ok(())
}

fn parse_rule(text: &str) -> Result<MatchRule, BusError> {
    MatchRule::parse(text).map_err(|error| BusError::Execution {
        name: MATCH_RULE_INVALID.to_string(),
        message: error.error_message(),
    })
}

fn unavailable(what: &str, name: &str) -> BusError {
    BusError::Execution {
        name: FAILED.to_string(),
        message: format!("Could not determine {what} for '{name}'"),
    }
}
