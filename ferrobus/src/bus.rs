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

//! Typed calls to the bus daemon.

use ferrobus_core::bus::{ReleaseNameReply, RequestNameReply};
use ferrobus_core::names::{BUS_INTERFACE, BUS_NAME, BUS_PATH, PEER_INTERFACE};
use ferrobus_core::{BusError, FromReply, IntoArgs};

use crate::connection::Connection;
use crate::proxy::Proxy;

/// Proxy for `org.freedesktop.DBus` at `/org/freedesktop/DBus`.
#[derive(Debug, Clone)]
pub struct BusProxy {
    connection: Connection,
}

impl BusProxy {
    pub(crate) const fn new(connection: Connection) -> Self {
        Self { connection }
    }

    fn proxy(&self, interface: &str) -> Result<Proxy, BusError> {
        Proxy::new(
            self.connection.clone(),
            Some(BUS_NAME),
            BUS_PATH,
            Some(interface),
        )
    }

    async fn call<A: IntoArgs, R: FromReply>(&self, method: &str, args: A) -> Result<R, BusError> {
        self.proxy(BUS_INTERFACE)?.call_typed(method, args).await
    }

    /// Register with the bus and return the assigned unique name.
    pub async fn hello(&self) -> Result<String, BusError> {
        self.call("Hello", ()).await
    }

    /// Ask for ownership of `name`.
    pub async fn request_name(&self, name: &str, flags: u32) -> Result<RequestNameReply, BusError> {
        let code: u32 = self.call("RequestName", (name, flags)).await?;
        RequestNameReply::from_u32(code)
            .ok_or_else(|| BusError::Protocol(format!("unknown RequestName reply {code}")))
    }

    /// Give up ownership of `name`.
    pub async fn release_name(&self, name: &str) -> Result<ReleaseNameReply, BusError> {
        let code: u32 = self.call("ReleaseName", (name,)).await?;
        ReleaseNameReply::from_u32(code)
            .ok_or_else(|| BusError::Protocol(format!("unknown ReleaseName reply {code}")))
    }

    /// Every name currently owned on the bus.
    pub async fn list_names(&self) -> Result<Vec<String>, BusError> {
        self.call("ListNames", ()).await
    }

    /// Names that could be started on demand.
    pub async fn list_activatable_names(&self) -> Result<Vec<String>, BusError> {
        self.call("ListActivatableNames", ()).await
    }

    /// Whether `name` has an owner.
    pub async fn name_has_owner(&self, name: &str) -> Result<bool, BusError> {
        self.call("NameHasOwner", (name,)).await
    }

    /// Unique name of the owner of `name`.
    pub async fn get_name_owner(&self, name: &str) -> Result<String, BusError> {
        self.call("GetNameOwner", (name,)).await
    }

    /// Subscribe to messages matching `rule`.
    pub async fn add_match(&self, rule: &str) -> Result<(), BusError> {
        self.call("AddMatch", (rule,)).await
    }

    /// Drop a rule added with [`BusProxy::add_match`].
    pub async fn remove_match(&self, rule: &str) -> Result<(), BusError> {
        self.call("RemoveMatch", (rule,)).await
    }

    /// Unix user id of the connection owning `name`.
    pub async fn get_connection_unix_user(&self, name: &str) -> Result<u32, BusError> {
        self.call("GetConnectionUnixUser", (name,)).await
    }

    /// Process id of the connection owning `name`.
    pub async fn get_connection_unix_process_id(&self, name: &str) -> Result<u32, BusError> {
        self.call("GetConnectionUnixProcessID", (name,)).await
    }

    /// Identifier of the bus instance.
    pub async fn get_id(&self) -> Result<String, BusError> {
        self.call("GetId", ()).await
    }

    /// Round trip to the daemon.
    pub async fn ping(&self) -> Result<(), BusError> {
        self.proxy(PEER_INTERFACE)?.call_typed("Ping", ()).await
    }
}
