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
#![forbid(missing_docs)]

//! # Ferrobus
//!
//! Client side of the ferrobus message bus, built on Tokio.
//!
//! ## Key Concepts
//!
//! - **Connections (`Connection`)**: one transport to a bus daemon or a peer,
//!   with a reader task, a writer task and a pool of callback workers.
//! - **Exported objects (`BusObject`)**: local objects answering method calls,
//!   registered at object paths or as fallbacks for whole subtrees.
//! - **Proxies (`Proxy`)**: handles for calling methods of remote objects,
//!   optionally checked against a registered interface description.
//! - **Signals**: broadcast notifications, subscribed with
//!   `Connection::add_signal_handler` and emitted with
//!   `Connection::emit_signal`.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ferrobus::prelude::*;
//!
//! let connection = Connection::session().await?;
//! connection.request_name("org.example.Calculator").await?;
//!
//! let calculator = ObjectBuilder::new()
//!     .interface(
//!         InterfaceBuilder::new("org.example.Calculator")?
//!             .typed_method("Add", |_ctx, (a, b): (i32, i32)| async move {
//!                 Ok::<_, MethodError>((a + b,))
//!             })?,
//!     )
//!     .build();
//! connection.export("/org/example/Calculator", calculator)?;
//! ```

/// Typed calls to the bus daemon.
pub mod bus;

/// The connection engine.
pub mod connection;

/// Registry of exported objects.
pub mod exporter;

/// Introspection XML generation and parsing.
pub mod introspect;

/// Exported object traits and descriptors.
pub mod object;

/// Proxies for remote objects.
pub mod proxy;

/// Wire-level building blocks, re-exported from `ferrobus-core`.
pub use ferrobus_core as core;

/// Commonly used items.
///
/// # Re-exports
///
/// ## Macros
/// *   [`ferrobus_macro::WireStruct`]: derive wire conversions for a struct.
///
/// ## External Crates
/// *   [`async_trait::async_trait`](https://docs.rs/async-trait/latest/async_trait/attr.async_trait.html): required to implement [`crate::object::BusObject`].
///
/// ## Core Types
/// *   [`crate::connection::Connection`], [`crate::connection::ConnectionBuilder`]
/// *   [`crate::object::BusObject`], [`crate::object::ObjectBuilder`], [`crate::object::InterfaceBuilder`]
/// *   [`crate::proxy::Proxy`], [`crate::bus::BusProxy`]
/// *   Values, signatures and errors from `ferrobus-core`.
pub mod prelude {
    pub use async_trait::async_trait;
    pub use ferrobus_macro::WireStruct;

    pub use crate::bus::BusProxy;
    pub use crate::connection::{
        Connection, ConnectionBuilder, ConnectionState, HandlerId, PendingReply, SignalKey,
    };
    pub use crate::exporter::ExportLease;
    pub use crate::object::{
        ArgDescriptor, BusObject, CallContext, InterfaceBuilder, InterfaceDescriptor,
        MethodDescriptor, ObjectBuilder, SignalDescriptor,
    };
    pub use crate::proxy::Proxy;
    pub use ferrobus_core::{
        Array, BusConfig, BusError, Dict, FromReply, FromValue, IntoArgs, IntoValue, Message,
        MethodError, ObjectPath, Signature, Type, Value, Variant, WireArgs, WireType,
    };
}
