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
//! # Ferrobus Core
//!
//! Transport-independent building blocks of the ferrobus message bus: the
//! type system and signature grammar, the value model, the wire marshalling
//! codec and message framing, bus addresses, errors and configuration.
//!
//! Both the client library (`ferrobus`) and the daemon (`ferrobus-daemon`)
//! are built on this crate.

/// Bus addresses and GUIDs.
pub mod address;
/// Constants of the bus daemon interface.
pub mod bus;
/// Stream framing for `FramedRead`/`FramedWrite`.
pub mod codec;
/// Bus configuration loaded from XDG locations.
pub mod config;
/// Conversions between native types and wire values.
pub mod convert;
/// Error types and well-known error names.
pub mod error;
/// Match rules used to subscribe to signals.
pub mod match_rule;
/// Messages, headers and frame layout.
pub mod message;
/// Name grammars and object paths.
pub mod names;
/// Type codes and signatures.
pub mod signature;
/// Dynamically typed values.
pub mod value;
/// Alignment-aware marshalling.
pub mod wire;

pub use address::{BusAddress, Endpoint};
pub use codec::{Frame, MessageCodec};
pub use config::{BusConfig, Limits, MatchPolicy};
pub use convert::{FromReply, FromValue, IntoArgs, IntoValue, WireArgs, WireType};
pub use error::{BusError, MethodError};
pub use match_rule::MatchRule;
pub use message::{Flags, Message, MessageBuilder, MessageType};
pub use names::ObjectPath;
pub use signature::{Signature, Type};
pub use value::{Array, Dict, Value, Variant};
pub use wire::Endian;

#[cfg(test)]
mod assertions {
    use static_assertions::assert_impl_all;

    assert_impl_all!(super::Message: Send, Sync, Clone);
    assert_impl_all!(super::Value: Send, Sync, Clone);
    assert_impl_all!(super::BusError: Send, Sync, std::error::Error);
    assert_impl_all!(super::MessageCodec: Send, Sync);
}
