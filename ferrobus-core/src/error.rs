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

//! Error taxonomy shared by the codec, the connection engine and the daemon.
//!
//! Every [`BusError`] has a wire representation: [`BusError::error_name`] gives
//! the error name used in an outgoing `Error` message and
//! [`BusError::from_wire`] maps a received error back onto the taxonomy.

use std::time::Duration;

use thiserror::Error;

/// Well-known wire error names.
pub mod names {
    /// Generic failure.
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    /// No object is exported at the requested path.
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    /// The object has no method with the requested name and signature.
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    /// The object does not implement the requested interface.
    pub const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
    /// The destination name has no owner.
    pub const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
    /// The name queried with `GetNameOwner` has no owner.
    pub const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
    /// The peer is not allowed to perform the operation.
    pub const ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";
    /// Arguments did not match the declared signature or were invalid.
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    /// A message could not be understood.
    pub const INCONSISTENT_MESSAGE: &str = "org.freedesktop.DBus.Error.InconsistentMessage";
    /// No reply arrived in time.
    pub const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
    /// The connection is not established.
    pub const NO_SERVER: &str = "org.freedesktop.DBus.Error.NoServer";
    /// An object is already exported at the path.
    pub const OBJECT_PATH_IN_USE: &str = "org.freedesktop.DBus.Error.ObjectPathInUse";
    /// Transport failure.
    pub const IO_ERROR: &str = "org.freedesktop.DBus.Error.IOError";
    /// A match rule could not be parsed.
    pub const MATCH_RULE_INVALID: &str = "org.freedesktop.DBus.Error.MatchRuleInvalid";
    /// `RemoveMatch` named a rule that was never added.
    pub const MATCH_RULE_NOT_FOUND: &str = "org.freedesktop.DBus.Error.MatchRuleNotFound";
    /// The connection to the bus was lost.
    pub const DISCONNECTED: &str = "org.freedesktop.DBus.Local.Disconnected";
}

/// Errors produced anywhere on the bus stack.
#[derive(Debug, Error)]
pub enum BusError {
    /// A signature, address, name or value could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// A frame violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A remote method failed. Carries the interface-qualified error name.
    #[error("{name}: {message}")]
    Execution {
        /// Wire error name, e.g. `com.example.Error.NotFound`.
        name: String,
        /// Human-readable message from the error body.
        message: String,
    },

    /// The connection was never established or is not running.
    #[error("not connected")]
    NotConnected,

    /// The connection was closed while the operation was outstanding.
    #[error("disconnected")]
    Disconnected,

    /// A call did not receive a reply within the allowed time.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// No object is exported at the path.
    #[error("unknown object: {0}")]
    UnknownObject(String),

    /// The target object has no such method.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// The target object does not implement the interface, or no
    /// introspected interface could be resolved locally.
    #[error("unknown interface: {0}")]
    UnknownInterface(String),

    /// The destination name is not owned by any peer.
    #[error("service unknown: {0}")]
    ServiceUnknown(String),

    /// The operation is not allowed.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Arguments were rejected.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// A well-known name could not be acquired.
    #[error("name already taken: {0}")]
    NameTaken(String),

    /// An object is already exported at the path.
    #[error("object already exported at {0}")]
    AlreadyExported(String),

    /// Transport I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BusError {
    /// The wire error name used when this error is sent to a peer.
    #[must_use]
    pub fn error_name(&self) -> &str {
        match self {
            Self::Parse(_) | Self::InvalidArgs(_) => names::INVALID_ARGS,
            Self::Protocol(_) => names::INCONSISTENT_MESSAGE,
            Self::Execution { name, .. } => name,
            Self::NotConnected => names::NO_SERVER,
            Self::Disconnected => names::DISCONNECTED,
            Self::Timeout(_) => names::NO_REPLY,
            Self::UnknownObject(_) => names::UNKNOWN_OBJECT,
            Self::UnknownMethod(_) => names::UNKNOWN_METHOD,
            Self::UnknownInterface(_) => names::UNKNOWN_INTERFACE,
            Self::ServiceUnknown(_) => names::SERVICE_UNKNOWN,
            Self::AccessDenied(_) => names::ACCESS_DENIED,
            Self::NameTaken(_) => names::FAILED,
            Self::AlreadyExported(_) => names::OBJECT_PATH_IN_USE,
            Self::Io(_) => names::IO_ERROR,
        }
    }

    /// The message text used in the body of an outgoing error.
    #[must_use]
    pub fn error_message(&self) -> String {
        match self {
            Self::Parse(m)
            | Self::Protocol(m)
            | Self::UnknownObject(m)
            | Self::UnknownMethod(m)
            | Self::UnknownInterface(m)
            | Self::ServiceUnknown(m)
            | Self::AccessDenied(m)
            | Self::InvalidArgs(m)
            | Self::NameTaken(m)
            | Self::AlreadyExported(m) => m.clone(),
            Self::Execution { message, .. } => message.clone(),
            Self::Io(e) => e.to_string(),
            Self::NotConnected | Self::Disconnected | Self::Timeout(_) => self.to_string(),
        }
    }

    /// Map a received wire error back onto the taxonomy.
    ///
    /// Routing and dispatch misses keep their dedicated variants so callers
    /// can match on them; every other name becomes [`BusError::Execution`].
    #[must_use]
    pub fn from_wire(name: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match name {
            names::UNKNOWN_OBJECT => Self::UnknownObject(message),
            names::UNKNOWN_METHOD => Self::UnknownMethod(message),
            names::UNKNOWN_INTERFACE => Self::UnknownInterface(message),
            names::SERVICE_UNKNOWN => Self::ServiceUnknown(message),
            names::ACCESS_DENIED => Self::AccessDenied(message),
            names::INVALID_ARGS => Self::InvalidArgs(message),
            names::DISCONNECTED => Self::Disconnected,
            _ => Self::Execution {
                name: name.to_string(),
                message,
            },
        }
    }
}

/// Fault raised by an exported method.
///
/// The name is transmitted verbatim as the wire error name, so it should be
/// an interface-qualified name such as `com.example.Calculator.DivideByZero`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name}: {message}")]
pub struct MethodError {
    /// Wire error name.
    pub name: String,
    /// Human-readable description.
    pub message: String,
}

impl MethodError {
    /// Create a named fault.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// A generic `org.freedesktop.DBus.Error.Failed` fault.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(names::FAILED, message)
    }

    /// An `org.freedesktop.DBus.Error.InvalidArgs` fault.
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(names::INVALID_ARGS, message)
    }
}

impl From<BusError> for MethodError {
    fn from(error: BusError) -> Self {
        Self::new(error.error_name(), error.error_message())
    }
}
