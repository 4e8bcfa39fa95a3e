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

//! Message model and frame layout.
//!
//! # Wire Format (Protocol v1)
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ Endianness marker (1 byte, 'l' or 'B')                        │
//! ├───────────────────────────────────────────────────────────────┤
//! │ Message Type (1 byte)                                         │
//! │   0x01 = Method call                                          │
//! │   0x02 = Method return                                        │
//! │   0x03 = Error                                                │
//! │   0x04 = Signal                                               │
//! ├───────────────────────────────────────────────────────────────┤
//! │ Flags (1 byte)                                                │
//! │   0x01 = No reply expected                                    │
//! │   0x02 = No auto start                                        │
//! ├───────────────────────────────────────────────────────────────┤
//! │ Protocol Version (1 byte, currently 0x01)                     │
//! ├───────────────────────────────────────────────────────────────┤
//! │ Body Length (u32, backpatched after the body is encoded)      │
//! ├───────────────────────────────────────────────────────────────┤
//! │ Serial (u32, never zero)                                      │
//! ├───────────────────────────────────────────────────────────────┤
//! │ Header Fields a(yv), padded to a multiple of 8                │
//! ├───────────────────────────────────────────────────────────────┤
//! │ Body (values described by the SIGNATURE header field)         │
//! └───────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use crate::config::Limits;
use crate::error::BusError;
use crate::names::{
    check_bus_name, check_interface_name, check_member_name, is_valid_error_name, ObjectPath,
};
use crate::signature::{Signature, Type};
use crate::value::{Value, Variant};
use crate::wire::{padding, Endian, WireBuffer, WireReader};

/// Protocol version byte.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Size of the fixed prefix preceding the header fields.
pub const FIXED_HEADER_SIZE: usize = 12;

/// Bytes needed before the total frame length is known.
pub const MIN_FRAME_PREFIX: usize = 16;

/// Largest message accepted on the wire (128 MiB).
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;

/// Header field codes.
pub mod field {
    /// Object path the call is sent to or the signal is emitted from.
    pub const PATH: u8 = 1;
    /// Interface of the member.
    pub const INTERFACE: u8 = 2;
    /// Method or signal name.
    pub const MEMBER: u8 = 3;
    /// Name of the error, for error messages.
    pub const ERROR_NAME: u8 = 4;
    /// Serial of the message this one replies to.
    pub const REPLY_SERIAL: u8 = 5;
    /// Intended recipient.
    pub const DESTINATION: u8 = 6;
    /// Unique name of the sender, stamped by the bus.
    pub const SENDER: u8 = 7;
    /// Signature of the body.
    pub const SIGNATURE: u8 = 8;
    /// Number of out-of-band descriptors.
    pub const UNIX_FDS: u8 = 9;
}

/// Kind of message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// A method invocation.
    MethodCall,
    /// A successful reply.
    MethodReturn,
    /// A failed reply.
    Error,
    /// A broadcast or directed event.
    Signal,
}

impl MessageType {
    /// Wire byte for a method call.
    pub const METHOD_CALL_BYTE: u8 = 0x01;
    /// Wire byte for a method return.
    pub const METHOD_RETURN_BYTE: u8 = 0x02;
    /// Wire byte for an error.
    pub const ERROR_BYTE: u8 = 0x03;
    /// Wire byte for a signal.
    pub const SIGNAL_BYTE: u8 = 0x04;

    /// Convert to the wire byte.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::MethodCall => Self::METHOD_CALL_BYTE,
            Self::MethodReturn => Self::METHOD_RETURN_BYTE,
            Self::Error => Self::ERROR_BYTE,
            Self::Signal => Self::SIGNAL_BYTE,
        }
    }

    /// Parse a wire byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            Self::METHOD_CALL_BYTE => Some(Self::MethodCall),
            Self::METHOD_RETURN_BYTE => Some(Self::MethodReturn),
            Self::ERROR_BYTE => Some(Self::Error),
            Self::SIGNAL_BYTE => Some(Self::Signal),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MethodCall => "method_call",
            Self::MethodReturn => "method_return",
            Self::Error => "error",
            Self::Signal => "signal",
        })
    }
}

/// Message flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u8);

impl Flags {
    /// The sender does not want a reply.
    pub const NO_REPLY_EXPECTED: Self = Self(0x01);
    /// The bus must not launch an owner for the destination.
    pub const NO_AUTO_START: Self = Self(0x02);
    /// The caller is prepared to wait for interactive authorization.
    pub const ALLOW_INTERACTIVE_AUTHORIZATION: Self = Self(0x04);

    /// No flags set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Flags from raw bits. Unknown bits are kept.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Whether every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Decoded header fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    /// `PATH`
    pub path: Option<ObjectPath>,
    /// `INTERFACE`
    pub interface: Option<String>,
    /// `MEMBER`
    pub member: Option<String>,
    /// `ERROR_NAME`
    pub error_name: Option<String>,
    /// `REPLY_SERIAL`
    pub reply_serial: Option<u32>,
    /// `DESTINATION`
    pub destination: Option<String>,
    /// `SENDER`
    pub sender: Option<String>,
    /// `SIGNATURE`, empty when the body is empty.
    pub signature: Signature,
    /// `UNIX_FDS`
    pub unix_fds: Option<u32>,
}

impl Header {
    fn fields(&self) -> Vec<(u8, Value)> {
        let mut fields = Vec::with_capacity(8);
        if let Some(path) = &self.path {
            fields.push((field::PATH, Value::ObjectPath(path.clone())));
        }
        let strings = [
            (field::INTERFACE, &self.interface),
            (field::MEMBER, &self.member),
            (field::ERROR_NAME, &self.error_name),
        ];
        for (code, value) in strings {
            if let Some(value) = value {
                fields.push((code, Value::String(value.clone())));
            }
        }
        if let Some(serial) = self.reply_serial {
            fields.push((field::REPLY_SERIAL, Value::UInt32(serial)));
        }
        for (code, value) in [
            (field::DESTINATION, &self.destination),
            (field::SENDER, &self.sender),
        ] {
            if let Some(value) = value {
                fields.push((code, Value::String(value.clone())));
            }
        }
        if !self.signature.is_empty() {
            fields.push((field::SIGNATURE, Value::Signature(self.signature.clone())));
        }
        if let Some(count) = self.unix_fds {
            fields.push((field::UNIX_FDS, Value::UInt32(count)));
        }
        fields
    }

    fn set_field(&mut self, code: u8, value: Value) -> Result<(), BusError> {
        let wrong = |name: &str, value: &Value| {
            BusError::Protocol(format!(
                "header field {name} has type `{}'",
                value.signature()
            ))
        };
        match (code, value) {
            (field::PATH, Value::ObjectPath(path)) => self.path = Some(path),
            (field::INTERFACE, Value::String(s)) => self.interface = Some(s),
            (field::MEMBER, Value::String(s)) => self.member = Some(s),
            (field::ERROR_NAME, Value::String(s)) => self.error_name = Some(s),
            (field::REPLY_SERIAL, Value::UInt32(serial)) => self.reply_serial = Some(serial),
            (field::DESTINATION, Value::String(s)) => self.destination = Some(s),
            (field::SENDER, Value::String(s)) => self.sender = Some(s),
            (field::SIGNATURE, Value::Signature(sig)) => self.signature = sig,
            (field::UNIX_FDS, Value::UInt32(count)) => self.unix_fds = Some(count),
            (field::PATH, v) => return Err(wrong("PATH", &v)),
            (field::INTERFACE, v) => return Err(wrong("INTERFACE", &v)),
            (field::MEMBER, v) => return Err(wrong("MEMBER", &v)),
            (field::ERROR_NAME, v) => return Err(wrong("ERROR_NAME", &v)),
            (field::REPLY_SERIAL, v) => return Err(wrong("REPLY_SERIAL", &v)),
            (field::DESTINATION, v) => return Err(wrong("DESTINATION", &v)),
            (field::SENDER, v) => return Err(wrong("SENDER", &v)),
            (field::SIGNATURE, v) => return Err(wrong("SIGNATURE", &v)),
            (field::UNIX_FDS, v) => return Err(wrong("UNIX_FDS", &v)),
            // Unknown fields are ignored.
            _ => {}
        }
        Ok(())
    }
}

/// Lengths read from the first 16 bytes of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePrefix {
    /// Byte order of the frame.
    pub endian: Endian,
    /// Raw message type byte, not yet validated.
    pub message_type: u8,
    /// Serial of the frame.
    pub serial: u32,
    /// Length of the header field array, excluding the trailing pad.
    pub fields_length: usize,
    /// Length of the body.
    pub body_length: usize,
    /// Length of the whole frame.
    pub total_length: usize,
}

impl FramePrefix {
    /// Parse the first [`MIN_FRAME_PREFIX`] bytes of a frame.
    ///
    /// Errors returned here mean the stream cannot be resynchronized.
    pub fn parse(prefix: &[u8], limits: &Limits) -> Result<Self, BusError> {
        if prefix.len() < MIN_FRAME_PREFIX {
            return Err(BusError::Protocol(format!(
                "frame prefix needs {MIN_FRAME_PREFIX} bytes, got {}",
                prefix.len()
            )));
        }
        let endian = Endian::from_marker(prefix[0]).ok_or_else(|| {
            BusError::Protocol(format!("Unknown endianness marker: {:#04x}", prefix[0]))
        })?;
        let version = prefix[3];
        if version > PROTOCOL_VERSION {
            return Err(BusError::Protocol(format!(
                "Unsupported protocol version: {version}, expected {PROTOCOL_VERSION}"
            )));
        }
        let mut reader = WireReader::at(prefix, 4, endian);
        let body_length = reader.get_u32()? as usize;
        let serial = reader.get_u32()?;
        let fields_length = reader.get_u32()? as usize;

        if fields_length > limits.max_array_length {
            return Err(BusError::Protocol(format!(
                "Header field array length {fields_length} exceeds maximum {}",
                limits.max_array_length
            )));
        }
        if body_length > limits.max_message_size {
            return Err(BusError::Protocol(format!(
                "Body length {body_length} exceeds maximum {}",
                limits.max_message_size
            )));
        }
        let header_length = MIN_FRAME_PREFIX + fields_length;
        let total_length = header_length + padding(header_length, 8) + body_length;
        if total_length > limits.max_message_size {
            return Err(BusError::Protocol(format!(
                "Message size {total_length} exceeds maximum {}",
                limits.max_message_size
            )));
        }
        Ok(Self {
            endian,
            message_type: prefix[1],
            serial,
            fields_length,
            body_length,
            total_length,
        })
    }
}

/// A complete bus message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    endian: Endian,
    message_type: MessageType,
    flags: Flags,
    serial: u32,
    header: Header,
    body: Vec<Value>,
}

impl Message {
    /// Start a method call to `member` on `path`.
    pub fn method_call(path: &str, member: &str) -> Result<MessageBuilder, BusError> {
        let mut builder = MessageBuilder::new(MessageType::MethodCall);
        builder.header.path = Some(ObjectPath::new(path)?);
        check_member_name(member)?;
        builder.header.member = Some(member.to_string());
        Ok(builder)
    }

    /// Start a signal `interface.member` emitted from `path`.
    pub fn signal(path: &str, interface: &str, member: &str) -> Result<MessageBuilder, BusError> {
        let mut builder = MessageBuilder::new(MessageType::Signal);
        builder.header.path = Some(ObjectPath::new(path)?);
        check_interface_name(interface)?;
        check_member_name(member)?;
        builder.header.interface = Some(interface.to_string());
        builder.header.member = Some(member.to_string());
        Ok(builder)
    }

    /// Start a successful reply to `call`.
    #[must_use]
    pub fn method_return(call: &Self) -> MessageBuilder {
        let mut builder = MessageBuilder::new(MessageType::MethodReturn);
        builder.header.reply_serial = Some(call.serial);
        builder.header.destination.clone_from(&call.header.sender);
        builder
    }

    /// Start an error reply to `call`.
    ///
    /// A non-empty `message` becomes the single string argument of the body.
    pub fn error(call: &Self, name: &str, message: &str) -> Result<MessageBuilder, BusError> {
        Self::error_to(call.serial, call.header.sender.as_deref(), name, message)
    }

    /// Start an error reply to `reply_serial`, addressed to `destination`.
    pub fn error_to(
        reply_serial: u32,
        destination: Option<&str>,
        name: &str,
        message: &str,
    ) -> Result<MessageBuilder, BusError> {
        if !is_valid_error_name(name) {
            return Err(BusError::Parse(format!("invalid error name `{name}'")));
        }
        let mut builder = MessageBuilder::new(MessageType::Error);
        builder.header.error_name = Some(name.to_string());
        builder.header.reply_serial = Some(reply_serial);
        builder.header.destination = destination.map(str::to_string);
        if !message.is_empty() {
            builder.body.push(Value::String(message.to_string()));
        }
        Ok(builder)
    }

    /// Byte order used when this message is encoded.
    #[must_use]
    pub const fn endian(&self) -> Endian {
        self.endian
    }

    /// Kind of message.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Flag bits.
    #[must_use]
    pub const fn flags(&self) -> Flags {
        self.flags
    }

    /// Whether the sender asked for no reply.
    #[must_use]
    pub const fn no_reply_expected(&self) -> bool {
        self.flags.contains(Flags::NO_REPLY_EXPECTED)
    }

    /// Serial, zero until assigned by the sending connection.
    #[must_use]
    pub const fn serial(&self) -> u32 {
        self.serial
    }

    /// Assign the serial. Done by the sending connection.
    pub fn set_serial(&mut self, serial: u32) {
        self.serial = serial;
    }

    /// Header fields.
    #[must_use]
    pub const fn header(&self) -> &Header {
        &self.header
    }

    /// `PATH` header field.
    #[must_use]
    pub fn path(&self) -> Option<&ObjectPath> {
        self.header.path.as_ref()
    }

    /// `INTERFACE` header field.
    #[must_use]
    pub fn interface(&self) -> Option<&str> {
        self.header.interface.as_deref()
    }

    /// `MEMBER` header field.
    #[must_use]
    pub fn member(&self) -> Option<&str> {
        self.header.member.as_deref()
    }

    /// `ERROR_NAME` header field.
    #[must_use]
    pub fn error_name(&self) -> Option<&str> {
        self.header.error_name.as_deref()
    }

    /// `REPLY_SERIAL` header field.
    #[must_use]
    pub const fn reply_serial(&self) -> Option<u32> {
        self.header.reply_serial
    }

    /// `DESTINATION` header field.
    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        self.header.destination.as_deref()
    }

    /// `SENDER` header field.
    #[must_use]
    pub fn sender(&self) -> Option<&str> {
        self.header.sender.as_deref()
    }

    /// Overwrite the `SENDER` header field. Done by the bus.
    pub fn set_sender(&mut self, sender: impl Into<String>) {
        self.header.sender = Some(sender.into());
    }

    /// Overwrite the `DESTINATION` header field.
    pub fn set_destination(&mut self, destination: impl Into<String>) {
        self.header.destination = Some(destination.into());
    }

    /// Signature of the body.
    #[must_use]
    pub const fn signature(&self) -> &Signature {
        &self.header.signature
    }

    /// Body values.
    #[must_use]
    pub fn body(&self) -> &[Value] {
        &self.body
    }

    /// Consume the message and return its body.
    #[must_use]
    pub fn into_body(self) -> Vec<Value> {
        self.body
    }

    /// Message text of an error: the first body value when it is a string.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        match self.body.first() {
            Some(Value::String(text)) => Some(text),
            _ => None,
        }
    }

    /// Convert an error message into a [`BusError`].
    #[must_use]
    pub fn to_bus_error(&self) -> BusError {
        BusError::from_wire(
            self.error_name().unwrap_or(crate::error::names::FAILED),
            self.error_message().unwrap_or_default(),
        )
    }

    fn validate(&self) -> Result<(), BusError> {
        let missing = |field: &str| {
            BusError::Protocol(format!("{} message without {field}", self.message_type))
        };
        match self.message_type {
            MessageType::MethodCall => {
                if self.header.path.is_none() {
                    return Err(missing("PATH"));
                }
                if self.header.member.is_none() {
                    return Err(missing("MEMBER"));
                }
            }
            MessageType::Signal => {
                if self.header.path.is_none() {
                    return Err(missing("PATH"));
                }
                if self.header.interface.is_none() {
                    return Err(missing("INTERFACE"));
                }
                if self.header.member.is_none() {
                    return Err(missing("MEMBER"));
                }
            }
            MessageType::Error => {
                if self.header.error_name.is_none() {
                    return Err(missing("ERROR_NAME"));
                }
                if self.header.reply_serial.is_none() {
                    return Err(missing("REPLY_SERIAL"));
                }
            }
            MessageType::MethodReturn => {
                if self.header.reply_serial.is_none() {
                    return Err(missing("REPLY_SERIAL"));
                }
            }
        }
        Ok(())
    }

    /// Encode the message into a complete frame.
    ///
    /// Fails if the serial has not been assigned.
    pub fn encode(&self) -> Result<Vec<u8>, BusError> {
        if self.serial == 0 {
            return Err(BusError::Protocol("message has no serial".to_string()));
        }
        let mut body = WireBuffer::new(self.endian);
        body.put_values(&self.body)?;

        let mut frame = WireBuffer::with_capacity(self.endian, 128 + body.len());
        frame.put_u8(self.endian.marker());
        frame.put_u8(self.message_type.to_byte());
        frame.put_u8(self.flags.bits());
        frame.put_u8(PROTOCOL_VERSION);
        let body_length_at = frame.reserve_u32();
        frame.put_u32(self.serial);

        let fields_length_at = frame.reserve_u32();
        let fields_start = frame.len();
        for (code, value) in self.header.fields() {
            frame.align(8);
            frame.put_u8(code);
            frame.put_value(&Value::Variant(Variant::wrap(value)))?;
        }
        let fields_length = u32::try_from(frame.len() - fields_start)
            .map_err(|_| BusError::Protocol("header fields too long".to_string()))?;
        frame.patch_u32(fields_length_at, fields_length);
        frame.align(8);

        let body_length = u32::try_from(body.len())
            .map_err(|_| BusError::Protocol("body too long for u32 length".to_string()))?;
        frame.patch_u32(body_length_at, body_length);
        frame.put_bytes(body.as_slice());
        Ok(frame.into_vec())
    }

    /// Decode one complete frame.
    ///
    /// `frame` must hold exactly the bytes announced by its prefix.
    pub fn decode(frame: &[u8], limits: &Limits) -> Result<Self, BusError> {
        let prefix = FramePrefix::parse(frame, limits)?;
        if frame.len() != prefix.total_length {
            return Err(BusError::Protocol(format!(
                "frame holds {} bytes, prefix announces {}",
                frame.len(),
                prefix.total_length
            )));
        }
        let message_type = MessageType::from_byte(prefix.message_type).ok_or_else(|| {
            BusError::Protocol(format!(
                "Unknown message type: {:#04x}",
                prefix.message_type
            ))
        })?;
        if prefix.serial == 0 {
            return Err(BusError::Protocol("message serial is zero".to_string()));
        }

        let fields_end = MIN_FRAME_PREFIX + prefix.fields_length;
        let mut reader = WireReader::at(&frame[..fields_end], MIN_FRAME_PREFIX, prefix.endian)
            .with_max_array_length(limits.max_array_length);
        let mut header = Header::default();
        while !reader.is_at_end() {
            reader.align(8)?;
            let code = reader.get_u8()?;
            let Value::Variant(variant) = reader.get_value(&Type::Variant)? else {
                return Err(BusError::Protocol("malformed header field".to_string()));
            };
            header.set_field(code, variant.into_inner())?;
        }

        let body_start = fields_end + padding(fields_end, 8);
        if frame[fields_end..body_start].iter().any(|b| *b != 0) {
            return Err(BusError::Protocol("non-zero header padding".to_string()));
        }
        let body_bytes = &frame[body_start..];
        if header.signature.is_empty() && !body_bytes.is_empty() {
            return Err(BusError::Protocol(
                "message has a body but no SIGNATURE field".to_string(),
            ));
        }
        let mut body_reader = WireReader::new(body_bytes, prefix.endian)
            .with_max_array_length(limits.max_array_length);
        let body = body_reader.get_values(&header.signature)?;
        if !body_reader.is_at_end() {
            return Err(BusError::Protocol(
                "body is longer than its signature describes".to_string(),
            ));
        }

        let message = Self {
            endian: prefix.endian,
            message_type,
            flags: Flags::from_bits(frame[2]),
            serial: prefix.serial,
            header,
            body,
        };
        message.validate()?;
        Ok(message)
    }
}

/// Builder for outgoing messages.
#[derive(Debug, Clone)]
#[must_use]
pub struct MessageBuilder {
    message_type: MessageType,
    endian: Endian,
    flags: Flags,
    header: Header,
    body: Vec<Value>,
}

impl MessageBuilder {
    fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            endian: Endian::default(),
            flags: Flags::empty(),
            header: Header::default(),
            body: Vec::new(),
        }
    }

    /// Set the interface.
    pub fn interface(mut self, interface: &str) -> Result<Self, BusError> {
        check_interface_name(interface)?;
        self.header.interface = Some(interface.to_string());
        Ok(self)
    }

    /// Set the destination bus name.
    pub fn destination(mut self, destination: &str) -> Result<Self, BusError> {
        check_bus_name(destination)?;
        self.header.destination = Some(destination.to_string());
        Ok(self)
    }

    /// Set the sender name.
    pub fn sender(mut self, sender: &str) -> Result<Self, BusError> {
        check_bus_name(sender)?;
        self.header.sender = Some(sender.to_string());
        Ok(self)
    }

    /// Add flag bits.
    pub fn flags(mut self, flags: Flags) -> Self {
        self.flags.insert(flags);
        self
    }

    /// Choose the byte order used when encoding.
    pub fn endian(mut self, endian: Endian) -> Self {
        self.endian = endian;
        self
    }

    /// Append one body value.
    pub fn arg(mut self, value: Value) -> Self {
        self.body.push(value);
        self
    }

    /// Replace the body.
    pub fn body(mut self, body: Vec<Value>) -> Self {
        self.body = body;
        self
    }

    /// Finish the message, deriving the body signature.
    pub fn build(self) -> Result<Message, BusError> {
        let mut header = self.header;
        header.signature = Signature::from_types(self.body.iter().map(Value::value_type).collect())?;
        let message = Message {
            endian: self.endian,
            message_type: self.message_type,
            flags: self.flags,
            serial: 0,
            header,
            body: self.body,
        };
        message.validate()?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::IntoValue;

    fn limits() -> Limits {
        Limits::default()
    }

    fn hello() -> Message {
        let mut message = Message::method_call("/org/freedesktop/DBus", "Hello")
            .unwrap()
            .interface("org.freedesktop.DBus")
            .unwrap()
            .destination("org.freedesktop.DBus")
            .unwrap()
            .build()
            .unwrap();
        message.set_serial(1);
        message
    }

    #[test]
    fn test_fixed_prefix_layout() {
        let bytes = hello().encode().unwrap();
        assert_eq!(bytes[0], b'l');
        assert_eq!(bytes[1], MessageType::METHOD_CALL_BYTE);
        assert_eq!(bytes[2], 0);
        assert_eq!(bytes[3], PROTOCOL_VERSION);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(&bytes[8..12], &[1, 0, 0, 0]);
        assert_eq!(bytes.len() % 8, 0);
    }

    #[test]
    fn test_body_length_is_backpatched() {
        let mut message = Message::method_call("/Test", "Echo")
            .unwrap()
            .arg("hello".into_value())
            .build()
            .unwrap();
        message.set_serial(7);
        let bytes = message.encode().unwrap();
        let body_length = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        assert_eq!(body_length, 4 + 5 + 1);
        let prefix = FramePrefix::parse(&bytes, &limits()).unwrap();
        assert_eq!(prefix.total_length, bytes.len());
        assert_eq!(prefix.body_length, 10);
    }

    #[test]
    fn test_round_trip_every_type() {
        for endian in [Endian::Little, Endian::Big] {
            let mut call = Message::method_call("/com/example/Object", "Frob")
                .unwrap()
                .interface("com.example.Frobber")
                .unwrap()
                .destination(":1.7")
                .unwrap()
                .flags(Flags::NO_AUTO_START)
                .endian(endian)
                .body(vec![
                    Value::Byte(1),
                    Value::Boolean(true),
                    (-2i16).into_value(),
                    3u16.into_value(),
                    (-4i32).into_value(),
                    5u32.into_value(),
                    (-6i64).into_value(),
                    7u64.into_value(),
                    8.5f64.into_value(),
                    "nine".into_value(),
                    ObjectPath::new("/ten").unwrap().into_value(),
                    Signature::parse("a{sv}").unwrap().into_value(),
                    Value::Variant(Variant::new((1u8, "x"))),
                ])
                .build()
                .unwrap();
            call.set_serial(42);
            let bytes = call.encode().unwrap();
            let decoded = Message::decode(&bytes, &limits()).unwrap();
            assert_eq!(decoded, call);
            assert_eq!(decoded.signature().as_str(), "ybnqiuxtdsogv");
        }
    }

    #[test]
    fn test_error_reply_carries_message() {
        let mut call = hello();
        call.set_sender(":1.3");
        let mut error = Message::error(&call, "org.freedesktop.DBus.Error.AccessDenied", "no")
            .unwrap()
            .build()
            .unwrap();
        error.set_serial(2);
        let decoded = Message::decode(&error.encode().unwrap(), &limits()).unwrap();
        assert_eq!(decoded.reply_serial(), Some(1));
        assert_eq!(decoded.destination(), Some(":1.3"));
        assert_eq!(decoded.error_message(), Some("no"));
        assert!(matches!(decoded.to_bus_error(), BusError::AccessDenied(_)));
    }

    #[test]
    fn test_rejects_future_protocol_version() {
        let mut bytes = hello().encode().unwrap();
        bytes[3] = 2;
        let err = Message::decode(&bytes, &limits()).unwrap_err();
        assert!(matches!(err, BusError::Protocol(_)));
    }

    #[test]
    fn test_rejects_unknown_message_type() {
        let mut bytes = hello().encode().unwrap();
        bytes[1] = 9;
        let err = Message::decode(&bytes, &limits()).unwrap_err();
        assert!(matches!(err, BusError::Protocol(msg) if msg.contains("Unknown message type")));
    }

    #[test]
    fn test_rejects_oversized_body() {
        let bytes = hello().encode().unwrap();
        let tight = Limits {
            max_message_size: bytes.len() - 1,
            ..Limits::default()
        };
        assert!(FramePrefix::parse(&bytes, &tight).is_err());
    }

    #[test]
    fn test_missing_required_fields() {
        let mut message = Message::method_return(&hello()).build().unwrap();
        message.header.reply_serial = None;
        assert!(message.validate().is_err());
    }

    #[test]
    fn test_unassigned_serial_is_rejected() {
        let message = Message::method_call("/", "Ping").unwrap().build().unwrap();
        assert!(message.encode().is_err());
    }
}
