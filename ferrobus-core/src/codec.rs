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

//! Stream framing for bus messages.
//!
//! [`MessageCodec`] plugs into `FramedRead`/`FramedWrite`. A frame whose
//! prefix cannot be trusted ends the stream; a frame that is well delimited
//! but fails to decode is surfaced as [`Frame::Malformed`] so the caller can
//! answer it and keep reading.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::config::Limits;
use crate::error::BusError;
use crate::message::{FramePrefix, Message, MIN_FRAME_PREFIX};

/// One unit read from the stream.
#[derive(Debug)]
pub enum Frame {
    /// A fully decoded message.
    Message(Message),
    /// A delimited frame that could not be decoded.
    Malformed {
        /// Serial read from the frame prefix.
        serial: u32,
        /// Why decoding failed.
        error: BusError,
    },
}

/// Codec turning a byte stream into [`Frame`]s and messages into bytes.
#[derive(Debug, Clone, Default)]
pub struct MessageCodec {
    limits: Limits,
}

impl MessageCodec {
    /// Codec with the default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec enforcing `limits`.
    #[must_use]
    pub const fn with_limits(limits: Limits) -> Self {
        Self { limits }
    }

    /// Limits in force.
    #[must_use]
    pub const fn limits(&self) -> &Limits {
        &self.limits
    }
}

impl Decoder for MessageCodec {
    type Item = Frame;
    type Error = BusError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, BusError> {
        if src.len() < MIN_FRAME_PREFIX {
            src.reserve(MIN_FRAME_PREFIX - src.len());
            return Ok(None);
        }
        let prefix = FramePrefix::parse(&src[..MIN_FRAME_PREFIX], &self.limits)?;
        if src.len() < prefix.total_length {
            src.reserve(prefix.total_length - src.len());
            return Ok(None);
        }

        let frame = src.split_to(prefix.total_length);
        trace!(
            serial = prefix.serial,
            length = prefix.total_length,
            "Frame received"
        );
        match Message::decode(&frame, &self.limits) {
            Ok(message) => Ok(Some(Frame::Message(message))),
            Err(error) => Ok(Some(Frame::Malformed {
                serial: prefix.serial,
                error,
            })),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = BusError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), BusError> {
        let bytes = message.encode()?;
        if bytes.len() > self.limits.max_message_size {
            return Err(BusError::Protocol(format!(
                "Message size {} exceeds maximum {}",
                bytes.len(),
                self.limits.max_message_size
            )));
        }
        dst.reserve(bytes.len());
        dst.put_slice(&bytes);
        Ok(())
    }
}

/// Decode one complete frame with the default limits.
pub fn decode_message(frame: &[u8]) -> Result<Message, BusError> {
    Message::decode(frame, &Limits::default())
}
