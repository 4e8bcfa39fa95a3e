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

//! Value marshalling.
//!
//! [`WireBuffer`] encodes values with natural alignment relative to the start
//! of the buffer. Array lengths are written as placeholders and backpatched
//! through [`WireBuffer::patch_u32`] once the elements are in place.
//! [`WireReader`] is the matching cursor for decoding.
//!
//! Both types assume offset zero is 8-aligned relative to the enclosing
//! message, which holds for the header (offset 0) and the body (the header is
//! padded to 8).

use crate::error::BusError;
use crate::names::{is_valid_object_path, ObjectPath};
use crate::signature::{Signature, Type};
use crate::value::{Array, Dict, Value, Variant};

/// Largest array payload in bytes.
pub const MAX_ARRAY_LENGTH: usize = 64 * 1024 * 1024;

/// Deepest container nesting accepted while decoding.
pub const MAX_DEPTH: usize = 64;

/// Byte order of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    /// `l` marker.
    #[default]
    Little,
    /// `B` marker.
    Big,
}

impl Endian {
    /// Marker byte for little-endian messages.
    pub const LITTLE_MARKER: u8 = b'l';
    /// Marker byte for big-endian messages.
    pub const BIG_MARKER: u8 = b'B';

    /// Marker byte written at offset 0.
    #[must_use]
    pub const fn marker(self) -> u8 {
        match self {
            Self::Little => Self::LITTLE_MARKER,
            Self::Big => Self::BIG_MARKER,
        }
    }

    /// Parse a marker byte.
    #[must_use]
    pub const fn from_marker(byte: u8) -> Option<Self> {
        match byte {
            Self::LITTLE_MARKER => Some(Self::Little),
            Self::BIG_MARKER => Some(Self::Big),
            _ => None,
        }
    }
}

/// Padding needed to bring `offset` to a multiple of `alignment`.
#[must_use]
pub const fn padding(offset: usize, alignment: usize) -> usize {
    (alignment - offset % alignment) % alignment
}

macro_rules! put_number {
    ($name:ident, $t:ty) => {
        #[doc = concat!("Append an aligned `", stringify!($t), "`.")]
        pub fn $name(&mut self, value: $t) {
            self.align(std::mem::size_of::<$t>());
            match self.endian {
                Endian::Little => self.data.extend_from_slice(&value.to_le_bytes()),
                Endian::Big => self.data.extend_from_slice(&value.to_be_bytes()),
            }
        }
    };
}

/// Growable encode buffer with placeholder backpatching.
#[derive(Debug, Clone)]
pub struct WireBuffer {
    data: Vec<u8>,
    endian: Endian,
}

impl WireBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub const fn new(endian: Endian) -> Self {
        Self {
            data: Vec::new(),
            endian,
        }
    }

    /// Create an empty buffer with preallocated capacity.
    #[must_use]
    pub fn with_capacity(endian: Endian, capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            endian,
        }
    }

    /// Current length, which is also the offset of the next byte.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Byte order used by this buffer.
    #[must_use]
    pub const fn endian(&self) -> Endian {
        self.endian
    }

    /// Borrow the encoded bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Consume the buffer and return the encoded bytes.
    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Append zero bytes until the length is a multiple of `alignment`.
    pub fn align(&mut self, alignment: usize) {
        let pad = padding(self.data.len(), alignment);
        self.data.resize(self.data.len() + pad, 0);
    }

    /// Append raw bytes without alignment.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Append a byte.
    pub fn put_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    put_number!(put_i16, i16);
    put_number!(put_u16, u16);
    put_number!(put_i32, i32);
    put_number!(put_u32, u32);
    put_number!(put_i64, i64);
    put_number!(put_u64, u64);
    put_number!(put_f64, f64);

    /// Append a boolean as an aligned 32-bit 0 or 1.
    pub fn put_bool(&mut self, value: bool) {
        self.put_u32(u32::from(value));
    }

    /// Append a string: 32-bit length, bytes, NUL.
    pub fn put_str(&mut self, value: &str) -> Result<(), BusError> {
        let length = u32::try_from(value.len())
            .map_err(|_| BusError::Protocol("string too long for u32 length".to_string()))?;
        self.put_u32(length);
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
        Ok(())
    }

    /// Append a signature: 8-bit length, bytes, NUL.
    pub fn put_signature(&mut self, value: &str) -> Result<(), BusError> {
        let length = u8::try_from(value.len())
            .map_err(|_| BusError::Protocol("signature longer than 255 bytes".to_string()))?;
        self.data.push(length);
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
        Ok(())
    }

    /// Reserve an aligned 32-bit slot and return its offset.
    pub fn reserve_u32(&mut self) -> usize {
        self.align(4);
        let offset = self.data.len();
        self.data.extend_from_slice(&[0; 4]);
        offset
    }

    /// Overwrite a previously reserved 32-bit slot.
    ///
    /// # Panics
    ///
    /// Panics if `offset` does not point at four bytes already written.
    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        let bytes = match self.endian {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        };
        self.data[offset..offset + 4].copy_from_slice(&bytes);
    }

    /// Append a value with its natural alignment.
    pub fn put_value(&mut self, value: &Value) -> Result<(), BusError> {
        match value {
            Value::Byte(v) => self.put_u8(*v),
            Value::Boolean(v) => self.put_bool(*v),
            Value::Int16(v) => self.put_i16(*v),
            Value::UInt16(v) => self.put_u16(*v),
            Value::Int32(v) => self.put_i32(*v),
            Value::UInt32(v) | Value::UnixFd(v) => self.put_u32(*v),
            Value::Int64(v) => self.put_i64(*v),
            Value::UInt64(v) => self.put_u64(*v),
            Value::Double(v) => self.put_f64(*v),
            Value::String(v) => self.put_str(v)?,
            Value::ObjectPath(v) => self.put_str(v.as_str())?,
            Value::Signature(v) => self.put_signature(v.as_str())?,
            Value::Array(array) => {
                self.put_array(array.element().alignment(), |buf| {
                    array.items().iter().try_for_each(|item| buf.put_value(item))
                })?;
            }
            Value::Dict(dict) => {
                self.put_array(8, |buf| {
                    dict.entries().iter().try_for_each(|(key, value)| {
                        buf.align(8);
                        buf.put_value(key)?;
                        buf.put_value(value)
                    })
                })?;
            }
            Value::Struct(fields) => {
                self.align(8);
                for field in fields {
                    self.put_value(field)?;
                }
            }
            Value::Variant(variant) => {
                self.put_signature(&variant.signature())?;
                self.put_value(variant.value())?;
            }
        }
        Ok(())
    }

    /// Write an array: length placeholder, element padding, elements, backpatch.
    ///
    /// The measured length excludes the padding between the length and the
    /// first element.
    fn put_array<F>(&mut self, element_alignment: usize, write_elements: F) -> Result<(), BusError>
    where
        F: FnOnce(&mut Self) -> Result<(), BusError>,
    {
        let length_at = self.reserve_u32();
        self.align(element_alignment);
        let start = self.data.len();
        write_elements(self)?;
        let length = self.data.len() - start;
        if length > MAX_ARRAY_LENGTH {
            return Err(BusError::Protocol(format!(
                "array length {length} exceeds maximum {MAX_ARRAY_LENGTH}"
            )));
        }
        let length = u32::try_from(length)
            .map_err(|_| BusError::Protocol("array too long for u32 length".to_string()))?;
        self.patch_u32(length_at, length);
        Ok(())
    }

    /// Append every value in order.
    pub fn put_values(&mut self, values: &[Value]) -> Result<(), BusError> {
        values.iter().try_for_each(|value| self.put_value(value))
    }
}

macro_rules! get_number {
    ($name:ident, $t:ty) => {
        #[doc = concat!("Read an aligned `", stringify!($t), "`.")]
        pub fn $name(&mut self) -> Result<$t, BusError> {
            const SIZE: usize = std::mem::size_of::<$t>();
            self.align(SIZE)?;
            let bytes = self.take(SIZE)?;
            let mut raw = [0u8; SIZE];
            raw.copy_from_slice(bytes);
            Ok(match self.endian {
                Endian::Little => <$t>::from_le_bytes(raw),
                Endian::Big => <$t>::from_be_bytes(raw),
            })
        }
    };
}

/// Decoding cursor over a byte slice.
#[derive(Debug)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
    endian: Endian,
    max_array_length: usize,
    depth: usize,
}

impl<'a> WireReader<'a> {
    /// Create a reader positioned at the start of `data`.
    #[must_use]
    pub const fn new(data: &'a [u8], endian: Endian) -> Self {
        Self {
            data,
            pos: 0,
            endian,
            max_array_length: MAX_ARRAY_LENGTH,
            depth: 0,
        }
    }

    /// Create a reader positioned at `pos`.
    #[must_use]
    pub const fn at(data: &'a [u8], pos: usize, endian: Endian) -> Self {
        Self {
            data,
            pos,
            endian,
            max_array_length: MAX_ARRAY_LENGTH,
            depth: 0,
        }
    }

    /// Limit array payloads to `max` bytes.
    #[must_use]
    pub const fn with_max_array_length(mut self, max: usize) -> Self {
        self.max_array_length = max;
        self
    }

    /// Current offset.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    /// Whether every byte has been consumed.
    #[must_use]
    pub const fn is_at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], BusError> {
        let end = self
            .pos
            .checked_add(count)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                BusError::Protocol(format!(
                    "unexpected end of data: need {count} byte(s) at offset {}",
                    self.pos
                ))
            })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    /// Skip padding up to `alignment`, which must be zero bytes.
    pub fn align(&mut self, alignment: usize) -> Result<(), BusError> {
        let pad = padding(self.pos, alignment);
        let at = self.pos;
        if self.take(pad)?.iter().any(|b| *b != 0) {
            return Err(BusError::Protocol(format!("non-zero padding at offset {at}")));
        }
        Ok(())
    }

    /// Read a byte.
    pub fn get_u8(&mut self) -> Result<u8, BusError> {
        Ok(self.take(1)?[0])
    }

    get_number!(get_i16, i16);
    get_number!(get_u16, u16);
    get_number!(get_i32, i32);
    get_number!(get_u32, u32);
    get_number!(get_i64, i64);
    get_number!(get_u64, u64);
    get_number!(get_f64, f64);

    /// Read a boolean, which must be 0 or 1.
    pub fn get_bool(&mut self) -> Result<bool, BusError> {
        match self.get_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(BusError::Protocol(format!("invalid boolean value {other}"))),
        }
    }

    fn get_text(&mut self, length: usize) -> Result<String, BusError> {
        let bytes = self.take(length)?;
        if self.get_u8()? != 0 {
            return Err(BusError::Protocol("string is not NUL terminated".to_string()));
        }
        if bytes.contains(&0) {
            return Err(BusError::Protocol("string contains an embedded NUL".to_string()));
        }
        String::from_utf8(bytes.to_vec())
            .map_err(|_| BusError::Protocol("string is not valid UTF-8".to_string()))
    }

    /// Read a string.
    pub fn get_str(&mut self) -> Result<String, BusError> {
        let length = self.get_u32()? as usize;
        self.get_text(length)
    }

    /// Read an object path.
    pub fn get_object_path(&mut self) -> Result<ObjectPath, BusError> {
        let text = self.get_str()?;
        if !is_valid_object_path(&text) {
            return Err(BusError::Protocol(format!("invalid object path `{text}'")));
        }
        ObjectPath::new(text)
    }

    /// Read a signature.
    pub fn get_signature(&mut self) -> Result<Signature, BusError> {
        let length = usize::from(self.get_u8()?);
        let text = self.get_text(length)?;
        Signature::parse(&text).map_err(|e| BusError::Protocol(e.to_string()))
    }

    /// Read one value of type `ty`.
    pub fn get_value(&mut self, ty: &Type) -> Result<Value, BusError> {
        Ok(match ty {
            Type::Byte => Value::Byte(self.get_u8()?),
            Type::Boolean => Value::Boolean(self.get_bool()?),
            Type::Int16 => Value::Int16(self.get_i16()?),
            Type::UInt16 => Value::UInt16(self.get_u16()?),
            Type::Int32 => Value::Int32(self.get_i32()?),
            Type::UInt32 => Value::UInt32(self.get_u32()?),
            Type::Int64 => Value::Int64(self.get_i64()?),
            Type::UInt64 => Value::UInt64(self.get_u64()?),
            Type::Double => Value::Double(self.get_f64()?),
            Type::UnixFd => Value::UnixFd(self.get_u32()?),
            Type::String => Value::String(self.get_str()?),
            Type::ObjectPath => Value::ObjectPath(self.get_object_path()?),
            Type::Signature => Value::Signature(self.get_signature()?),
            Type::Array(element) => self.nested(|reader| reader.get_array(element))?,
            Type::Struct(fields) => self.nested(|reader| {
                reader.align(8)?;
                let values = fields
                    .iter()
                    .map(|field| reader.get_value(field))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Struct(values))
            })?,
            Type::Variant => self.nested(|reader| {
                let signature = reader.get_signature()?;
                let [inner] = signature.types() else {
                    return Err(BusError::Protocol(format!(
                        "variant signature `{signature}' is not a single complete type"
                    )));
                };
                Ok(Value::Variant(Variant::wrap(reader.get_value(inner)?)))
            })?,
            Type::DictEntry(..) => {
                return Err(BusError::Protocol(
                    "dict entry outside of an array".to_string(),
                ))
            }
        })
    }

    fn nested<F>(&mut self, read: F) -> Result<Value, BusError>
    where
        F: FnOnce(&mut Self) -> Result<Value, BusError>,
    {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(BusError::Protocol(format!(
                "container nesting exceeds maximum depth {MAX_DEPTH}"
            )));
        }
        let value = read(self);
        self.depth -= 1;
        value
    }

    fn get_array(&mut self, element: &Type) -> Result<Value, BusError> {
        let length = self.get_u32()? as usize;
        if length > self.max_array_length {
            return Err(BusError::Protocol(format!(
                "array length {length} exceeds maximum {}",
                self.max_array_length
            )));
        }
        self.align(element.alignment())?;
        let end = self.pos + length;
        if end > self.data.len() {
            return Err(BusError::Protocol(format!(
                "array length {length} runs past the end of the data"
            )));
        }
        let value = if let Type::DictEntry(key, value) = element {
            let mut entries = Vec::new();
            while self.pos < end {
                self.align(8)?;
                let k = self.get_value(key)?;
                let v = self.get_value(value)?;
                entries.push((k, v));
            }
            Value::Dict(Dict::from_trusted(
                key.as_ref().clone(),
                value.as_ref().clone(),
                entries,
            ))
        } else {
            let mut items = Vec::new();
            while self.pos < end {
                items.push(self.get_value(element)?);
            }
            Value::Array(Array::from_trusted(element.clone(), items))
        };
        if self.pos != end {
            return Err(BusError::Protocol(
                "array elements overrun the declared length".to_string(),
            ));
        }
        Ok(value)
    }

    /// Read one value per type of `signature`.
    pub fn get_values(&mut self, signature: &Signature) -> Result<Vec<Value>, BusError> {
        signature
            .types()
            .iter()
            .map(|ty| self.get_value(ty))
            .collect()
    }
}

/// Encode a sequence of values into a fresh buffer.
pub fn encode_values(values: &[Value], endian: Endian) -> Result<Vec<u8>, BusError> {
    let mut buffer = WireBuffer::new(endian);
    buffer.put_values(values)?;
    Ok(buffer.into_vec())
}

/// Decode a sequence of values that must consume `data` exactly.
pub fn decode_values(
    data: &[u8],
    signature: &Signature,
    endian: Endian,
) -> Result<Vec<Value>, BusError> {
    let mut reader = WireReader::new(data, endian);
    let values = reader.get_values(signature)?;
    if !reader.is_at_end() {
        return Err(BusError::Protocol(format!(
            "{} trailing byte(s) after values",
            data.len() - reader.position()
        )));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::IntoValue;
    use std::collections::HashMap;

    #[test]
    fn test_scalar_layout_little_endian() {
        let bytes = encode_values(&[Value::Byte(1), Value::UInt32(2)], Endian::Little).unwrap();
        assert_eq!(bytes, vec![1, 0, 0, 0, 2, 0, 0, 0]);
    }

    #[test]
    fn test_scalar_layout_big_endian() {
        let bytes = encode_values(&[Value::Byte(1), Value::Int16(-2)], Endian::Big).unwrap();
        assert_eq!(bytes, vec![1, 0, 0xff, 0xfe]);
    }

    #[test]
    fn test_string_layout() {
        let bytes = encode_values(&[Value::String("hi".into())], Endian::Little).unwrap();
        assert_eq!(bytes, vec![2, 0, 0, 0, b'h', b'i', 0]);
    }

    #[test]
    fn test_array_length_excludes_element_padding() {
        // u32 length at 0..4, pad to 8, one u64
        let value = vec![7u64].into_value();
        let bytes = encode_values(&[value], Endian::Little).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[0..4], &[8, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_empty_array_of_structs_still_pads() {
        let value = Vec::<(i32, i32)>::new().into_value();
        let bytes = encode_values(&[value], Endian::Little).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_values_start_at_natural_alignment() {
        let cases = [
            (Value::Int16(1), 2),
            (Value::Int32(1), 4),
            (Value::Boolean(true), 4),
            (Value::Int64(1), 8),
            (Value::Double(1.5), 8),
            (Value::Struct(vec![Value::Byte(1)]), 8),
            (Value::String("a".into()), 4),
        ];
        for prefix in 0..8 {
            for (value, alignment) in &cases {
                let mut buffer = WireBuffer::new(Endian::Little);
                for _ in 0..prefix {
                    buffer.put_u8(0xaa);
                }
                buffer.align(value.value_type().alignment());
                assert_eq!(buffer.len() % alignment, 0);
                let before = buffer.len();
                buffer.put_value(value).unwrap();
                assert!(buffer.len() > before);
            }
        }
    }

    #[test]
    fn test_round_trip_nested_values() {
        let mut map = HashMap::new();
        map.insert("answer".to_string(), crate::value::Variant::new(42i32));
        let values = vec![
            Value::Byte(9),
            map.into_value(),
            (1.5f64, vec![true, false], ObjectPath::new("/a/b").unwrap()).into_value(),
            Value::Variant(Variant::new(vec!["x".to_string(), "y".to_string()])),
            Value::Signature(Signature::parse("a{sv}").unwrap()),
            Value::Int64(-3),
        ];
        let signature = Signature::from_types(values.iter().map(Value::value_type).collect())
            .unwrap();
        for endian in [Endian::Little, Endian::Big] {
            let bytes = encode_values(&values, endian).unwrap();
            let decoded = decode_values(&bytes, &signature, endian).unwrap();
            assert_eq!(decoded, values);
            let again = Signature::from_types(decoded.iter().map(Value::value_type).collect())
                .unwrap();
            assert_eq!(again, signature);
        }
    }

    #[test]
    fn test_rejects_non_zero_padding() {
        let signature = Signature::parse("yu").unwrap();
        let bytes = [1, 9, 0, 0, 2, 0, 0, 0];
        let err = decode_values(&bytes, &signature, Endian::Little).unwrap_err();
        assert!(matches!(err, BusError::Protocol(_)));
    }

    #[test]
    fn test_rejects_bad_boolean() {
        let signature = Signature::parse("b").unwrap();
        let err = decode_values(&[2, 0, 0, 0], &signature, Endian::Little).unwrap_err();
        assert!(matches!(err, BusError::Protocol(_)));
    }

    #[test]
    fn test_rejects_oversized_array() {
        let signature = Signature::parse("ay").unwrap();
        let bytes = [0xff, 0xff, 0xff, 0x7f];
        let err = decode_values(&bytes, &signature, Endian::Little).unwrap_err();
        assert!(matches!(err, BusError::Protocol(_)));
    }

    #[test]
    fn test_rejects_truncated_string() {
        let signature = Signature::parse("s").unwrap();
        let err = decode_values(&[5, 0, 0, 0, b'a'], &signature, Endian::Little).unwrap_err();
        assert!(matches!(err, BusError::Protocol(_)));
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let signature = Signature::parse("y").unwrap();
        let err = decode_values(&[1, 2], &signature, Endian::Little).unwrap_err();
        assert!(matches!(err, BusError::Protocol(_)));
    }

    #[test]
    fn test_patch_u32_overwrites_in_place() {
        let mut buffer = WireBuffer::new(Endian::Big);
        buffer.put_u8(1);
        let at = buffer.reserve_u32();
        buffer.put_u8(2);
        buffer.patch_u32(at, 0x0102_0304);
        assert_eq!(buffer.as_slice(), &[1, 0, 0, 0, 1, 2, 3, 4, 2]);
    }
}
