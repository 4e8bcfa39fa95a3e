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

//! Signature grammar.
//!
//! A signature is a string over a small alphabet describing one or more
//! complete types:
//!
//! ```text
//! y byte      b boolean   n int16    q uint16   i int32    u uint32
//! x int64     t uint64    d double   h unix fd  s string   o object path
//! g signature v variant   aT array of T          (T...) struct
//! a{KV} array of dict entries, K must be a basic type
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::BusError;

/// Longest signature accepted on the wire.
pub const MAX_SIGNATURE_LENGTH: usize = 255;

/// Deepest array nesting accepted in a signature.
pub const MAX_ARRAY_DEPTH: usize = 32;

/// Deepest struct nesting accepted in a signature.
pub const MAX_STRUCT_DEPTH: usize = 32;

/// A single complete wire type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    /// `y`
    Byte,
    /// `b`
    Boolean,
    /// `n`
    Int16,
    /// `q`
    UInt16,
    /// `i`
    Int32,
    /// `u`
    UInt32,
    /// `x`
    Int64,
    /// `t`
    UInt64,
    /// `d`
    Double,
    /// `s`
    String,
    /// `o`
    ObjectPath,
    /// `g`
    Signature,
    /// `h`
    UnixFd,
    /// `v`
    Variant,
    /// `aT`
    Array(Box<Type>),
    /// `(T...)`
    Struct(Vec<Type>),
    /// `{KV}`, only valid as the element type of an array.
    DictEntry(Box<Type>, Box<Type>),
}

impl Type {
    /// Natural alignment of values of this type, in bytes.
    #[must_use]
    pub const fn alignment(&self) -> usize {
        match self {
            Self::Byte | Self::Signature | Self::Variant => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Boolean
            | Self::Int32
            | Self::UInt32
            | Self::UnixFd
            | Self::String
            | Self::ObjectPath
            | Self::Array(_) => 4,
            Self::Int64 | Self::UInt64 | Self::Double | Self::Struct(_) | Self::DictEntry(..) => 8,
        }
    }

    /// Whether this is a basic (non-container) type, usable as a dict key.
    #[must_use]
    pub const fn is_basic(&self) -> bool {
        !matches!(
            self,
            Self::Variant | Self::Array(_) | Self::Struct(_) | Self::DictEntry(..)
        )
    }

    /// Shorthand for `a{KV}`.
    #[must_use]
    pub fn dict(key: Self, value: Self) -> Self {
        Self::Array(Box::new(Self::DictEntry(Box::new(key), Box::new(value))))
    }

    /// Parse exactly one complete type.
    pub fn parse(signature: &str) -> Result<Self, BusError> {
        let mut parser = Parser::new(signature)?;
        let ty = parser.parse_type()?;
        if !parser.at_end() {
            return Err(BusError::Parse(format!(
                "signature `{signature}' holds more than one complete type"
            )));
        }
        Ok(ty)
    }

    fn write_to(&self, out: &mut String) {
        let code = match self {
            Self::Byte => 'y',
            Self::Boolean => 'b',
            Self::Int16 => 'n',
            Self::UInt16 => 'q',
            Self::Int32 => 'i',
            Self::UInt32 => 'u',
            Self::Int64 => 'x',
            Self::UInt64 => 't',
            Self::Double => 'd',
            Self::String => 's',
            Self::ObjectPath => 'o',
            Self::Signature => 'g',
            Self::UnixFd => 'h',
            Self::Variant => 'v',
            Self::Array(element) => {
                out.push('a');
                element.write_to(out);
                return;
            }
            Self::Struct(fields) => {
                out.push('(');
                for field in fields {
                    field.write_to(out);
                }
                out.push(')');
                return;
            }
            Self::DictEntry(key, value) => {
                out.push('{');
                key.write_to(out);
                value.write_to(out);
                out.push('}');
                return;
            }
        };
        out.push(code);
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.write_to(&mut out);
        f.write_str(&out)
    }
}

impl FromStr for Type {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A validated signature: a sequence of zero or more complete types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Signature {
    text: String,
    types: Vec<Type>,
}

impl Signature {
    /// The empty signature.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse and validate a signature string.
    pub fn parse(signature: &str) -> Result<Self, BusError> {
        let mut parser = Parser::new(signature)?;
        let mut types = Vec::new();
        while !parser.at_end() {
            types.push(parser.parse_type()?);
        }
        Ok(Self {
            text: signature.to_string(),
            types,
        })
    }

    /// Build the signature of a sequence of types.
    pub fn from_types(types: Vec<Type>) -> Result<Self, BusError> {
        let mut text = String::new();
        for ty in &types {
            ty.write_to(&mut text);
        }
        if text.len() > MAX_SIGNATURE_LENGTH {
            return Err(BusError::Parse(format!(
                "signature length {} exceeds maximum {MAX_SIGNATURE_LENGTH}",
                text.len()
            )));
        }
        Ok(Self { text, types })
    }

    /// The signature text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// The complete types, in order.
    #[must_use]
    pub fn types(&self) -> &[Type] {
        &self.types
    }

    /// Whether the signature holds no types.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for Signature {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for Signature {
    type Error = BusError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

/// Cursor over signature bytes.
struct Parser<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
    array_depth: usize,
    struct_depth: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Result<Self, BusError> {
        if source.len() > MAX_SIGNATURE_LENGTH {
            return Err(BusError::Parse(format!(
                "signature length {} exceeds maximum {MAX_SIGNATURE_LENGTH}",
                source.len()
            )));
        }
        Ok(Self {
            source,
            bytes: source.as_bytes(),
            pos: 0,
            array_depth: 0,
            struct_depth: 0,
        })
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn error(&self, what: &str) -> BusError {
        BusError::Parse(format!(
            "{what} at offset {} in signature `{}'",
            self.pos, self.source
        ))
    }

    fn parse_type(&mut self) -> Result<Type, BusError> {
        let Some(code) = self.peek() else {
            return Err(self.error("unexpected end"));
        };
        self.pos += 1;
        let ty = match code {
            b'y' => Type::Byte,
            b'b' => Type::Boolean,
            b'n' => Type::Int16,
            b'q' => Type::UInt16,
            b'i' => Type::Int32,
            b'u' => Type::UInt32,
            b'x' => Type::Int64,
            b't' => Type::UInt64,
            b'd' => Type::Double,
            b's' => Type::String,
            b'o' => Type::ObjectPath,
            b'g' => Type::Signature,
            b'h' => Type::UnixFd,
            b'v' => Type::Variant,
            b'a' => self.parse_array()?,
            b'(' => self.parse_struct()?,
            b'{' => return Err(self.error("dict entry outside of an array")),
            b')' | b'}' => return Err(self.error("unbalanced closing bracket")),
            other => {
                return Err(self.error(&format!("unknown type code `{}'", char::from(other))))
            }
        };
        Ok(ty)
    }

    fn parse_array(&mut self) -> Result<Type, BusError> {
        self.array_depth += 1;
        if self.array_depth > MAX_ARRAY_DEPTH {
            return Err(self.error("array nesting too deep"));
        }
        let element = if self.peek() == Some(b'{') {
            self.pos += 1;
            let key = self.parse_type()?;
            if !key.is_basic() {
                return Err(self.error("dict entry key must be a basic type"));
            }
            let value = self.parse_type()?;
            if self.peek() != Some(b'}') {
                return Err(self.error("dict entry must hold exactly two types"));
            }
            self.pos += 1;
            Type::DictEntry(Box::new(key), Box::new(value))
        } else {
            self.parse_type()?
        };
        self.array_depth -= 1;
        Ok(Type::Array(Box::new(element)))
    }

    fn parse_struct(&mut self) -> Result<Type, BusError> {
        self.struct_depth += 1;
        if self.struct_depth > MAX_STRUCT_DEPTH {
            return Err(self.error("struct nesting too deep"));
        }
        let mut fields = Vec::new();
        loop {
            match self.peek() {
                Some(b')') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => fields.push(self.parse_type()?),
                None => return Err(self.error("unterminated struct")),
            }
        }
        if fields.is_empty() {
            return Err(self.error("empty struct"));
        }
        self.struct_depth -= 1;
        Ok(Type::Struct(fields))
    }
}
