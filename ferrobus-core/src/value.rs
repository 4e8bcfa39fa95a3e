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

//! Dynamically typed wire values.
//!
//! [`Value`] is the sum of every wire type. Containers remember their element
//! types so that an empty array still has a signature, and [`Variant`] boxes
//! a value together with the signature derived from it.

use crate::convert::{FromValue, IntoValue};
use crate::error::BusError;
use crate::names::ObjectPath;
use crate::signature::{Signature, Type};

/// A single wire value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `y`
    Byte(u8),
    /// `b`
    Boolean(bool),
    /// `n`
    Int16(i16),
    /// `q`
    UInt16(u16),
    /// `i`
    Int32(i32),
    /// `u`
    UInt32(u32),
    /// `x`
    Int64(i64),
    /// `t`
    UInt64(u64),
    /// `d`
    Double(f64),
    /// `s`
    String(String),
    /// `o`
    ObjectPath(ObjectPath),
    /// `g`
    Signature(Signature),
    /// `h`, an index into the out-of-band descriptor list.
    UnixFd(u32),
    /// `aT` for any `T` except dict entries.
    Array(Array),
    /// `a{KV}`
    Dict(Dict),
    /// `(T...)`
    Struct(Vec<Value>),
    /// `v`
    Variant(Variant),
}

impl Value {
    /// The wire type of this value.
    #[must_use]
    pub fn value_type(&self) -> Type {
        match self {
            Self::Byte(_) => Type::Byte,
            Self::Boolean(_) => Type::Boolean,
            Self::Int16(_) => Type::Int16,
            Self::UInt16(_) => Type::UInt16,
            Self::Int32(_) => Type::Int32,
            Self::UInt32(_) => Type::UInt32,
            Self::Int64(_) => Type::Int64,
            Self::UInt64(_) => Type::UInt64,
            Self::Double(_) => Type::Double,
            Self::String(_) => Type::String,
            Self::ObjectPath(_) => Type::ObjectPath,
            Self::Signature(_) => Type::Signature,
            Self::UnixFd(_) => Type::UnixFd,
            Self::Array(array) => Type::Array(Box::new(array.element.clone())),
            Self::Dict(dict) => Type::dict(dict.key.clone(), dict.value.clone()),
            Self::Struct(fields) => Type::Struct(fields.iter().map(Self::value_type).collect()),
            Self::Variant(_) => Type::Variant,
        }
    }

    /// The signature text of this value's type.
    #[must_use]
    pub fn signature(&self) -> String {
        self.value_type().to_string()
    }

    /// Borrow the string payload of `s`, `o` and `g` values.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            Self::ObjectPath(p) => Some(p.as_str()),
            Self::Signature(g) => Some(g.as_str()),
            Self::Variant(v) => v.value().as_str(),
            _ => None,
        }
    }

    /// Convert into the shape described by `target`.
    ///
    /// Recurses through containers. A variant is unwrapped when a concrete
    /// type is expected, and any value is wrapped when `target` is `v`.
    pub fn coerce(self, target: &Type) -> Result<Self, BusError> {
        if *target == Type::Variant {
            return Ok(match self {
                Self::Variant(_) => self,
                other => Self::Variant(Variant::wrap(other)),
            });
        }
        match (self, target) {
            (Self::Variant(inner), _) => inner.into_inner().coerce(target),
            (Self::Array(array), Type::Array(element)) => match element.as_ref() {
                Type::DictEntry(key, value) if array.items.is_empty() => {
                    Ok(Self::Dict(Dict::empty(key.as_ref().clone(), value.as_ref().clone())))
                }
                Type::DictEntry(..) => Err(mismatch(&Self::Array(array), target)),
                element => {
                    let items = array
                        .items
                        .into_iter()
                        .map(|item| item.coerce(element))
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(Self::Array(Array {
                        element: element.clone(),
                        items,
                    }))
                }
            },
            (Self::Dict(dict), Type::Array(element)) => match element.as_ref() {
                Type::DictEntry(key, value) => {
                    let entries = dict
                        .entries
                        .into_iter()
                        .map(|(k, v)| Ok((k.coerce(key)?, v.coerce(value)?)))
                        .collect::<Result<Vec<_>, BusError>>()?;
                    Ok(Self::Dict(Dict {
                        key: key.as_ref().clone(),
                        value: value.as_ref().clone(),
                        entries,
                    }))
                }
                _ => Err(mismatch(&Self::Dict(dict), target)),
            },
            (Self::Struct(fields), Type::Struct(types)) if fields.len() == types.len() => {
                let fields = fields
                    .into_iter()
                    .zip(types)
                    .map(|(field, ty)| field.coerce(ty))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::Struct(fields))
            }
            (value, target) if value.value_type() == *target => Ok(value),
            (value, target) => Err(mismatch(&value, target)),
        }
    }
}

fn mismatch(value: &Value, target: &Type) -> BusError {
    BusError::InvalidArgs(format!(
        "cannot convert value of type `{}' to `{target}'",
        value.signature()
    ))
}

/// Homogeneous array of non-dict-entry elements.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    element: Type,
    items: Vec<Value>,
}

impl Array {
    /// Build an array, checking every item against `element`.
    pub fn new(element: Type, items: Vec<Value>) -> Result<Self, BusError> {
        if matches!(element, Type::DictEntry(..)) {
            return Err(BusError::InvalidArgs(
                "dict entries must be held in a Dict".to_string(),
            ));
        }
        if let Some(bad) = items.iter().find(|item| item.value_type() != element) {
            return Err(mismatch(bad, &element));
        }
        Ok(Self { element, items })
    }

    /// An empty array of `element`.
    #[must_use]
    pub const fn empty(element: Type) -> Self {
        Self {
            element,
            items: Vec::new(),
        }
    }

    /// Build an array whose items are known to match `element`.
    pub(crate) const fn from_trusted(element: Type, items: Vec<Value>) -> Self {
        Self { element, items }
    }

    /// The element type.
    #[must_use]
    pub const fn element(&self) -> &Type {
        &self.element
    }

    /// The items.
    #[must_use]
    pub fn items(&self) -> &[Value] {
        &self.items
    }

    /// Consume the array and return its items.
    #[must_use]
    pub fn into_items(self) -> Vec<Value> {
        self.items
    }

    /// Number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the array has no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Array of dict entries, in wire order.
#[derive(Debug, Clone, PartialEq)]
pub struct Dict {
    key: Type,
    value: Type,
    entries: Vec<(Value, Value)>,
}

impl Dict {
    /// Build a dict, checking the key type and every entry.
    pub fn new(key: Type, value: Type, entries: Vec<(Value, Value)>) -> Result<Self, BusError> {
        if !key.is_basic() {
            return Err(BusError::InvalidArgs(format!(
                "dict key type `{key}' is not a basic type"
            )));
        }
        for (k, v) in &entries {
            if k.value_type() != key {
                return Err(mismatch(k, &key));
            }
            if v.value_type() != value {
                return Err(mismatch(v, &value));
            }
        }
        Ok(Self {
            key,
            value,
            entries,
        })
    }

    /// An empty dict.
    #[must_use]
    pub const fn empty(key: Type, value: Type) -> Self {
        Self {
            key,
            value,
            entries: Vec::new(),
        }
    }

    pub(crate) const fn from_trusted(key: Type, value: Type, entries: Vec<(Value, Value)>) -> Self {
        Self {
            key,
            value,
            entries,
        }
    }

    /// The key type.
    #[must_use]
    pub const fn key_type(&self) -> &Type {
        &self.key
    }

    /// The value type.
    #[must_use]
    pub const fn value_type(&self) -> &Type {
        &self.value
    }

    /// The entries in wire order.
    #[must_use]
    pub fn entries(&self) -> &[(Value, Value)] {
        &self.entries
    }

    /// Consume the dict and return its entries.
    #[must_use]
    pub fn into_entries(self) -> Vec<(Value, Value)> {
        self.entries
    }

    /// Look up the first entry whose key equals `key`.
    #[must_use]
    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the dict has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A self-describing value: the payload plus the signature derived from it.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant(Box<Value>);

impl Variant {
    /// Pack a native value.
    pub fn new<T: IntoValue>(value: T) -> Self {
        Self::wrap(value.into_value())
    }

    /// Pack a dynamic value. Nested variants are kept as they are.
    #[must_use]
    pub fn wrap(value: Value) -> Self {
        Self(Box::new(value))
    }

    /// Unpack into a native value, failing if the payload has another type.
    pub fn unpack<T: FromValue>(&self) -> Result<T, BusError> {
        T::from_value(self.0.as_ref().clone())
    }

    /// Signature of the payload.
    #[must_use]
    pub fn signature(&self) -> String {
        self.0.signature()
    }

    /// Borrow the payload.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Consume the variant and return the payload.
    #[must_use]
    pub fn into_inner(self) -> Value {
        *self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_signatures() {
        assert_eq!(Value::Int32(1).signature(), "i");
        assert_eq!(
            Value::Array(Array::empty(Type::String)).signature(),
            "as"
        );
        assert_eq!(
            Value::Dict(Dict::empty(Type::String, Type::Variant)).signature(),
            "a{sv}"
        );
        assert_eq!(
            Value::Struct(vec![Value::Byte(1), Value::String("x".into())]).signature(),
            "(ys)"
        );
        assert_eq!(
            Value::Variant(Variant::new(7u32)).signature(),
            "v"
        );
    }

    #[test]
    fn test_array_rejects_mixed_items() {
        let err = Array::new(Type::Int32, vec![Value::Int32(1), Value::String("x".into())]);
        assert!(matches!(err, Err(BusError::InvalidArgs(_))));
    }

    #[test]
    fn test_dict_rejects_container_keys() {
        let err = Dict::new(Type::Variant, Type::Int32, Vec::new());
        assert!(matches!(err, Err(BusError::InvalidArgs(_))));
    }

    #[test]
    fn test_coerce_wraps_into_variant_slot() {
        let coerced = Value::Int32(5).coerce(&Type::Variant).unwrap();
        assert_eq!(coerced, Value::Variant(Variant::new(5i32)));
    }

    #[test]
    fn test_coerce_unwraps_variant_for_concrete_slot() {
        let coerced = Value::Variant(Variant::new("hi"))
            .coerce(&Type::String)
            .unwrap();
        assert_eq!(coerced, Value::String("hi".into()));
    }

    #[test]
    fn test_coerce_recurses_through_containers() {
        let value = Value::Array(
            Array::new(
                Type::Variant,
                vec![Value::Variant(Variant::new(1i32)), Value::Variant(Variant::new(2i32))],
            )
            .unwrap(),
        );
        let coerced = value.coerce(&Type::Array(Box::new(Type::Int32))).unwrap();
        assert_eq!(
            coerced,
            Value::Array(Array::new(Type::Int32, vec![Value::Int32(1), Value::Int32(2)]).unwrap())
        );
    }

    #[test]
    fn test_coerce_empty_array_to_dict() {
        let coerced = Value::Array(Array::empty(Type::Variant))
            .coerce(&Type::dict(Type::String, Type::Variant))
            .unwrap();
        assert_eq!(coerced.signature(), "a{sv}");
    }

    #[test]
    fn test_coerce_mismatch() {
        let err = Value::String("x".into()).coerce(&Type::Int32);
        assert!(matches!(err, Err(BusError::InvalidArgs(_))));
    }

    #[test]
    fn test_variant_unpack() {
        let variant = Variant::new(42u64);
        assert_eq!(variant.signature(), "t");
        assert_eq!(variant.unpack::<u64>().unwrap(), 42);
        assert!(variant.unpack::<String>().is_err());
    }
}
