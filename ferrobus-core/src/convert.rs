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

//! Mapping between native Rust types and wire types.
//!
//! - [`WireType`] gives the static wire type of a native type.
//! - [`IntoValue`] and [`FromValue`] convert individual values.
//! - [`IntoArgs`] and [`FromReply`] convert whole message bodies positionally.
//!
//! Scalars map to single-character types, `Vec<T>` to arrays, maps to arrays
//! of dict entries and tuples to structs. [`Value`] itself is the open slot:
//! its wire type is `v`, so it is wrapped into a variant on the way out and
//! unwrapped on the way in. Structs with named fields get the same treatment
//! through `#[derive(WireStruct)]`.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use crate::error::BusError;
use crate::names::ObjectPath;
use crate::signature::{Signature, Type};
use crate::value::{Array, Dict, Value, Variant};

/// A native type with a fixed wire type.
pub trait WireType {
    /// The wire type of every value of `Self`.
    fn wire_type() -> Type;

    /// Signature text of [`WireType::wire_type`].
    fn signature() -> String {
        Self::wire_type().to_string()
    }
}

/// Conversion of a native value into a wire [`Value`].
pub trait IntoValue {
    /// Convert `self`.
    fn into_value(self) -> Value;
}

/// Conversion of a wire [`Value`] into a native value.
///
/// Implementations unwrap variants transparently.
pub trait FromValue: Sized {
    /// Convert `value`, failing with [`BusError::InvalidArgs`] on a type mismatch.
    fn from_value(value: Value) -> Result<Self, BusError>;
}

/// Error for a value that does not have the expected wire type.
#[must_use]
pub fn type_mismatch(expected: &Type, found: &Value) -> BusError {
    BusError::InvalidArgs(format!(
        "expected a value of type `{expected}', found `{}'",
        found.signature()
    ))
}

macro_rules! impl_scalar {
    ($native:ty, $variant:ident, $ty:ident) => {
        impl WireType for $native {
            fn wire_type() -> Type {
                Type::$ty
            }
        }

        impl IntoValue for $native {
            fn into_value(self) -> Value {
                Value::$variant(self)
            }
        }

        impl FromValue for $native {
            fn from_value(value: Value) -> Result<Self, BusError> {
                match value {
                    Value::$variant(v) => Ok(v),
                    Value::Variant(inner) => Self::from_value(inner.into_inner()),
                    other => Err(type_mismatch(&Type::$ty, &other)),
                }
            }
        }
    };
}

impl_scalar!(u8, Byte, Byte);
impl_scalar!(bool, Boolean, Boolean);
impl_scalar!(i16, Int16, Int16);
impl_scalar!(u16, UInt16, UInt16);
impl_scalar!(i32, Int32, Int32);
impl_scalar!(u32, UInt32, UInt32);
impl_scalar!(i64, Int64, Int64);
impl_scalar!(u64, UInt64, UInt64);
impl_scalar!(f64, Double, Double);
impl_scalar!(String, String, String);
impl_scalar!(ObjectPath, ObjectPath, ObjectPath);
impl_scalar!(Signature, Signature, Signature);

impl WireType for &str {
    fn wire_type() -> Type {
        Type::String
    }
}

impl IntoValue for &str {
    fn into_value(self) -> Value {
        Value::String(self.to_string())
    }
}

impl WireType for Variant {
    fn wire_type() -> Type {
        Type::Variant
    }
}

impl IntoValue for Variant {
    fn into_value(self) -> Value {
        Value::Variant(self)
    }
}

impl FromValue for Variant {
    fn from_value(value: Value) -> Result<Self, BusError> {
        Ok(match value {
            Value::Variant(v) => v,
            other => Variant::wrap(other),
        })
    }
}

impl WireType for Value {
    fn wire_type() -> Type {
        Type::Variant
    }
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        match self {
            Self::Variant(_) => self,
            other => Self::Variant(Variant::wrap(other)),
        }
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self, BusError> {
        Ok(match value {
            Self::Variant(inner) => inner.into_inner(),
            other => other,
        })
    }
}

impl<T: WireType> WireType for Vec<T> {
    fn wire_type() -> Type {
        Type::Array(Box::new(T::wire_type()))
    }
}

impl<T: WireType + IntoValue> IntoValue for Vec<T> {
    fn into_value(self) -> Value {
        let items = self.into_iter().map(IntoValue::into_value).collect();
        Value::Array(Array::from_trusted(T::wire_type(), items))
    }
}

impl<T: WireType + FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self, BusError> {
        match value {
            Value::Array(array) => array.into_items().into_iter().map(T::from_value).collect(),
            Value::Variant(inner) => Self::from_value(inner.into_inner()),
            other => Err(type_mismatch(&Self::wire_type(), &other)),
        }
    }
}

macro_rules! impl_map {
    ($map:ident, $($bound:path),+) => {
        impl<K: WireType, V: WireType> WireType for $map<K, V> {
            fn wire_type() -> Type {
                Type::dict(K::wire_type(), V::wire_type())
            }
        }

        impl<K, V> IntoValue for $map<K, V>
        where
            K: WireType + IntoValue,
            V: WireType + IntoValue,
        {
            fn into_value(self) -> Value {
                let entries = self
                    .into_iter()
                    .map(|(k, v)| (k.into_value(), v.into_value()))
                    .collect();
                Value::Dict(Dict::from_trusted(K::wire_type(), V::wire_type(), entries))
            }
        }

        impl<K, V> FromValue for $map<K, V>
        where
            K: WireType + FromValue $(+ $bound)+,
            V: WireType + FromValue,
        {
            fn from_value(value: Value) -> Result<Self, BusError> {
                match value {
                    Value::Dict(dict) => dict
                        .into_entries()
                        .into_iter()
                        .map(|(k, v)| Ok((K::from_value(k)?, V::from_value(v)?)))
                        .collect(),
                    Value::Array(array) if array.is_empty() => Ok(Self::new()),
                    Value::Variant(inner) => Self::from_value(inner.into_inner()),
                    other => Err(type_mismatch(&Self::wire_type(), &other)),
                }
            }
        }
    };
}

impl_map!(HashMap, Eq, Hash);
impl_map!(BTreeMap, Ord);

macro_rules! impl_tuple {
    ($len:expr; $($name:ident),+) => {
        impl<$($name: WireType),+> WireType for ($($name,)+) {
            fn wire_type() -> Type {
                Type::Struct(vec![$($name::wire_type()),+])
            }
        }

        impl<$($name: IntoValue),+> IntoValue for ($($name,)+) {
            #[allow(non_snake_case)]
            fn into_value(self) -> Value {
                let ($($name,)+) = self;
                Value::Struct(vec![$($name.into_value()),+])
            }
        }

        impl<$($name: WireType + FromValue),+> FromValue for ($($name,)+) {
            fn from_value(value: Value) -> Result<Self, BusError> {
                let mut fields = struct_fields(value, $len, &Self::wire_type())?;
                Ok(($(next_field::<$name>(&mut fields)?,)+))
            }
        }

        impl<$($name: WireType),+> WireArgs for ($($name,)+) {
            fn arg_types() -> Vec<Type> {
                vec![$($name::wire_type()),+]
            }
        }

        impl<$($name: IntoValue),+> IntoArgs for ($($name,)+) {
            #[allow(non_snake_case)]
            fn into_args(self) -> Vec<Value> {
                let ($($name,)+) = self;
                vec![$($name.into_value()),+]
            }
        }

        impl<$($name: FromValue),+> FromReply for ($($name,)+) {
            fn from_reply(body: Vec<Value>) -> Result<Self, BusError> {
                if body.len() != $len {
                    return Err(arity_mismatch($len, body.len()));
                }
                let mut values = body.into_iter();
                Ok(($(next_field::<$name>(&mut values)?,)+))
            }
        }
    };
}

impl_tuple!(1; A);
impl_tuple!(2; A, B);
impl_tuple!(3; A, B, C);
impl_tuple!(4; A, B, C, D);
impl_tuple!(5; A, B, C, D, E);
impl_tuple!(6; A, B, C, D, E, F);
impl_tuple!(7; A, B, C, D, E, F, G);
impl_tuple!(8; A, B, C, D, E, F, G, H);

/// Open a struct value for field-by-field conversion.
///
/// Variants are unwrapped first. Used by tuple conversions and by
/// `#[derive(WireStruct)]`.
pub fn struct_fields(
    value: Value,
    arity: usize,
    expected: &Type,
) -> Result<std::vec::IntoIter<Value>, BusError> {
    match value {
        Value::Struct(fields) if fields.len() == arity => Ok(fields.into_iter()),
        Value::Variant(inner) => struct_fields(inner.into_inner(), arity, expected),
        other => Err(type_mismatch(expected, &other)),
    }
}

/// Convert the next field of an opened struct or body.
pub fn next_field<T: FromValue>(fields: &mut std::vec::IntoIter<Value>) -> Result<T, BusError> {
    fields
        .next()
        .ok_or_else(|| BusError::InvalidArgs("missing struct field".to_string()))
        .and_then(T::from_value)
}

fn arity_mismatch(expected: usize, found: usize) -> BusError {
    BusError::InvalidArgs(format!(
        "expected {expected} value(s) in message body, found {found}"
    ))
}

/// Conversion of native call arguments into a message body.
pub trait IntoArgs {
    /// Convert `self` into body values, in order.
    fn into_args(self) -> Vec<Value>;
}

impl IntoArgs for () {
    fn into_args(self) -> Vec<Value> {
        Vec::new()
    }
}

impl IntoArgs for Vec<Value> {
    fn into_args(self) -> Vec<Value> {
        self
    }
}

/// Static types of a message body, one per argument.
///
/// Implemented for `()` and for tuples, whose members become separate
/// arguments rather than a struct.
pub trait WireArgs {
    /// Types of the arguments, in order.
    fn arg_types() -> Vec<Type>;

    /// Body signature of [`WireArgs::arg_types`].
    fn arg_signature() -> Result<Signature, BusError> {
        Signature::from_types(Self::arg_types())
    }
}

impl WireArgs for () {
    fn arg_types() -> Vec<Type> {
        Vec::new()
    }
}

/// Reconstruction of a native result from a reply body.
///
/// Tuples are filled positionally. Single-valued types expect a body with
/// exactly one value.
pub trait FromReply: Sized {
    /// Convert the reply body.
    fn from_reply(body: Vec<Value>) -> Result<Self, BusError>;
}

impl FromReply for () {
    fn from_reply(_body: Vec<Value>) -> Result<Self, BusError> {
        Ok(())
    }
}

/// Convert a single-value reply body.
pub fn single_reply<T: FromValue>(body: Vec<Value>) -> Result<T, BusError> {
    if body.len() != 1 {
        return Err(arity_mismatch(1, body.len()));
    }
    next_field(&mut body.into_iter())
}

macro_rules! impl_single_reply {
    ($($native:ty),+) => {
        $(
            impl FromReply for $native {
                fn from_reply(body: Vec<Value>) -> Result<Self, BusError> {
                    single_reply(body)
                }
            }
        )+
    };
}

impl_single_reply!(
    u8, bool, i16, u16, i32, u32, i64, u64, f64, String, ObjectPath, Signature, Variant, Value
);

impl<T: WireType + FromValue> FromReply for Vec<T> {
    fn from_reply(body: Vec<Value>) -> Result<Self, BusError> {
        single_reply(body)
    }
}

impl<K, V> FromReply for HashMap<K, V>
where
    K: WireType + FromValue + Eq + Hash,
    V: WireType + FromValue,
{
    fn from_reply(body: Vec<Value>) -> Result<Self, BusError> {
        single_reply(body)
    }
}

impl<K, V> FromReply for BTreeMap<K, V>
where
    K: WireType + FromValue + Ord,
    V: WireType + FromValue,
{
    fn from_reply(body: Vec<Value>) -> Result<Self, BusError> {
        single_reply(body)
    }
}
