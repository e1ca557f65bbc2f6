//! Dynamic values crossing the process boundary.
//!
//! `Value` is what the dispatcher hands to constructors, methods, and property
//! accessors, and what they hand back. Typed Rust code converts in and out
//! through `IntoValue` and `FromValue`; `RemoteType` supplies the static type
//! descriptor used for overload resolution.

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::descriptor::{names, TypeDescriptor};
use crate::error::{RemexError, Result};
use crate::handle::ObjectHandle;

/// A dynamically typed value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// No value (void returns, null references).
    Null,
    Bool(bool),
    U8(u8),
    I8(i8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Char(char),
    String(String),
    Guid(Uuid),
    DateTime(DateTime<Utc>),
    Type(TypeDescriptor),
    Array {
        element: TypeDescriptor,
        items: Vec<Value>,
    },
    /// Structured data kept in serializer form until a typed consumer
    /// converts it.
    Object {
        ty: TypeDescriptor,
        fields: serde_json::Value,
    },
}

impl Value {
    /// The runtime type of this value.
    pub fn descriptor(&self) -> TypeDescriptor {
        let name = match self {
            Value::Null => names::OBJECT,
            Value::Bool(_) => names::BOOLEAN,
            Value::U8(_) => names::BYTE,
            Value::I8(_) => names::SBYTE,
            Value::I16(_) => names::INT16,
            Value::U16(_) => names::UINT16,
            Value::I32(_) => names::INT32,
            Value::U32(_) => names::UINT32,
            Value::I64(_) => names::INT64,
            Value::U64(_) => names::UINT64,
            Value::F32(_) => names::SINGLE,
            Value::F64(_) => names::DOUBLE,
            Value::Char(_) => names::CHAR,
            Value::String(_) => names::STRING,
            Value::Guid(_) => names::GUID,
            Value::DateTime(_) => names::DATE_TIME,
            Value::Type(_) => names::TYPE,
            Value::Array { element, .. } => return TypeDescriptor::array_of(element),
            Value::Object { ty, .. } => return ty.clone(),
        };
        TypeDescriptor::new(name)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The untagged serializer form of this value.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::U8(n) => Json::from(*n),
            Value::I8(n) => Json::from(*n),
            Value::I16(n) => Json::from(*n),
            Value::U16(n) => Json::from(*n),
            Value::I32(n) => Json::from(*n),
            Value::U32(n) => Json::from(*n),
            Value::I64(n) => Json::from(*n),
            Value::U64(n) => Json::from(*n),
            Value::F32(f) => float_to_json(f64::from(*f)),
            Value::F64(f) => float_to_json(*f),
            Value::Char(c) => Json::String(c.to_string()),
            Value::String(s) => Json::String(s.clone()),
            Value::Guid(g) => Json::String(g.to_string()),
            Value::DateTime(t) => Json::String(t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            Value::Type(d) => Json::String(d.to_string()),
            Value::Array { element, items } if element.as_str() == names::BYTE => {
                let bytes: Option<Vec<u8>> = items
                    .iter()
                    .map(|v| match v {
                        Value::U8(b) => Some(*b),
                        _ => None,
                    })
                    .collect();
                match bytes {
                    Some(bytes) => Json::String(general_purpose::STANDARD.encode(bytes)),
                    // Mixed items stay a plain array for the receiver to reject.
                    None => Json::Array(items.iter().map(Value::to_json).collect()),
                }
            }
            Value::Array { items, .. } => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Object { fields, .. } => fields.clone(),
        }
    }

    fn as_i128(&self) -> Option<i128> {
        Some(match self {
            Value::U8(n) => i128::from(*n),
            Value::I8(n) => i128::from(*n),
            Value::I16(n) => i128::from(*n),
            Value::U16(n) => i128::from(*n),
            Value::I32(n) => i128::from(*n),
            Value::U32(n) => i128::from(*n),
            Value::I64(n) => i128::from(*n),
            Value::U64(n) => i128::from(*n),
            _ => return None,
        })
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F32(f) => Some(f64::from(*f)),
            Value::F64(f) => Some(*f),
            other => other.as_i128().map(|n| n as f64),
        }
    }
}

/// Non-finite floats have no JSON number form; they travel as strings.
fn float_to_json(f: f64) -> serde_json::Value {
    serde_json::Number::from_f64(f)
        .map(serde_json::Value::Number)
        .unwrap_or_else(|| serde_json::Value::String(f.to_string()))
}

fn mismatch<T: RemoteType>(value: &Value) -> RemexError {
    if value.is_null() {
        return RemexError::EmptyResponse;
    }
    RemexError::coercion(
        T::descriptor(),
        format!("found a value of type {}", value.descriptor()),
    )
}

/// A Rust type with a fixed remote type descriptor.
pub trait RemoteType {
    fn descriptor() -> TypeDescriptor;
}

/// Conversion from a dynamic `Value`.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self>;
}

/// Conversion into a dynamic `Value`.
pub trait IntoValue {
    fn into_value(self) -> Value;
}

macro_rules! integer_value {
    ($($ty:ty => $variant:ident, $name:expr;)*) => {$(
        impl RemoteType for $ty {
            fn descriptor() -> TypeDescriptor {
                TypeDescriptor::new($name)
            }
        }

        impl IntoValue for $ty {
            fn into_value(self) -> Value {
                Value::$variant(self)
            }
        }

        impl FromValue for $ty {
            fn from_value(value: Value) -> Result<Self> {
                let n = value.as_i128().ok_or_else(|| mismatch::<$ty>(&value))?;
                <$ty>::try_from(n).map_err(|_| {
                    RemexError::coercion($name, format!("{} is out of range", n))
                })
            }
        }
    )*};
}

integer_value! {
    u8 => U8, names::BYTE;
    i8 => I8, names::SBYTE;
    i16 => I16, names::INT16;
    u16 => U16, names::UINT16;
    i32 => I32, names::INT32;
    u32 => U32, names::UINT32;
    i64 => I64, names::INT64;
    u64 => U64, names::UINT64;
}

macro_rules! simple_value {
    ($($ty:ty => $variant:ident, $name:expr;)*) => {$(
        impl RemoteType for $ty {
            fn descriptor() -> TypeDescriptor {
                TypeDescriptor::new($name)
            }
        }

        impl IntoValue for $ty {
            fn into_value(self) -> Value {
                Value::$variant(self)
            }
        }

        impl FromValue for $ty {
            fn from_value(value: Value) -> Result<Self> {
                match value {
                    Value::$variant(v) => Ok(v),
                    other => Err(mismatch::<$ty>(&other)),
                }
            }
        }
    )*};
}

simple_value! {
    bool => Bool, names::BOOLEAN;
    char => Char, names::CHAR;
    Uuid => Guid, names::GUID;
    DateTime<Utc> => DateTime, names::DATE_TIME;
    TypeDescriptor => Type, names::TYPE;
}

impl RemoteType for f32 {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::new(names::SINGLE)
    }
}

impl IntoValue for f32 {
    fn into_value(self) -> Value {
        Value::F32(self)
    }
}

impl FromValue for f32 {
    fn from_value(value: Value) -> Result<Self> {
        value.as_f64().map(|f| f as f32).ok_or_else(|| mismatch::<f32>(&value))
    }
}

impl RemoteType for f64 {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::new(names::DOUBLE)
    }
}

impl IntoValue for f64 {
    fn into_value(self) -> Value {
        Value::F64(self)
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self> {
        value.as_f64().ok_or_else(|| mismatch::<f64>(&value))
    }
}

impl RemoteType for String {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::new(names::STRING)
    }
}

impl IntoValue for String {
    fn into_value(self) -> Value {
        Value::String(self)
    }
}

impl IntoValue for &str {
    fn into_value(self) -> Value {
        Value::String(self.to_string())
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(s),
            Value::Char(c) => Ok(c.to_string()),
            other => Err(mismatch::<String>(&other)),
        }
    }
}

impl RemoteType for ObjectHandle {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::new(names::GUID)
    }
}

impl IntoValue for ObjectHandle {
    fn into_value(self) -> Value {
        Value::Guid(self.as_uuid())
    }
}

impl FromValue for ObjectHandle {
    fn from_value(value: Value) -> Result<Self> {
        Uuid::from_value(value).map(ObjectHandle::from_uuid)
    }
}

impl<T: RemoteType> RemoteType for Vec<T> {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::array_of(&T::descriptor())
    }
}

impl<T: RemoteType + IntoValue> IntoValue for Vec<T> {
    fn into_value(self) -> Value {
        Value::Array {
            element: T::descriptor(),
            items: self.into_iter().map(IntoValue::into_value).collect(),
        }
    }
}

impl<T: RemoteType + FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Array { items, .. } => items.into_iter().map(T::from_value).collect(),
            other => Err(mismatch::<Vec<T>>(&other)),
        }
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Value {
        self.map(IntoValue::into_value).unwrap_or(Value::Null)
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl IntoValue for () {
    fn into_value(self) -> Value {
        Value::Null
    }
}

/// Accepts any response; used for void calls.
impl FromValue for () {
    fn from_value(_: Value) -> Result<Self> {
        Ok(())
    }
}

/// A `Value` parameter accepts anything, like `System.Object`.
impl RemoteType for Value {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::new(names::OBJECT)
    }
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

/// Carries a serde data type through the serializer's structural converter.
///
/// The wrapped type names itself through `RemoteType`; its fields travel as a
/// plain JSON document.
#[derive(Debug, Clone, PartialEq)]
pub struct Structured<T>(pub T);

impl<T: RemoteType> RemoteType for Structured<T> {
    fn descriptor() -> TypeDescriptor {
        T::descriptor()
    }
}

impl<T: RemoteType + Serialize> IntoValue for Structured<T> {
    fn into_value(self) -> Value {
        // Only maps with non-string keys fail here; those travel as null.
        let fields = serde_json::to_value(&self.0).unwrap_or(serde_json::Value::Null);
        Value::Object {
            ty: T::descriptor(),
            fields,
        }
    }
}

impl<T: RemoteType + DeserializeOwned> FromValue for Structured<T> {
    fn from_value(value: Value) -> Result<Self> {
        if value.is_null() {
            return Err(RemexError::EmptyResponse);
        }
        serde_json::from_value(value.to_json())
            .map(Structured)
            .map_err(|e| RemexError::coercion(T::descriptor(), e.to_string()))
    }
}

/// Build an argument list of `Value`s from plain Rust expressions.
///
/// ```
/// use remex_core::{remote_args, Value};
///
/// let args = remote_args![3, "three", 'c'];
/// assert_eq!(args[0], Value::I32(3));
/// assert_eq!(args[2], Value::Char('c'));
/// ```
#[macro_export]
macro_rules! remote_args {
    ($($arg:expr),* $(,)?) => {
        vec![$($crate::value::IntoValue::into_value($arg)),*]
    };
}
