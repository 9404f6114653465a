//! Layer 2: Property values
//!
//! `Value` is the typed payload tree carried by every entity. It mirrors
//! the closed layout tag set; the codec validates values against a layout
//! when encoding.

use std::cmp::Ordering;

use uuid::Uuid;

use super::layout::Fingerprint;

/// A typed property value.
///
/// Not `Eq`: the tree may hold floats. Map entries are kept unsorted in
/// memory; the codec emits them in sorted key order for determinism.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(String),
    Uuid(Uuid),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Optional(Option<Box<Value>>),
    /// Nested entity value: the referenced layout's fingerprint plus its
    /// property values in layout order.
    Nested(Fingerprint, Vec<Value>),
}

impl Value {
    pub fn some(value: Value) -> Self {
        Value::Optional(Some(Box::new(value)))
    }

    pub fn none() -> Self {
        Value::Optional(None)
    }

    /// Tag name for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::I8(_) => "i8",
            Value::I16(_) => "i16",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Str(_) => "str",
            Value::Uuid(_) => "uuid",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Optional(_) => "optional",
            Value::Nested(..) => "layout",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I8(v) => Some(i64::from(*v)),
            Value::I16(v) => Some(i64::from(*v)),
            Value::I32(v) => Some(i64::from(*v)),
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<&Uuid> {
        match self {
            Value::Uuid(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) => Some(v),
            _ => None,
        }
    }
}

/// Scalar subset of [`Value`] with a total order.
///
/// Map keys and indexed attributes must reduce to this: sorted-key map
/// encoding and B-tree index keys both need `Ord`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScalarValue {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    Str(String),
    Uuid(Uuid),
    Bytes(Vec<u8>),
}

impl ScalarValue {
    /// Borrowing extraction; `None` for non-scalar values.
    pub fn from_value(value: &Value) -> Option<ScalarValue> {
        match value {
            Value::Bool(v) => Some(ScalarValue::Bool(*v)),
            Value::I8(v) => Some(ScalarValue::I8(*v)),
            Value::I16(v) => Some(ScalarValue::I16(*v)),
            Value::I32(v) => Some(ScalarValue::I32(*v)),
            Value::I64(v) => Some(ScalarValue::I64(*v)),
            Value::Str(v) => Some(ScalarValue::Str(v.clone())),
            Value::Uuid(v) => Some(ScalarValue::Uuid(*v)),
            Value::Bytes(v) => Some(ScalarValue::Bytes(v.clone())),
            _ => None,
        }
    }
}

/// Total order over two scalar values of the same tag.
///
/// `None` when either side is non-scalar or the tags differ; the layout
/// engine guarantees neither happens for well-typed maps.
pub fn scalar_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    let a = ScalarValue::from_value(a)?;
    let b = ScalarValue::from_value(b)?;
    if std::mem::discriminant(&a) != std::mem::discriminant(&b) {
        return None;
    }
    Some(a.cmp(&b))
}
