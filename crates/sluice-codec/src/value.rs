//! The AMQP value model.

use bytes::Bytes;
use std::fmt;

use crate::error::{DecodeError, Result};

/// An AMQP symbolic value (ASCII).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Symbol {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Symbol {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Discriminant of a [`Value`], used for array element typing and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Boolean,
    Ubyte,
    Ushort,
    Uint,
    Ulong,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    Decimal32,
    Decimal64,
    Decimal128,
    Char,
    Timestamp,
    Uuid,
    Binary,
    String,
    Symbol,
    List,
    Map,
    Array,
    Described,
}

impl ValueKind {
    pub const fn name(&self) -> &'static str {
        match self {
            ValueKind::Null => "null",
            ValueKind::Boolean => "boolean",
            ValueKind::Ubyte => "ubyte",
            ValueKind::Ushort => "ushort",
            ValueKind::Uint => "uint",
            ValueKind::Ulong => "ulong",
            ValueKind::Byte => "byte",
            ValueKind::Short => "short",
            ValueKind::Int => "int",
            ValueKind::Long => "long",
            ValueKind::Float => "float",
            ValueKind::Double => "double",
            ValueKind::Decimal32 => "decimal32",
            ValueKind::Decimal64 => "decimal64",
            ValueKind::Decimal128 => "decimal128",
            ValueKind::Char => "char",
            ValueKind::Timestamp => "timestamp",
            ValueKind::Uuid => "uuid",
            ValueKind::Binary => "binary",
            ValueKind::String => "string",
            ValueKind::Symbol => "symbol",
            ValueKind::List => "list",
            ValueKind::Map => "map",
            ValueKind::Array => "array",
            ValueKind::Described => "described",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A described value: a descriptor (ulong code or symbol) plus the value it describes.
#[derive(Debug, Clone, PartialEq)]
pub struct Described {
    pub descriptor: Value,
    pub value: Value,
}

impl Described {
    pub fn new(descriptor: Value, value: Value) -> Self {
        Self { descriptor, value }
    }
}

/// A homogeneous AMQP array.
///
/// All elements share one constructor on the wire, so construction checks
/// that every element has the declared kind. Arrays of described values
/// carry the shared descriptor separately and store the undescribed
/// elements.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    kind: ValueKind,
    descriptor: Option<Box<Value>>,
    items: Vec<Value>,
}

impl Array {
    pub fn new(kind: ValueKind, items: Vec<Value>) -> Result<Self> {
        if kind == ValueKind::Described {
            return Err(DecodeError::UnexpectedType {
                expected: "an undescribed element kind",
                actual: kind,
            });
        }
        if let Some(bad) = items.iter().find(|item| item.kind() != kind) {
            return Err(DecodeError::MixedArray {
                expected: kind,
                actual: bad.kind(),
            });
        }
        Ok(Self {
            kind,
            descriptor: None,
            items,
        })
    }

    /// Creates an array whose elements all share `descriptor`.
    pub fn described(descriptor: Value, kind: ValueKind, items: Vec<Value>) -> Result<Self> {
        let mut array = Self::new(kind, items)?;
        array.descriptor = Some(Box::new(descriptor));
        Ok(array)
    }

    pub fn of_symbols<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        Self {
            kind: ValueKind::Symbol,
            descriptor: None,
            items: symbols
                .into_iter()
                .map(|s| Value::Symbol(s.into()))
                .collect(),
        }
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn descriptor(&self) -> Option<&Value> {
        self.descriptor.as_deref()
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn into_items(self) -> Vec<Value> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn from_parts(
        kind: ValueKind,
        descriptor: Option<Value>,
        items: Vec<Value>,
    ) -> Self {
        Self {
            kind,
            descriptor: descriptor.map(Box::new),
            items,
        }
    }
}

/// Any value of the AMQP type system.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Ubyte(u8),
    Ushort(u16),
    Uint(u32),
    Ulong(u64),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Decimal32([u8; 4]),
    Decimal64([u8; 8]),
    Decimal128([u8; 16]),
    Char(char),
    /// Milliseconds since the unix epoch.
    Timestamp(i64),
    Uuid([u8; 16]),
    Binary(Bytes),
    String(String),
    Symbol(Symbol),
    List(Vec<Value>),
    /// Flat key/value pairs in wire order.
    Map(Vec<(Value, Value)>),
    Array(Array),
    Described(Box<Described>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Ubyte(_) => ValueKind::Ubyte,
            Value::Ushort(_) => ValueKind::Ushort,
            Value::Uint(_) => ValueKind::Uint,
            Value::Ulong(_) => ValueKind::Ulong,
            Value::Byte(_) => ValueKind::Byte,
            Value::Short(_) => ValueKind::Short,
            Value::Int(_) => ValueKind::Int,
            Value::Long(_) => ValueKind::Long,
            Value::Float(_) => ValueKind::Float,
            Value::Double(_) => ValueKind::Double,
            Value::Decimal32(_) => ValueKind::Decimal32,
            Value::Decimal64(_) => ValueKind::Decimal64,
            Value::Decimal128(_) => ValueKind::Decimal128,
            Value::Char(_) => ValueKind::Char,
            Value::Timestamp(_) => ValueKind::Timestamp,
            Value::Uuid(_) => ValueKind::Uuid,
            Value::Binary(_) => ValueKind::Binary,
            Value::String(_) => ValueKind::String,
            Value::Symbol(_) => ValueKind::Symbol,
            Value::List(_) => ValueKind::List,
            Value::Map(_) => ValueKind::Map,
            Value::Array(_) => ValueKind::Array,
            Value::Described(_) => ValueKind::Described,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn described(descriptor: Value, value: Value) -> Self {
        Value::Described(Box::new(Described::new(descriptor, value)))
    }

    pub fn symbol(value: &str) -> Self {
        Value::Symbol(Symbol::from(value))
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::$variant(value)
                }
            }
        )*
    };
}

value_from! {
    bool => Boolean,
    u8 => Ubyte,
    u16 => Ushort,
    u32 => Uint,
    u64 => Ulong,
    i8 => Byte,
    i16 => Short,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    char => Char,
    Bytes => Binary,
    String => String,
    Symbol => Symbol,
    Array => Array,
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_rejects_mixed_elements() {
        let err = Array::new(ValueKind::Uint, vec![Value::Uint(1), Value::Int(2)]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::MixedArray {
                expected: ValueKind::Uint,
                actual: ValueKind::Int
            }
        );
    }

    #[test]
    fn test_option_into_value() {
        let none: Option<u32> = None;
        assert_eq!(Value::from(none), Value::Null);
        assert_eq!(Value::from(Some(7u32)), Value::Uint(7));
    }
}
