//! Composite (described list) types.
//!
//! Performatives and most other AMQP composites are a descriptor followed by
//! a list whose entries are the fields in declaration order. Fields beyond
//! the encoded list length are unset; encoded entries beyond the type's
//! field count are an error.

use bytes::{Bytes, BytesMut};

use crate::encoder::encode;
use crate::error::{DecodeError, Result};
use crate::value::{Array, Described, Symbol, Value, ValueKind};

/// Key/value map used for properties, annotations and error info.
pub type Fields = Vec<(Value, Value)>;

/// A list-shaped described type with a fixed field layout.
pub trait DescribedType: Sized {
    /// Name used in error messages.
    const NAME: &'static str;
    const DESCRIPTOR_CODE: u64;
    const DESCRIPTOR_SYMBOL: &'static str;
    const FIELD_COUNT: usize;

    /// Field values in declaration order, unset fields as [`Value::Null`].
    fn fields(&self) -> Vec<Value>;

    fn from_fields(reader: &mut FieldReader) -> Result<Self>;

    fn to_value(&self) -> Value {
        let mut fields = self.fields();
        while matches!(fields.last(), Some(Value::Null)) {
            fields.pop();
        }
        Value::described(Value::Ulong(Self::DESCRIPTOR_CODE), Value::List(fields))
    }

    fn encode(&self, buf: &mut BytesMut) {
        encode(&self.to_value(), buf);
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Described(described) => Self::from_described(*described),
            other => Err(DecodeError::UnexpectedType {
                expected: Self::NAME,
                actual: other.kind(),
            }),
        }
    }

    fn from_described(described: Described) -> Result<Self> {
        if !is_descriptor::<Self>(&described.descriptor) {
            return Err(DecodeError::UnknownDescriptor(descriptor_name(
                &described.descriptor,
            )));
        }
        Self::from_body(described.value)
    }

    /// Decodes the list body of an already matched descriptor.
    fn from_body(body: Value) -> Result<Self> {
        let items = match body {
            Value::List(items) => items,
            other => {
                return Err(DecodeError::UnexpectedType {
                    expected: "list",
                    actual: other.kind(),
                })
            }
        };
        if items.len() > Self::FIELD_COUNT {
            return Err(DecodeError::TooManyFields {
                type_name: Self::NAME,
                max: Self::FIELD_COUNT,
                actual: items.len(),
            });
        }
        let mut reader = FieldReader::new(Self::NAME, items);
        Self::from_fields(&mut reader)
    }
}

/// Whether `descriptor` (numeric or symbolic) names `T`.
pub fn is_descriptor<T: DescribedType>(descriptor: &Value) -> bool {
    match descriptor {
        Value::Ulong(code) => *code == T::DESCRIPTOR_CODE,
        Value::Symbol(symbol) => symbol.as_str() == T::DESCRIPTOR_SYMBOL,
        _ => false,
    }
}

pub(crate) fn descriptor_name(descriptor: &Value) -> String {
    match descriptor {
        Value::Ulong(code) => format!("0x{code:08x}"),
        Value::Symbol(symbol) => symbol.to_string(),
        other => other.kind().to_string(),
    }
}

/// Sequential access to the fields of a composite.
#[derive(Debug)]
pub struct FieldReader {
    type_name: &'static str,
    fields: std::vec::IntoIter<Value>,
}

impl FieldReader {
    pub fn new(type_name: &'static str, fields: Vec<Value>) -> Self {
        Self {
            type_name,
            fields: fields.into_iter(),
        }
    }

    /// The next field, [`Value::Null`] past the end of the encoded list.
    pub fn next_value(&mut self) -> Value {
        self.fields.next().unwrap_or(Value::Null)
    }

    pub fn optional<T: TryFromValue>(&mut self) -> Result<Option<T>> {
        match self.next_value() {
            Value::Null => Ok(None),
            value => T::try_from_value(value).map(Some),
        }
    }

    pub fn required<T: TryFromValue>(&mut self, field: &'static str) -> Result<T> {
        self.optional()?.ok_or(DecodeError::MissingField {
            type_name: self.type_name,
            field,
        })
    }

    pub fn or<T: TryFromValue>(&mut self, default: T) -> Result<T> {
        Ok(self.optional()?.unwrap_or(default))
    }

    pub fn or_default<T: TryFromValue + Default>(&mut self) -> Result<T> {
        Ok(self.optional()?.unwrap_or_default())
    }
}

/// Conversion from a decoded [`Value`] into a field type.
pub trait TryFromValue: Sized {
    fn try_from_value(value: Value) -> Result<Self>;
}

impl TryFromValue for Value {
    fn try_from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

macro_rules! primitive_from_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl TryFromValue for $ty {
                fn try_from_value(value: Value) -> Result<Self> {
                    match value {
                        Value::$variant(v) => Ok(v),
                        other => Err(DecodeError::UnexpectedType {
                            expected: ValueKind::$variant.name(),
                            actual: other.kind(),
                        }),
                    }
                }
            }
        )*
    };
}

primitive_from_value! {
    bool => Boolean,
    u8 => Ubyte,
    u16 => Ushort,
    u32 => Uint,
    u64 => Ulong,
    i32 => Int,
    i64 => Long,
    String => String,
    Symbol => Symbol,
    Bytes => Binary,
    Fields => Map,
}

/// A symbol or array of symbols (the AMQP "multiple" convention).
impl TryFromValue for Vec<Symbol> {
    fn try_from_value(value: Value) -> Result<Self> {
        match value {
            Value::Symbol(symbol) => Ok(vec![symbol]),
            Value::Array(array) if array.kind() == ValueKind::Symbol => array
                .into_items()
                .into_iter()
                .map(Symbol::try_from_value)
                .collect(),
            other => Err(DecodeError::UnexpectedType {
                expected: "symbol array",
                actual: other.kind(),
            }),
        }
    }
}

impl From<Vec<Symbol>> for Value {
    fn from(symbols: Vec<Symbol>) -> Self {
        if symbols.is_empty() {
            Value::Null
        } else {
            Value::Array(Array::of_symbols(symbols))
        }
    }
}

impl From<Fields> for Value {
    fn from(fields: Fields) -> Self {
        Value::Map(fields)
    }
}

/// Encodes a boolean that defaults to `false` as null when unset.
pub fn flag(value: bool) -> Value {
    if value {
        Value::Boolean(true)
    } else {
        Value::Null
    }
}

/// Implements [`TryFromValue`] and `From<T> for Value` for described types.
macro_rules! described_value_conversions {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $crate::described::TryFromValue for $ty {
                fn try_from_value(value: $crate::value::Value) -> $crate::error::Result<Self> {
                    <$ty as $crate::described::DescribedType>::from_value(value)
                }
            }

            impl From<$ty> for $crate::value::Value {
                fn from(value: $ty) -> Self {
                    $crate::described::DescribedType::to_value(&value)
                }
            }

            impl From<&$ty> for $crate::value::Value {
                fn from(value: &$ty) -> Self {
                    $crate::described::DescribedType::to_value(value)
                }
            }
        )*
    };
}

pub(crate) use described_value_conversions;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Pair {
        name: String,
        count: u32,
        enabled: bool,
    }

    impl DescribedType for Pair {
        const NAME: &'static str = "pair";
        const DESCRIPTOR_CODE: u64 = 0x0000_9999_0000_0001;
        const DESCRIPTOR_SYMBOL: &'static str = "test:pair:list";
        const FIELD_COUNT: usize = 3;

        fn fields(&self) -> Vec<Value> {
            vec![
                Value::from(self.name.as_str()),
                Value::Uint(self.count),
                flag(self.enabled),
            ]
        }

        fn from_fields(reader: &mut FieldReader) -> Result<Self> {
            Ok(Self {
                name: reader.required("name")?,
                count: reader.or(0)?,
                enabled: reader.or_default()?,
            })
        }
    }

    #[test]
    fn test_trailing_nulls_are_trimmed() {
        let pair = Pair {
            name: "x".into(),
            count: 1,
            enabled: false,
        };
        let Value::Described(described) = pair.to_value() else {
            panic!("expected described value");
        };
        assert_eq!(described.value, Value::List(vec!["x".into(), Value::Uint(1)]));
    }

    #[test]
    fn test_short_list_defaults_missing_fields() {
        let value = Value::described(Value::symbol("test:pair:list"), Value::List(vec!["y".into()]));
        assert_eq!(
            Pair::from_value(value).unwrap(),
            Pair {
                name: "y".into(),
                count: 0,
                enabled: false
            }
        );
    }

    #[test]
    fn test_extra_fields_are_rejected() {
        let body = Value::List(vec![Value::Null; 4]);
        assert_eq!(
            Pair::from_body(body).unwrap_err(),
            DecodeError::TooManyFields {
                type_name: "pair",
                max: 3,
                actual: 4
            }
        );
    }

    #[test]
    fn test_missing_mandatory_field() {
        let err = Pair::from_body(Value::List(vec![])).unwrap_err();
        assert_eq!(
            err,
            DecodeError::MissingField {
                type_name: "pair",
                field: "name"
            }
        );
    }

    #[test]
    fn test_single_symbol_reads_as_multiple() {
        let symbols = Vec::<Symbol>::try_from_value(Value::symbol("a")).unwrap();
        assert_eq!(symbols, vec![Symbol::from("a")]);
    }
}
