//! Type constructor selection.
//!
//! Decoding is two-phase: the constructor byte selects a [`TypeConstructor`]
//! which knows how the value body is laid out, then the body is consumed
//! either from a complete buffer ([`crate::decoder`]) or incrementally
//! ([`crate::stream`]). Both decoders share the leaf conversions here.

use bytes::Bytes;

use crate::codes;
use crate::error::{DecodeError, Result};
use crate::value::{Symbol, Value, ValueKind};

/// Layout of the body that follows a constructor byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Layout {
    /// The constructor alone determines the value.
    Empty,
    /// A fixed number of body bytes.
    Fixed(usize),
    /// A `width` byte length followed by that many bytes.
    Variable { width: usize },
    /// A `width` byte size, a `width` byte count, then `count` encoded values.
    Compound { width: usize, map: bool },
    /// A `width` byte size and count, one element constructor, then bodies.
    Array { width: usize },
    /// A descriptor value followed by the described value.
    Described,
}

/// A decoding strategy selected by a one byte constructor code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeConstructor {
    code: u8,
    layout: Layout,
}

impl TypeConstructor {
    /// Looks up the strategy for `code`.
    pub fn from_code(code: u8) -> Result<Self> {
        let layout = match code {
            codes::DESCRIBED => Layout::Described,
            codes::NULL
            | codes::BOOLEAN_TRUE
            | codes::BOOLEAN_FALSE
            | codes::UINT0
            | codes::ULONG0
            | codes::LIST0 => Layout::Empty,
            codes::UBYTE
            | codes::BYTE
            | codes::SMALLUINT
            | codes::SMALLULONG
            | codes::SMALLINT
            | codes::SMALLLONG
            | codes::BOOLEAN => Layout::Fixed(1),
            codes::USHORT | codes::SHORT => Layout::Fixed(2),
            codes::UINT | codes::INT | codes::FLOAT | codes::CHAR | codes::DECIMAL32 => {
                Layout::Fixed(4)
            }
            codes::ULONG | codes::LONG | codes::DOUBLE | codes::TIMESTAMP | codes::DECIMAL64 => {
                Layout::Fixed(8)
            }
            codes::DECIMAL128 | codes::UUID => Layout::Fixed(16),
            codes::VBIN8 | codes::STR8 | codes::SYM8 => Layout::Variable { width: 1 },
            codes::VBIN32 | codes::STR32 | codes::SYM32 => Layout::Variable { width: 4 },
            codes::LIST8 => Layout::Compound { width: 1, map: false },
            codes::LIST32 => Layout::Compound { width: 4, map: false },
            codes::MAP8 => Layout::Compound { width: 1, map: true },
            codes::MAP32 => Layout::Compound { width: 4, map: true },
            codes::ARRAY8 => Layout::Array { width: 1 },
            codes::ARRAY32 => Layout::Array { width: 4 },
            other => return Err(DecodeError::UnknownConstructor(other)),
        };
        Ok(Self { code, layout })
    }

    pub fn code(&self) -> u8 {
        self.code
    }

    pub(crate) fn layout(&self) -> Layout {
        self.layout
    }

    /// Kind of value this constructor produces.
    pub fn kind(&self) -> ValueKind {
        match self.code {
            codes::DESCRIBED => ValueKind::Described,
            codes::NULL => ValueKind::Null,
            codes::BOOLEAN_TRUE | codes::BOOLEAN_FALSE | codes::BOOLEAN => ValueKind::Boolean,
            codes::UBYTE => ValueKind::Ubyte,
            codes::USHORT => ValueKind::Ushort,
            codes::UINT0 | codes::SMALLUINT | codes::UINT => ValueKind::Uint,
            codes::ULONG0 | codes::SMALLULONG | codes::ULONG => ValueKind::Ulong,
            codes::BYTE => ValueKind::Byte,
            codes::SHORT => ValueKind::Short,
            codes::SMALLINT | codes::INT => ValueKind::Int,
            codes::SMALLLONG | codes::LONG => ValueKind::Long,
            codes::FLOAT => ValueKind::Float,
            codes::DOUBLE => ValueKind::Double,
            codes::DECIMAL32 => ValueKind::Decimal32,
            codes::DECIMAL64 => ValueKind::Decimal64,
            codes::DECIMAL128 => ValueKind::Decimal128,
            codes::CHAR => ValueKind::Char,
            codes::TIMESTAMP => ValueKind::Timestamp,
            codes::UUID => ValueKind::Uuid,
            codes::VBIN8 | codes::VBIN32 => ValueKind::Binary,
            codes::STR8 | codes::STR32 => ValueKind::String,
            codes::SYM8 | codes::SYM32 => ValueKind::Symbol,
            codes::LIST0 | codes::LIST8 | codes::LIST32 => ValueKind::List,
            codes::MAP8 | codes::MAP32 => ValueKind::Map,
            _ => ValueKind::Array,
        }
    }

    /// Value of a constructor with an empty body.
    pub(crate) fn empty_value(&self) -> Value {
        match self.code {
            codes::BOOLEAN_TRUE => Value::Boolean(true),
            codes::BOOLEAN_FALSE => Value::Boolean(false),
            codes::UINT0 => Value::Uint(0),
            codes::ULONG0 => Value::Ulong(0),
            codes::LIST0 => Value::List(Vec::new()),
            _ => Value::Null,
        }
    }

    /// Converts the body bytes of a fixed width constructor.
    pub(crate) fn fixed_value(&self, b: &[u8]) -> Result<Value> {
        let value = match self.code {
            codes::UBYTE => Value::Ubyte(b[0]),
            codes::BYTE => Value::Byte(b[0] as i8),
            codes::SMALLUINT => Value::Uint(u32::from(b[0])),
            codes::SMALLULONG => Value::Ulong(u64::from(b[0])),
            codes::SMALLINT => Value::Int(i32::from(b[0] as i8)),
            codes::SMALLLONG => Value::Long(i64::from(b[0] as i8)),
            codes::BOOLEAN => Value::Boolean(b[0] != 0),
            codes::USHORT => Value::Ushort(u16::from_be_bytes([b[0], b[1]])),
            codes::SHORT => Value::Short(i16::from_be_bytes([b[0], b[1]])),
            codes::UINT => Value::Uint(u32::from_be_bytes(array(b))),
            codes::INT => Value::Int(i32::from_be_bytes(array(b))),
            codes::FLOAT => Value::Float(f32::from_be_bytes(array(b))),
            codes::CHAR => {
                let point = u32::from_be_bytes(array(b));
                Value::Char(char::from_u32(point).ok_or(DecodeError::InvalidChar(point))?)
            }
            codes::DECIMAL32 => Value::Decimal32(array(b)),
            codes::ULONG => Value::Ulong(u64::from_be_bytes(array(b))),
            codes::LONG => Value::Long(i64::from_be_bytes(array(b))),
            codes::DOUBLE => Value::Double(f64::from_be_bytes(array(b))),
            codes::TIMESTAMP => Value::Timestamp(i64::from_be_bytes(array(b))),
            codes::DECIMAL64 => Value::Decimal64(array(b)),
            codes::DECIMAL128 => Value::Decimal128(array(b)),
            codes::UUID => Value::Uuid(array(b)),
            other => return Err(DecodeError::UnknownConstructor(other)),
        };
        Ok(value)
    }

    /// Converts the payload of a variable width constructor.
    pub(crate) fn variable_value(&self, payload: Bytes) -> Result<Value> {
        match self.code {
            codes::VBIN8 | codes::VBIN32 => Ok(Value::Binary(payload)),
            codes::STR8 | codes::STR32 => String::from_utf8(payload.to_vec())
                .map(Value::String)
                .map_err(|_| DecodeError::InvalidUtf8),
            codes::SYM8 | codes::SYM32 => String::from_utf8(payload.to_vec())
                .map(|s| Value::Symbol(Symbol::new(s)))
                .map_err(|_| DecodeError::InvalidUtf8),
            other => Err(DecodeError::UnknownConstructor(other)),
        }
    }
}

fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// Reads a big-endian size or count field of `width` (1 or 4) bytes.
pub(crate) fn read_width(bytes: &[u8], width: usize) -> usize {
    if width == 1 {
        bytes[0] as usize
    } else {
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_constructor_is_rejected() {
        assert_eq!(
            TypeConstructor::from_code(0xff).unwrap_err(),
            DecodeError::UnknownConstructor(0xff)
        );
    }

    #[test]
    fn test_compact_constructors_share_kind() {
        for code in [codes::UINT0, codes::SMALLUINT, codes::UINT] {
            assert_eq!(TypeConstructor::from_code(code).unwrap().kind(), ValueKind::Uint);
        }
    }
}
