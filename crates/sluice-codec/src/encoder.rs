//! Value encoding.
//!
//! Encoding measures before it writes: every compound picks the smallest
//! legal width for its size and count fields from the measured size of its
//! children, so the output is always the most compact legal form.

use bytes::{BufMut, BytesMut};

use crate::codes;
use crate::value::{Array, Value, ValueKind};

/// Encodes `value` (constructor and body) onto the end of `buf`.
pub fn encode(value: &Value, buf: &mut BytesMut) {
    let code = constructor_of(value);
    buf.reserve(1 + body_size(value, code));
    buf.put_u8(code);
    write_body(value, code, buf);
}

/// Encodes `value` into a freshly allocated buffer.
pub fn encode_to_vec(value: &Value) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(encoded_size(value));
    encode(value, &mut buf);
    buf.to_vec()
}

/// Number of bytes [`encode`] writes for `value`.
pub fn encoded_size(value: &Value) -> usize {
    1 + body_size(value, constructor_of(value))
}

/// Selects the narrowest constructor able to represent `value`.
pub fn constructor_of(value: &Value) -> u8 {
    match value {
        Value::Null => codes::NULL,
        Value::Boolean(true) => codes::BOOLEAN_TRUE,
        Value::Boolean(false) => codes::BOOLEAN_FALSE,
        Value::Ubyte(_) => codes::UBYTE,
        Value::Ushort(_) => codes::USHORT,
        Value::Uint(0) => codes::UINT0,
        Value::Uint(v) if *v <= u8::MAX as u32 => codes::SMALLUINT,
        Value::Uint(_) => codes::UINT,
        Value::Ulong(0) => codes::ULONG0,
        Value::Ulong(v) if *v <= u8::MAX as u64 => codes::SMALLULONG,
        Value::Ulong(_) => codes::ULONG,
        Value::Byte(_) => codes::BYTE,
        Value::Short(_) => codes::SHORT,
        Value::Int(v) if i8::try_from(*v).is_ok() => codes::SMALLINT,
        Value::Int(_) => codes::INT,
        Value::Long(v) if i8::try_from(*v).is_ok() => codes::SMALLLONG,
        Value::Long(_) => codes::LONG,
        Value::Float(_) => codes::FLOAT,
        Value::Double(_) => codes::DOUBLE,
        Value::Decimal32(_) => codes::DECIMAL32,
        Value::Decimal64(_) => codes::DECIMAL64,
        Value::Decimal128(_) => codes::DECIMAL128,
        Value::Char(_) => codes::CHAR,
        Value::Timestamp(_) => codes::TIMESTAMP,
        Value::Uuid(_) => codes::UUID,
        Value::Binary(b) => narrow(b.len(), codes::VBIN8, codes::VBIN32),
        Value::String(s) => narrow(s.len(), codes::STR8, codes::STR32),
        Value::Symbol(s) => narrow(s.len(), codes::SYM8, codes::SYM32),
        Value::List(items) if items.is_empty() => codes::LIST0,
        Value::List(items) => {
            let content: usize = items.iter().map(encoded_size).sum();
            compound(content, items.len(), codes::LIST8, codes::LIST32)
        }
        Value::Map(entries) => {
            let content = map_content_size(entries);
            compound(content, entries.len() * 2, codes::MAP8, codes::MAP32)
        }
        Value::Array(array) => {
            let content = array_constructor_size(array) + array_elements_size(array);
            compound(content, array.len(), codes::ARRAY8, codes::ARRAY32)
        }
        Value::Described(_) => codes::DESCRIBED,
    }
}

fn narrow(len: usize, small: u8, large: u8) -> u8 {
    if len <= u8::MAX as usize {
        small
    } else {
        large
    }
}

fn compound(content: usize, count: usize, small: u8, large: u8) -> u8 {
    // The one byte size field also covers the one byte count field.
    if content + 1 <= u8::MAX as usize && count <= u8::MAX as usize {
        small
    } else {
        large
    }
}

fn map_content_size(entries: &[(Value, Value)]) -> usize {
    entries
        .iter()
        .map(|(k, v)| encoded_size(k) + encoded_size(v))
        .sum()
}

/// Constructor used for every element of an array of `kind`.
///
/// Arrays share one constructor, so the compact zero and one byte variants
/// are never used for numeric kinds.
fn array_element_code(array: &Array) -> u8 {
    let longest = || {
        array
            .items()
            .iter()
            .map(|item| match item {
                Value::Binary(b) => b.len(),
                Value::String(s) => s.len(),
                Value::Symbol(s) => s.len(),
                _ => 0,
            })
            .max()
            .unwrap_or(0)
    };
    match array.kind() {
        ValueKind::Null => codes::NULL,
        ValueKind::Boolean => codes::BOOLEAN,
        ValueKind::Ubyte => codes::UBYTE,
        ValueKind::Ushort => codes::USHORT,
        ValueKind::Uint => codes::UINT,
        ValueKind::Ulong => codes::ULONG,
        ValueKind::Byte => codes::BYTE,
        ValueKind::Short => codes::SHORT,
        ValueKind::Int => codes::INT,
        ValueKind::Long => codes::LONG,
        ValueKind::Float => codes::FLOAT,
        ValueKind::Double => codes::DOUBLE,
        ValueKind::Decimal32 => codes::DECIMAL32,
        ValueKind::Decimal64 => codes::DECIMAL64,
        ValueKind::Decimal128 => codes::DECIMAL128,
        ValueKind::Char => codes::CHAR,
        ValueKind::Timestamp => codes::TIMESTAMP,
        ValueKind::Uuid => codes::UUID,
        ValueKind::Binary => narrow(longest(), codes::VBIN8, codes::VBIN32),
        ValueKind::String => narrow(longest(), codes::STR8, codes::STR32),
        ValueKind::Symbol => narrow(longest(), codes::SYM8, codes::SYM32),
        ValueKind::List => codes::LIST32,
        ValueKind::Map => codes::MAP32,
        ValueKind::Array => codes::ARRAY32,
        // Rejected by Array::new; described arrays carry the inner kind.
        ValueKind::Described => codes::NULL,
    }
}

fn array_constructor_size(array: &Array) -> usize {
    match array.descriptor() {
        Some(descriptor) => 1 + encoded_size(descriptor) + 1,
        None => 1,
    }
}

fn array_elements_size(array: &Array) -> usize {
    let code = array_element_code(array);
    array.items().iter().map(|item| body_size(item, code)).sum()
}

/// Size of the body that follows constructor `code` when encoding `value`.
pub(crate) fn body_size(value: &Value, code: u8) -> usize {
    match value {
        Value::Null => 0,
        Value::Boolean(_) => usize::from(code == codes::BOOLEAN),
        Value::Ubyte(_) | Value::Byte(_) => 1,
        Value::Ushort(_) | Value::Short(_) => 2,
        Value::Uint(_) | Value::Ulong(_) | Value::Int(_) | Value::Long(_) => match code {
            codes::UINT0 | codes::ULONG0 => 0,
            codes::SMALLUINT | codes::SMALLULONG | codes::SMALLINT | codes::SMALLLONG => 1,
            codes::UINT | codes::INT => 4,
            _ => 8,
        },
        Value::Float(_) | Value::Char(_) | Value::Decimal32(_) => 4,
        Value::Double(_) | Value::Timestamp(_) | Value::Decimal64(_) => 8,
        Value::Decimal128(_) | Value::Uuid(_) => 16,
        Value::Binary(b) => variable_prefix(code) + b.len(),
        Value::String(s) => variable_prefix(code) + s.len(),
        Value::Symbol(s) => variable_prefix(code) + s.len(),
        Value::List(items) => {
            let content: usize = items.iter().map(encoded_size).sum();
            match code {
                codes::LIST0 => 0,
                codes::LIST8 => 2 + content,
                _ => 8 + content,
            }
        }
        Value::Map(entries) => {
            let content = map_content_size(entries);
            if code == codes::MAP8 {
                2 + content
            } else {
                8 + content
            }
        }
        Value::Array(array) => {
            let content = array_constructor_size(array) + array_elements_size(array);
            if code == codes::ARRAY8 {
                2 + content
            } else {
                8 + content
            }
        }
        Value::Described(described) => {
            encoded_size(&described.descriptor) + encoded_size(&described.value)
        }
    }
}

fn variable_prefix(code: u8) -> usize {
    if code & 0xf0 == 0xa0 {
        1
    } else {
        4
    }
}

fn write_variable(bytes: &[u8], code: u8, buf: &mut BytesMut) {
    if variable_prefix(code) == 1 {
        buf.put_u8(bytes.len() as u8);
    } else {
        buf.put_u32(bytes.len() as u32);
    }
    buf.put_slice(bytes);
}

fn write_size_and_count(small: bool, size: usize, count: usize, buf: &mut BytesMut) {
    if small {
        buf.put_u8(size as u8);
        buf.put_u8(count as u8);
    } else {
        buf.put_u32(size as u32);
        buf.put_u32(count as u32);
    }
}

/// Writes the body of `value` for a previously selected constructor `code`.
pub(crate) fn write_body(value: &Value, code: u8, buf: &mut BytesMut) {
    match value {
        Value::Null => {}
        Value::Boolean(v) => {
            if code == codes::BOOLEAN {
                buf.put_u8(u8::from(*v));
            }
        }
        Value::Ubyte(v) => buf.put_u8(*v),
        Value::Byte(v) => buf.put_i8(*v),
        Value::Ushort(v) => buf.put_u16(*v),
        Value::Short(v) => buf.put_i16(*v),
        Value::Uint(v) => match code {
            codes::UINT0 => {}
            codes::SMALLUINT => buf.put_u8(*v as u8),
            _ => buf.put_u32(*v),
        },
        Value::Ulong(v) => match code {
            codes::ULONG0 => {}
            codes::SMALLULONG => buf.put_u8(*v as u8),
            _ => buf.put_u64(*v),
        },
        Value::Int(v) => match code {
            codes::SMALLINT => buf.put_i8(*v as i8),
            _ => buf.put_i32(*v),
        },
        Value::Long(v) => match code {
            codes::SMALLLONG => buf.put_i8(*v as i8),
            _ => buf.put_i64(*v),
        },
        Value::Float(v) => buf.put_f32(*v),
        Value::Double(v) => buf.put_f64(*v),
        Value::Decimal32(v) => buf.put_slice(v),
        Value::Decimal64(v) => buf.put_slice(v),
        Value::Decimal128(v) => buf.put_slice(v),
        Value::Char(v) => buf.put_u32(*v as u32),
        Value::Timestamp(v) => buf.put_i64(*v),
        Value::Uuid(v) => buf.put_slice(v),
        Value::Binary(b) => write_variable(b, code, buf),
        Value::String(s) => write_variable(s.as_bytes(), code, buf),
        Value::Symbol(s) => write_variable(s.as_str().as_bytes(), code, buf),
        Value::List(items) => {
            if code == codes::LIST0 {
                return;
            }
            let content: usize = items.iter().map(encoded_size).sum();
            let small = code == codes::LIST8;
            let size = content + if small { 1 } else { 4 };
            write_size_and_count(small, size, items.len(), buf);
            for item in items {
                encode(item, buf);
            }
        }
        Value::Map(entries) => {
            let content = map_content_size(entries);
            let small = code == codes::MAP8;
            let size = content + if small { 1 } else { 4 };
            write_size_and_count(small, size, entries.len() * 2, buf);
            for (key, value) in entries {
                encode(key, buf);
                encode(value, buf);
            }
        }
        Value::Array(array) => {
            let element_code = array_element_code(array);
            let content = array_constructor_size(array) + array_elements_size(array);
            let small = code == codes::ARRAY8;
            let size = content + if small { 1 } else { 4 };
            write_size_and_count(small, size, array.len(), buf);
            if let Some(descriptor) = array.descriptor() {
                buf.put_u8(codes::DESCRIBED);
                encode(descriptor, buf);
            }
            buf.put_u8(element_code);
            for item in array.items() {
                write_body(item, element_code, buf);
            }
        }
        Value::Described(described) => {
            encode(&described.descriptor, buf);
            encode(&described.value, buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_uint_picks_smallest_width() {
        assert_eq!(encode_to_vec(&Value::Uint(0)), vec![codes::UINT0]);
        assert_eq!(encode_to_vec(&Value::Uint(200)), vec![codes::SMALLUINT, 200]);
        assert_eq!(
            encode_to_vec(&Value::Uint(256)),
            vec![codes::UINT, 0, 0, 1, 0]
        );
    }

    #[test]
    fn test_binary_width_switches_at_256() {
        let small = Value::Binary(Bytes::from(vec![1u8; 255]));
        let large = Value::Binary(Bytes::from(vec![1u8; 256]));
        assert_eq!(encode_to_vec(&small)[0], codes::VBIN8);
        assert_eq!(encoded_size(&small), 2 + 255);
        assert_eq!(encode_to_vec(&large)[0], codes::VBIN32);
        assert_eq!(encoded_size(&large), 5 + 256);
    }

    #[test]
    fn test_list_widths() {
        assert_eq!(encode_to_vec(&Value::List(vec![])), vec![codes::LIST0]);

        let list = Value::List(vec![Value::Null, Value::Boolean(true)]);
        assert_eq!(
            encode_to_vec(&list),
            vec![codes::LIST8, 3, 2, codes::NULL, codes::BOOLEAN_TRUE]
        );

        let big = Value::List(vec![Value::Binary(Bytes::from(vec![0u8; 300]))]);
        let encoded = encode_to_vec(&big);
        assert_eq!(encoded[0], codes::LIST32);
        assert_eq!(encoded.len(), encoded_size(&big));
    }

    #[test]
    fn test_symbol_array_uses_shared_constructor() {
        let array = Value::Array(Array::of_symbols(["a", "bc"]));
        assert_eq!(
            encode_to_vec(&array),
            vec![codes::ARRAY8, 7, 2, codes::SYM8, 1, b'a', 2, b'b', b'c']
        );
    }

    #[test]
    fn test_described_ulong_descriptor() {
        let value = Value::described(Value::Ulong(0x24), Value::List(vec![]));
        assert_eq!(
            encode_to_vec(&value),
            vec![codes::DESCRIBED, codes::SMALLULONG, 0x24, codes::LIST0]
        );
    }
}
