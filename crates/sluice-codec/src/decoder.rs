//! Full-buffer decoding.
//!
//! Every declared length, size and count is checked against the bytes that
//! remain before anything is allocated for it.

use bytes::Bytes;

use crate::codes;
use crate::constructor::{read_width, Layout, TypeConstructor};
use crate::error::{DecodeError, Result};
use crate::value::{Array, Value};

/// Decodes one value from the front of `buf`.
///
/// Returns the value and the number of bytes it occupied.
pub fn decode(buf: &[u8]) -> Result<(Value, usize)> {
    let mut src = buf;
    let value = read_value(&mut src)?;
    Ok((value, buf.len() - src.len()))
}

/// Decodes every value in `buf`, which must end on a value boundary.
pub fn decode_all(buf: &[u8]) -> Result<Vec<Value>> {
    let mut src = buf;
    let mut values = Vec::new();
    while !src.is_empty() {
        values.push(read_value(&mut src)?);
    }
    Ok(values)
}

fn take<'a>(src: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if src.len() < n {
        return Err(DecodeError::Truncated {
            needed: n,
            remaining: src.len(),
        });
    }
    let (head, tail) = src.split_at(n);
    *src = tail;
    Ok(head)
}

fn take_width(src: &mut &[u8], width: usize) -> Result<usize> {
    take(src, width).map(|bytes| read_width(bytes, width))
}

/// Reads a size field and splits off the region it covers.
fn take_sized<'a>(src: &mut &'a [u8], width: usize, what: &'static str) -> Result<&'a [u8]> {
    let declared = take_width(src, width)?;
    if declared > src.len() {
        return Err(DecodeError::SizeExceedsRemaining {
            what,
            declared,
            remaining: src.len(),
        });
    }
    take(src, declared)
}

fn read_value(src: &mut &[u8]) -> Result<Value> {
    let code = take(src, 1)?[0];
    read_body(TypeConstructor::from_code(code)?, src)
}

fn read_body(ctor: TypeConstructor, src: &mut &[u8]) -> Result<Value> {
    match ctor.layout() {
        Layout::Empty => Ok(ctor.empty_value()),
        Layout::Fixed(n) => ctor.fixed_value(take(src, n)?),
        Layout::Variable { width } => {
            let payload = take_sized(src, width, "length")?;
            ctor.variable_value(Bytes::copy_from_slice(payload))
        }
        Layout::Compound { width, map } => {
            let mut body = take_sized(src, width, "size")?;
            let declared = body.len();
            let count = take_width(&mut body, width)?;
            if count > body.len() {
                return Err(DecodeError::SizeExceedsRemaining {
                    what: "count",
                    declared: count,
                    remaining: body.len(),
                });
            }
            if map && count % 2 != 0 {
                return Err(DecodeError::OddMapCount(count));
            }
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(read_value(&mut body)?);
            }
            expect_consumed(declared, body)?;
            if map {
                Ok(Value::Map(pair_up(items)))
            } else {
                Ok(Value::List(items))
            }
        }
        Layout::Array { width } => {
            let mut body = take_sized(src, width, "size")?;
            let declared = body.len();
            let count = take_width(&mut body, width)?;
            let mut code = take(&mut body, 1)?[0];
            let mut descriptor = None;
            if code == codes::DESCRIBED {
                descriptor = Some(read_value(&mut body)?);
                code = take(&mut body, 1)?[0];
            }
            let element = TypeConstructor::from_code(code)?;
            // Zero width elements still count against the declared size.
            if count > body.len() {
                return Err(DecodeError::SizeExceedsRemaining {
                    what: "count",
                    declared: count,
                    remaining: body.len(),
                });
            }
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(read_body(element, &mut body)?);
            }
            expect_consumed(declared, body)?;
            Ok(Value::Array(Array::from_parts(element.kind(), descriptor, items)))
        }
        Layout::Described => {
            let descriptor = read_value(src)?;
            let value = read_value(src)?;
            Ok(Value::described(descriptor, value))
        }
    }
}

fn expect_consumed(declared: usize, rest: &[u8]) -> Result<()> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(DecodeError::SizeMismatch {
            declared,
            actual: declared - rest.len(),
        })
    }
}

pub(crate) fn pair_up(items: Vec<Value>) -> Vec<(Value, Value)> {
    let mut entries = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        entries.push((key, value));
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::encode_to_vec;
    use crate::value::{Symbol, ValueKind};

    #[test]
    fn test_decode_reports_consumed_bytes() {
        let mut bytes = encode_to_vec(&Value::Uint(1000));
        bytes.extend_from_slice(&[0xde, 0xad]);
        let (value, consumed) = decode(&bytes).unwrap();
        assert_eq!(value, Value::Uint(1000));
        assert_eq!(consumed, 5);
    }

    #[test]
    fn test_unknown_constructor() {
        assert_eq!(
            decode(&[0x01]).unwrap_err(),
            DecodeError::UnknownConstructor(0x01)
        );
    }

    #[test]
    fn test_declared_length_beyond_buffer() {
        let err = decode(&[codes::STR8, 10, b'a', b'b']).unwrap_err();
        assert_eq!(
            err,
            DecodeError::SizeExceedsRemaining {
                what: "length",
                declared: 10,
                remaining: 2
            }
        );
    }

    #[test]
    fn test_truncated_fixed_width() {
        let err = decode(&[codes::UINT, 0, 0]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                needed: 4,
                remaining: 2
            }
        );
    }

    #[test]
    fn test_map_with_odd_count_is_rejected() {
        let bytes = [codes::MAP8, 4, 3, codes::NULL, codes::NULL, codes::NULL];
        assert_eq!(decode(&bytes).unwrap_err(), DecodeError::OddMapCount(3));
    }

    #[test]
    fn test_map_size_must_match_content() {
        // Declares 5 bytes of body; the count and two entries only use 3.
        let bytes = [
            codes::MAP8,
            5,
            2,
            codes::NULL,
            codes::NULL,
            codes::NULL,
            codes::NULL,
        ];
        assert_eq!(
            decode(&bytes).unwrap_err(),
            DecodeError::SizeMismatch {
                declared: 5,
                actual: 3
            }
        );
    }

    #[test]
    fn test_map_decodes_pairs() {
        let map = Value::Map(vec![
            (Value::symbol("k"), Value::Int(-1)),
            (Value::String("s".into()), Value::Null),
        ]);
        let (decoded, _) = decode(&encode_to_vec(&map)).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn test_described_array_round_trip() {
        let array = Array::described(
            Value::Ulong(0x24),
            ValueKind::List,
            vec![Value::List(vec![]), Value::List(vec![Value::Uint(3)])],
        )
        .unwrap();
        let value = Value::Array(array);
        let (decoded, consumed) = decode(&encode_to_vec(&value)).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, encode_to_vec(&value).len());
    }

    #[test]
    fn test_compact_array_count_must_fit_size() {
        let bytes = [codes::ARRAY8, 2, 3, codes::BOOLEAN_TRUE];
        assert_eq!(
            decode(&bytes).unwrap_err(),
            DecodeError::SizeExceedsRemaining {
                what: "count",
                declared: 3,
                remaining: 0
            }
        );
    }

    #[test]
    fn test_huge_count_of_empty_elements_is_rejected() {
        let bytes = [
            codes::ARRAY32,
            0,
            0,
            0,
            5,
            0x01,
            0x31,
            0x2d,
            0x00,
            codes::NULL,
        ];
        assert_eq!(
            decode(&bytes).unwrap_err(),
            DecodeError::SizeExceedsRemaining {
                what: "count",
                declared: 0x0131_2d00,
                remaining: 0
            }
        );

        let bytes = [codes::ARRAY32, 0, 0, 0, 5, 0xff, 0xff, 0xff, 0xff, codes::UINT0];
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::SizeExceedsRemaining { what: "count", .. })
        ));
    }

    #[test]
    fn test_decode_all_symbols() {
        let mut bytes = encode_to_vec(&Value::Symbol(Symbol::from("a")));
        bytes.extend(encode_to_vec(&Value::Symbol(Symbol::from("b"))));
        assert_eq!(
            decode_all(&bytes).unwrap(),
            vec![Value::symbol("a"), Value::symbol("b")]
        );
    }
}
