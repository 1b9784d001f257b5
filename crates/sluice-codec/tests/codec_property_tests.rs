//! Property-based tests for the type codec
//!
//! These tests verify that encoding round-trips through both decoders and
//! that a buffer boundary falling anywhere inside a value never produces a
//! spurious result.

use bytes::Bytes;
use proptest::prelude::*;
use sluice_codec::{decode, encode_to_vec, encoded_size, Array, StreamDecoder, Value, ValueKind};

/// Generate arbitrary scalar and variable width values
fn arb_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Boolean),
        any::<u8>().prop_map(Value::Ubyte),
        any::<u16>().prop_map(Value::Ushort),
        any::<u32>().prop_map(Value::Uint),
        any::<u64>().prop_map(Value::Ulong),
        any::<i8>().prop_map(Value::Byte),
        any::<i16>().prop_map(Value::Short),
        any::<i32>().prop_map(Value::Int),
        any::<i64>().prop_map(Value::Long),
        // NaN never compares equal to itself
        any::<f32>().prop_filter("NaN", |v| !v.is_nan()).prop_map(Value::Float),
        any::<f64>().prop_filter("NaN", |v| !v.is_nan()).prop_map(Value::Double),
        any::<[u8; 4]>().prop_map(Value::Decimal32),
        any::<[u8; 8]>().prop_map(Value::Decimal64),
        any::<[u8; 16]>().prop_map(Value::Decimal128),
        any::<char>().prop_map(Value::Char),
        any::<i64>().prop_map(Value::Timestamp),
        any::<[u8; 16]>().prop_map(Value::Uuid),
        prop::collection::vec(any::<u8>(), 0..300).prop_map(|b| Value::Binary(Bytes::from(b))),
        "\\PC{0,80}".prop_map(Value::String),
        "[a-z:.-]{0,300}".prop_map(|s| Value::symbol(&s)),
    ]
}

/// Generate arbitrary descriptors
fn arb_descriptor() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<u64>().prop_map(Value::Ulong),
        "amqp:[a-z]{1,12}:list".prop_map(|s| Value::symbol(&s)),
    ]
}

/// Generate arbitrary values including nested compounds
fn arb_value() -> impl Strategy<Value = Value> {
    arb_leaf().prop_recursive(3, 64, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..8).prop_map(Value::List),
            prop::collection::vec((inner.clone(), inner.clone()), 0..4).prop_map(Value::Map),
            (arb_descriptor(), inner).prop_map(|(d, v)| Value::described(d, v)),
            prop::collection::vec(any::<u32>(), 0..80).prop_map(|items| {
                let items = items.into_iter().map(Value::Uint).collect();
                Value::Array(Array::new(ValueKind::Uint, items).unwrap())
            }),
            prop::collection::vec("[a-z]{0,300}", 0..4)
                .prop_map(|symbols| Value::Array(Array::of_symbols(symbols))),
        ]
    })
}

fn stream_decode(bytes: &[u8], chunk: usize) -> Option<Value> {
    let mut decoder = StreamDecoder::new();
    let mut result = None;
    for piece in bytes.chunks(chunk) {
        let mut src = piece;
        assert!(result.is_none(), "value produced before the input ended");
        result = decoder.decode(&mut src).unwrap();
        assert!(src.is_empty());
    }
    result
}

proptest! {
    /// Property: decode(encode(v)) == v and consumes exactly the encoding
    #[test]
    fn full_decode_round_trips(value in arb_value()) {
        let bytes = encode_to_vec(&value);
        prop_assert_eq!(bytes.len(), encoded_size(&value));

        let (decoded, consumed) = decode(&bytes).unwrap();
        prop_assert_eq!(consumed, bytes.len());
        prop_assert_eq!(decoded, value);
    }

    /// Property: feeding any chunking to the streaming decoder matches a full decode
    #[test]
    fn streaming_decode_matches_full_decode(value in arb_value(), chunk in 1usize..17) {
        let bytes = encode_to_vec(&value);
        prop_assert_eq!(stream_decode(&bytes, chunk), Some(value));
    }

    /// Property: a truncated buffer is an error for the full decoder and
    /// incomplete for the streaming decoder, and resuming completes it
    #[test]
    fn truncation_never_yields_a_value(value in arb_value(), cut in any::<prop::sample::Index>()) {
        let bytes = encode_to_vec(&value);
        let split = cut.index(bytes.len());

        prop_assert!(decode(&bytes[..split]).is_err());

        let mut decoder = StreamDecoder::new();
        let mut head = &bytes[..split];
        prop_assert_eq!(decoder.decode(&mut head).unwrap(), None);

        let mut tail = &bytes[split..];
        prop_assert_eq!(decoder.decode(&mut tail).unwrap(), Some(value));
    }
}
