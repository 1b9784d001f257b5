//! Codec error types.

use crate::value::ValueKind;

/// Errors raised while decoding AMQP encoded bytes.
///
/// Every variant describes malformed or unexpected input; a connection that
/// receives any of them is considered failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Unknown type constructor: 0x{0:02x}")]
    UnknownConstructor(u8),

    #[error("Truncated encoding: needed {needed} bytes but only {remaining} remain")]
    Truncated { needed: usize, remaining: usize },

    #[error("Declared {what} of {declared} exceeds the {remaining} bytes remaining")]
    SizeExceedsRemaining {
        what: &'static str,
        declared: usize,
        remaining: usize,
    },

    #[error("Encoded size mismatch: declared {declared} bytes, consumed {actual}")]
    SizeMismatch { declared: usize, actual: usize },

    #[error("Map encoding has an odd element count: {0}")]
    OddMapCount(usize),

    #[error("Too many entries in {type_name} encoding: {actual} (max {max})")]
    TooManyFields {
        type_name: &'static str,
        max: usize,
        actual: usize,
    },

    #[error("Expected {expected} but decoded {actual}")]
    UnexpectedType { expected: &'static str, actual: ValueKind },

    #[error("Mandatory field {field} of {type_name} is not set")]
    MissingField {
        type_name: &'static str,
        field: &'static str,
    },

    #[error("Unknown descriptor: {0}")]
    UnknownDescriptor(String),

    #[error("Invalid {what} value: {value}")]
    InvalidValue { what: &'static str, value: u64 },

    #[error("Invalid UTF-8 in string encoding")]
    InvalidUtf8,

    #[error("Invalid char code point: 0x{0:08x}")]
    InvalidChar(u32),

    #[error("Array elements must all be {expected}, found {actual}")]
    MixedArray { expected: ValueKind, actual: ValueKind },
}

/// Result alias used throughout the codec.
pub type Result<T> = std::result::Result<T, DecodeError>;
