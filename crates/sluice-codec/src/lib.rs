//! AMQP 1.0 type system codec for the Sluice protocol engine.
//!
//! This crate provides:
//! - The AMQP value model and smallest-width encoding
//! - Full-buffer and resumable streaming decoders
//! - Described composite types: transport performatives, SASL frames,
//!   delivery states, terminus definitions and message sections

pub mod codes;
pub mod constructor;
pub mod decoder;
pub mod described;
pub mod encoder;
pub mod error;
pub mod messaging;
pub mod sasl;
pub mod stream;
pub mod transport;
pub mod value;

pub use constructor::TypeConstructor;
pub use decoder::{decode, decode_all};
pub use described::{DescribedType, FieldReader, Fields, TryFromValue};
pub use encoder::{encode, encode_to_vec, encoded_size};
pub use error::{DecodeError, Result};
pub use messaging::{
    conditions, decode_sections, DeliveryState, ErrorCondition, Header, Modified, Properties,
    Received, Rejected, Section, Source, Target, TransactionalState,
};
pub use sasl::{
    SaslChallenge, SaslCode, SaslInit, SaslMechanisms, SaslOutcome, SaslPerformative, SaslResponse,
};
pub use stream::StreamDecoder;
pub use transport::{
    Attach, Begin, Close, Detach, Disposition, End, Flow, Open, Performative, ReceiverSettleMode,
    Role, SenderSettleMode, Transfer,
};
pub use value::{Array, Described, Symbol, Value, ValueKind};
