//! Messaging layer types: error conditions, delivery states, terminus
//! definitions and message sections.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codes;
use crate::decoder::decode_all;
use crate::described::{
    described_value_conversions, descriptor_name, flag, is_descriptor, DescribedType, FieldReader,
    Fields, TryFromValue,
};
use crate::encoder::encode;
use crate::error::{DecodeError, Result};
use crate::value::{Symbol, Value};

/// Well known AMQP error condition symbols.
pub mod conditions {
    pub const INTERNAL_ERROR: &str = "amqp:internal-error";
    pub const NOT_FOUND: &str = "amqp:not-found";
    pub const UNAUTHORIZED_ACCESS: &str = "amqp:unauthorized-access";
    pub const DECODE_ERROR: &str = "amqp:decode-error";
    pub const RESOURCE_LIMIT_EXCEEDED: &str = "amqp:resource-limit-exceeded";
    pub const NOT_ALLOWED: &str = "amqp:not-allowed";
    pub const INVALID_FIELD: &str = "amqp:invalid-field";
    pub const NOT_IMPLEMENTED: &str = "amqp:not-implemented";
    pub const ILLEGAL_STATE: &str = "amqp:illegal-state";
    pub const FRAME_SIZE_TOO_SMALL: &str = "amqp:frame-size-too-small";
    pub const CONNECTION_FORCED: &str = "amqp:connection:forced";
    pub const FRAMING_ERROR: &str = "amqp:connection:framing-error";
    pub const UNATTACHED_HANDLE: &str = "amqp:session:unattached-handle";
    pub const HANDLE_IN_USE: &str = "amqp:session:handle-in-use";
    pub const WINDOW_VIOLATION: &str = "amqp:session:window-violation";
    pub const DETACH_FORCED: &str = "amqp:link:detach-forced";
    pub const TRANSFER_LIMIT_EXCEEDED: &str = "amqp:link:transfer-limit-exceeded";
    pub const MESSAGE_SIZE_EXCEEDED: &str = "amqp:link:message-size-exceeded";
}

/// Error information attached to a closing performative or a rejection.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorCondition {
    pub condition: Symbol,
    pub description: Option<String>,
    pub info: Option<Fields>,
}

impl ErrorCondition {
    pub fn new(condition: impl Into<Symbol>, description: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            description: Some(description.into()),
            info: None,
        }
    }
}

impl std::fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.condition)?;
        if let Some(description) = &self.description {
            write!(f, ": {}", description)?;
        }
        Ok(())
    }
}

impl DescribedType for ErrorCondition {
    const NAME: &'static str = "error";
    const DESCRIPTOR_CODE: u64 = 0x1d;
    const DESCRIPTOR_SYMBOL: &'static str = "amqp:error:list";
    const FIELD_COUNT: usize = 3;

    fn fields(&self) -> Vec<Value> {
        vec![
            Value::Symbol(self.condition.clone()),
            self.description.clone().into(),
            self.info.clone().into(),
        ]
    }

    fn from_fields(reader: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            condition: reader.required("condition")?,
            description: reader.optional()?,
            info: reader.optional()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    pub section_number: u32,
    pub section_offset: u64,
}

impl DescribedType for Received {
    const NAME: &'static str = "received";
    const DESCRIPTOR_CODE: u64 = 0x23;
    const DESCRIPTOR_SYMBOL: &'static str = "amqp:received:list";
    const FIELD_COUNT: usize = 2;

    fn fields(&self) -> Vec<Value> {
        vec![
            Value::Uint(self.section_number),
            Value::Ulong(self.section_offset),
        ]
    }

    fn from_fields(reader: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            section_number: reader.required("section-number")?,
            section_offset: reader.required("section-offset")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted;

impl DescribedType for Accepted {
    const NAME: &'static str = "accepted";
    const DESCRIPTOR_CODE: u64 = 0x24;
    const DESCRIPTOR_SYMBOL: &'static str = "amqp:accepted:list";
    const FIELD_COUNT: usize = 0;

    fn fields(&self) -> Vec<Value> {
        Vec::new()
    }

    fn from_fields(_: &mut FieldReader) -> Result<Self> {
        Ok(Accepted)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rejected {
    pub error: Option<ErrorCondition>,
}

impl DescribedType for Rejected {
    const NAME: &'static str = "rejected";
    const DESCRIPTOR_CODE: u64 = 0x25;
    const DESCRIPTOR_SYMBOL: &'static str = "amqp:rejected:list";
    const FIELD_COUNT: usize = 1;

    fn fields(&self) -> Vec<Value> {
        vec![self.error.as_ref().map(Value::from).unwrap_or(Value::Null)]
    }

    fn from_fields(reader: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            error: reader.optional()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released;

impl DescribedType for Released {
    const NAME: &'static str = "released";
    const DESCRIPTOR_CODE: u64 = 0x26;
    const DESCRIPTOR_SYMBOL: &'static str = "amqp:released:list";
    const FIELD_COUNT: usize = 0;

    fn fields(&self) -> Vec<Value> {
        Vec::new()
    }

    fn from_fields(_: &mut FieldReader) -> Result<Self> {
        Ok(Released)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Modified {
    pub delivery_failed: bool,
    pub undeliverable_here: bool,
    pub message_annotations: Option<Fields>,
}

impl DescribedType for Modified {
    const NAME: &'static str = "modified";
    const DESCRIPTOR_CODE: u64 = 0x27;
    const DESCRIPTOR_SYMBOL: &'static str = "amqp:modified:list";
    const FIELD_COUNT: usize = 3;

    fn fields(&self) -> Vec<Value> {
        vec![
            flag(self.delivery_failed),
            flag(self.undeliverable_here),
            self.message_annotations.clone().into(),
        ]
    }

    fn from_fields(reader: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            delivery_failed: reader.or_default()?,
            undeliverable_here: reader.or_default()?,
            message_annotations: reader.optional()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionalState {
    pub txn_id: Bytes,
    pub outcome: Option<Box<DeliveryState>>,
}

impl DescribedType for TransactionalState {
    const NAME: &'static str = "transactional-state";
    const DESCRIPTOR_CODE: u64 = 0x34;
    const DESCRIPTOR_SYMBOL: &'static str = "amqp:transactional-state:list";
    const FIELD_COUNT: usize = 2;

    fn fields(&self) -> Vec<Value> {
        vec![
            Value::Binary(self.txn_id.clone()),
            self.outcome
                .as_deref()
                .map(DeliveryState::to_value)
                .unwrap_or(Value::Null),
        ]
    }

    fn from_fields(reader: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            txn_id: reader.required("txn-id")?,
            outcome: reader.optional::<DeliveryState>()?.map(Box::new),
        })
    }
}

described_value_conversions!(ErrorCondition, Received, Rejected, Modified, TransactionalState);

/// The state of a delivery as seen by one side of a link.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryState {
    Received(Received),
    Accepted,
    Rejected(Rejected),
    Released,
    Modified(Modified),
    Transactional(TransactionalState),
}

impl DeliveryState {
    /// Whether this state is a terminal outcome rather than progress.
    pub fn is_outcome(&self) -> bool {
        !matches!(self, DeliveryState::Received(_) | DeliveryState::Transactional(_))
    }

    pub fn to_value(&self) -> Value {
        match self {
            DeliveryState::Received(state) => state.to_value(),
            DeliveryState::Accepted => Accepted.to_value(),
            DeliveryState::Rejected(state) => state.to_value(),
            DeliveryState::Released => Released.to_value(),
            DeliveryState::Modified(state) => state.to_value(),
            DeliveryState::Transactional(state) => state.to_value(),
        }
    }
}

impl TryFromValue for DeliveryState {
    fn try_from_value(value: Value) -> Result<Self> {
        let described = match value {
            Value::Described(described) => *described,
            other => {
                return Err(DecodeError::UnexpectedType {
                    expected: "delivery-state",
                    actual: other.kind(),
                })
            }
        };
        let d = &described.descriptor;
        if is_descriptor::<Accepted>(d) {
            Ok(DeliveryState::Accepted)
        } else if is_descriptor::<Released>(d) {
            Ok(DeliveryState::Released)
        } else if is_descriptor::<Rejected>(d) {
            Rejected::from_described(described).map(DeliveryState::Rejected)
        } else if is_descriptor::<Modified>(d) {
            Modified::from_described(described).map(DeliveryState::Modified)
        } else if is_descriptor::<Received>(d) {
            Received::from_described(described).map(DeliveryState::Received)
        } else if is_descriptor::<TransactionalState>(d) {
            TransactionalState::from_described(described).map(DeliveryState::Transactional)
        } else {
            Err(DecodeError::UnknownDescriptor(descriptor_name(d)))
        }
    }
}

impl From<&DeliveryState> for Value {
    fn from(state: &DeliveryState) -> Self {
        state.to_value()
    }
}

/// Source terminus of a link.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Source {
    pub address: Option<String>,
    pub durable: u32,
    pub expiry_policy: Option<Symbol>,
    pub timeout: u32,
    pub dynamic: bool,
    pub dynamic_node_properties: Option<Fields>,
    pub distribution_mode: Option<Symbol>,
    pub filter: Option<Fields>,
    pub default_outcome: Option<DeliveryState>,
    pub outcomes: Vec<Symbol>,
    pub capabilities: Vec<Symbol>,
}

impl Source {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Default::default()
        }
    }
}

impl DescribedType for Source {
    const NAME: &'static str = "source";
    const DESCRIPTOR_CODE: u64 = 0x28;
    const DESCRIPTOR_SYMBOL: &'static str = "amqp:source:list";
    const FIELD_COUNT: usize = 11;

    fn fields(&self) -> Vec<Value> {
        vec![
            self.address.clone().into(),
            zero_as_null(self.durable),
            self.expiry_policy.clone().into(),
            zero_as_null(self.timeout),
            flag(self.dynamic),
            self.dynamic_node_properties.clone().into(),
            self.distribution_mode.clone().into(),
            self.filter.clone().into(),
            self.default_outcome
                .as_ref()
                .map(DeliveryState::to_value)
                .unwrap_or(Value::Null),
            self.outcomes.clone().into(),
            self.capabilities.clone().into(),
        ]
    }

    fn from_fields(reader: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            address: reader.optional()?,
            durable: reader.or_default()?,
            expiry_policy: reader.optional()?,
            timeout: reader.or_default()?,
            dynamic: reader.or_default()?,
            dynamic_node_properties: reader.optional()?,
            distribution_mode: reader.optional()?,
            filter: reader.optional()?,
            default_outcome: reader.optional()?,
            outcomes: reader.or_default()?,
            capabilities: reader.or_default()?,
        })
    }
}

/// Target terminus of a link.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Target {
    pub address: Option<String>,
    pub durable: u32,
    pub expiry_policy: Option<Symbol>,
    pub timeout: u32,
    pub dynamic: bool,
    pub dynamic_node_properties: Option<Fields>,
    pub capabilities: Vec<Symbol>,
}

impl Target {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Default::default()
        }
    }
}

impl DescribedType for Target {
    const NAME: &'static str = "target";
    const DESCRIPTOR_CODE: u64 = 0x29;
    const DESCRIPTOR_SYMBOL: &'static str = "amqp:target:list";
    const FIELD_COUNT: usize = 7;

    fn fields(&self) -> Vec<Value> {
        vec![
            self.address.clone().into(),
            zero_as_null(self.durable),
            self.expiry_policy.clone().into(),
            zero_as_null(self.timeout),
            flag(self.dynamic),
            self.dynamic_node_properties.clone().into(),
            self.capabilities.clone().into(),
        ]
    }

    fn from_fields(reader: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            address: reader.optional()?,
            durable: reader.or_default()?,
            expiry_policy: reader.optional()?,
            timeout: reader.or_default()?,
            dynamic: reader.or_default()?,
            dynamic_node_properties: reader.optional()?,
            capabilities: reader.or_default()?,
        })
    }
}

fn zero_as_null(value: u32) -> Value {
    if value == 0 {
        Value::Null
    } else {
        Value::Uint(value)
    }
}

/// Transport headers of a message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Header {
    pub durable: bool,
    pub priority: Option<u8>,
    /// Milliseconds.
    pub ttl: Option<u32>,
    pub first_acquirer: bool,
    pub delivery_count: u32,
}

impl DescribedType for Header {
    const NAME: &'static str = "header";
    const DESCRIPTOR_CODE: u64 = 0x70;
    const DESCRIPTOR_SYMBOL: &'static str = "amqp:header:list";
    const FIELD_COUNT: usize = 5;

    fn fields(&self) -> Vec<Value> {
        vec![
            flag(self.durable),
            self.priority.into(),
            self.ttl.into(),
            flag(self.first_acquirer),
            zero_as_null(self.delivery_count),
        ]
    }

    fn from_fields(reader: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            durable: reader.or_default()?,
            priority: reader.optional()?,
            ttl: reader.optional()?,
            first_acquirer: reader.or_default()?,
            delivery_count: reader.or_default()?,
        })
    }
}

/// Immutable properties of a message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Properties {
    pub message_id: Option<Value>,
    pub user_id: Option<Bytes>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<Value>,
    pub content_type: Option<Symbol>,
    pub content_encoding: Option<Symbol>,
    /// Milliseconds since the unix epoch.
    pub absolute_expiry_time: Option<i64>,
    pub creation_time: Option<i64>,
    pub group_id: Option<String>,
    pub group_sequence: Option<u32>,
    pub reply_to_group_id: Option<String>,
}

fn timestamp(value: Option<i64>) -> Value {
    value.map(Value::Timestamp).unwrap_or(Value::Null)
}

fn read_timestamp(reader: &mut FieldReader) -> Result<Option<i64>> {
    match reader.next_value() {
        Value::Null => Ok(None),
        Value::Timestamp(ms) => Ok(Some(ms)),
        other => Err(DecodeError::UnexpectedType {
            expected: "timestamp",
            actual: other.kind(),
        }),
    }
}

impl DescribedType for Properties {
    const NAME: &'static str = "properties";
    const DESCRIPTOR_CODE: u64 = 0x73;
    const DESCRIPTOR_SYMBOL: &'static str = "amqp:properties:list";
    const FIELD_COUNT: usize = 13;

    fn fields(&self) -> Vec<Value> {
        vec![
            self.message_id.clone().into(),
            self.user_id.clone().into(),
            self.to.clone().into(),
            self.subject.clone().into(),
            self.reply_to.clone().into(),
            self.correlation_id.clone().into(),
            self.content_type.clone().into(),
            self.content_encoding.clone().into(),
            timestamp(self.absolute_expiry_time),
            timestamp(self.creation_time),
            self.group_id.clone().into(),
            self.group_sequence.into(),
            self.reply_to_group_id.clone().into(),
        ]
    }

    fn from_fields(reader: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            message_id: reader.optional()?,
            user_id: reader.optional()?,
            to: reader.optional()?,
            subject: reader.optional()?,
            reply_to: reader.optional()?,
            correlation_id: reader.optional()?,
            content_type: reader.optional()?,
            content_encoding: reader.optional()?,
            absolute_expiry_time: read_timestamp(reader)?,
            creation_time: read_timestamp(reader)?,
            group_id: reader.optional()?,
            group_sequence: reader.optional()?,
            reply_to_group_id: reader.optional()?,
        })
    }
}

described_value_conversions!(Source, Target, Header, Properties);

const HEADER: u64 = 0x70;
const DELIVERY_ANNOTATIONS: u64 = 0x71;
const MESSAGE_ANNOTATIONS: u64 = 0x72;
const PROPERTIES: u64 = 0x73;
const APPLICATION_PROPERTIES: u64 = 0x74;
const DATA: u64 = 0x75;
const AMQP_SEQUENCE: u64 = 0x76;
const AMQP_VALUE: u64 = 0x77;
const FOOTER: u64 = 0x78;

/// One section of a bare or annotated message.
#[derive(Debug, Clone, PartialEq)]
pub enum Section {
    Header(Header),
    DeliveryAnnotations(Fields),
    MessageAnnotations(Fields),
    Properties(Properties),
    ApplicationProperties(Fields),
    Data(Bytes),
    AmqpSequence(Vec<Value>),
    AmqpValue(Value),
    Footer(Fields),
}

impl Section {
    pub fn to_value(&self) -> Value {
        let wrap = |code: u64, value: Value| Value::described(Value::Ulong(code), value);
        match self {
            Section::Header(header) => header.to_value(),
            Section::DeliveryAnnotations(map) => wrap(DELIVERY_ANNOTATIONS, Value::Map(map.clone())),
            Section::MessageAnnotations(map) => wrap(MESSAGE_ANNOTATIONS, Value::Map(map.clone())),
            Section::Properties(properties) => properties.to_value(),
            Section::ApplicationProperties(map) => {
                wrap(APPLICATION_PROPERTIES, Value::Map(map.clone()))
            }
            Section::Data(bytes) => wrap(DATA, Value::Binary(bytes.clone())),
            Section::AmqpSequence(items) => wrap(AMQP_SEQUENCE, Value::List(items.clone())),
            Section::AmqpValue(value) => wrap(AMQP_VALUE, value.clone()),
            Section::Footer(map) => wrap(FOOTER, Value::Map(map.clone())),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        encode(&self.to_value(), buf);
    }

    pub fn encoded(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let described = match value {
            Value::Described(described) => *described,
            other => {
                return Err(DecodeError::UnexpectedType {
                    expected: "message section",
                    actual: other.kind(),
                })
            }
        };
        let code = match &described.descriptor {
            Value::Ulong(code) => *code,
            Value::Symbol(symbol) => section_code(symbol.as_str())
                .ok_or_else(|| DecodeError::UnknownDescriptor(symbol.to_string()))?,
            other => return Err(DecodeError::UnknownDescriptor(other.kind().to_string())),
        };
        let body = described.value;
        match code {
            HEADER => Header::from_body(body).map(Section::Header),
            PROPERTIES => Properties::from_body(body).map(Section::Properties),
            DELIVERY_ANNOTATIONS => Fields::try_from_value(body).map(Section::DeliveryAnnotations),
            MESSAGE_ANNOTATIONS => Fields::try_from_value(body).map(Section::MessageAnnotations),
            APPLICATION_PROPERTIES => {
                Fields::try_from_value(body).map(Section::ApplicationProperties)
            }
            DATA => Bytes::try_from_value(body).map(Section::Data),
            AMQP_SEQUENCE => match body {
                Value::List(items) => Ok(Section::AmqpSequence(items)),
                other => Err(DecodeError::UnexpectedType {
                    expected: "list",
                    actual: other.kind(),
                }),
            },
            AMQP_VALUE => Ok(Section::AmqpValue(body)),
            FOOTER => Fields::try_from_value(body).map(Section::Footer),
            other => Err(DecodeError::UnknownDescriptor(format!("0x{other:08x}"))),
        }
    }
}

fn section_code(symbol: &str) -> Option<u64> {
    let code = match symbol {
        "amqp:header:list" => HEADER,
        "amqp:delivery-annotations:map" => DELIVERY_ANNOTATIONS,
        "amqp:message-annotations:map" => MESSAGE_ANNOTATIONS,
        "amqp:properties:list" => PROPERTIES,
        "amqp:application-properties:map" => APPLICATION_PROPERTIES,
        "amqp:data:binary" => DATA,
        "amqp:amqp-sequence:list" => AMQP_SEQUENCE,
        "amqp:amqp-value:*" => AMQP_VALUE,
        "amqp:footer:map" => FOOTER,
        _ => return None,
    };
    Some(code)
}

/// Decodes the sections of a complete message payload.
pub fn decode_sections(payload: &[u8]) -> Result<Vec<Section>> {
    decode_all(payload)?
        .into_iter()
        .map(Section::from_value)
        .collect()
}

/// Size of the prefix written by [`write_data_section_header`].
pub const DATA_SECTION_HEADER_SIZE: usize = 8;

/// Writes the prefix of a Data section whose `len` body bytes follow as
/// raw bytes, always using the 32-bit binary encoding.
pub fn write_data_section_header(len: u32, buf: &mut BytesMut) {
    buf.put_u8(codes::DESCRIBED);
    buf.put_u8(codes::SMALLULONG);
    buf.put_u8(DATA as u8);
    buf.put_u8(codes::VBIN32);
    buf.put_u32(len);
}
