//! Transport performatives.

use bytes::{Bytes, BytesMut};

use crate::described::{
    described_value_conversions, descriptor_name, flag, is_descriptor, DescribedType, FieldReader,
    Fields, TryFromValue,
};
use crate::error::{DecodeError, Result};
use crate::messaging::{DeliveryState, ErrorCondition, Source, Target};
use crate::value::{Symbol, Value};

/// Which end of a link an endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub fn is_sender(&self) -> bool {
        matches!(self, Role::Sender)
    }
}

impl From<Role> for Value {
    fn from(role: Role) -> Self {
        Value::Boolean(role == Role::Receiver)
    }
}

impl TryFromValue for Role {
    fn try_from_value(value: Value) -> Result<Self> {
        Ok(if bool::try_from_value(value)? {
            Role::Receiver
        } else {
            Role::Sender
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SenderSettleMode {
    Unsettled,
    Settled,
    #[default]
    Mixed,
}

impl From<SenderSettleMode> for Value {
    fn from(mode: SenderSettleMode) -> Self {
        Value::Ubyte(match mode {
            SenderSettleMode::Unsettled => 0,
            SenderSettleMode::Settled => 1,
            SenderSettleMode::Mixed => 2,
        })
    }
}

impl TryFromValue for SenderSettleMode {
    fn try_from_value(value: Value) -> Result<Self> {
        match u8::try_from_value(value)? {
            0 => Ok(SenderSettleMode::Unsettled),
            1 => Ok(SenderSettleMode::Settled),
            2 => Ok(SenderSettleMode::Mixed),
            other => Err(DecodeError::InvalidValue {
                what: "sender-settle-mode",
                value: u64::from(other),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReceiverSettleMode {
    #[default]
    First,
    Second,
}

impl From<ReceiverSettleMode> for Value {
    fn from(mode: ReceiverSettleMode) -> Self {
        Value::Ubyte(match mode {
            ReceiverSettleMode::First => 0,
            ReceiverSettleMode::Second => 1,
        })
    }
}

impl TryFromValue for ReceiverSettleMode {
    fn try_from_value(value: Value) -> Result<Self> {
        match u8::try_from_value(value)? {
            0 => Ok(ReceiverSettleMode::First),
            1 => Ok(ReceiverSettleMode::Second),
            other => Err(DecodeError::InvalidValue {
                what: "receiver-settle-mode",
                value: u64::from(other),
            }),
        }
    }
}

fn state_value(state: &Option<DeliveryState>) -> Value {
    state
        .as_ref()
        .map(DeliveryState::to_value)
        .unwrap_or(Value::Null)
}

fn error_value(error: &Option<ErrorCondition>) -> Value {
    error.as_ref().map(Value::from).unwrap_or(Value::Null)
}

/// Opens a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Open {
    pub container_id: String,
    pub hostname: Option<String>,
    pub max_frame_size: u32,
    pub channel_max: u16,
    /// Milliseconds.
    pub idle_timeout: Option<u32>,
    pub outgoing_locales: Vec<Symbol>,
    pub incoming_locales: Vec<Symbol>,
    pub offered_capabilities: Vec<Symbol>,
    pub desired_capabilities: Vec<Symbol>,
    pub properties: Option<Fields>,
}

impl Open {
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            hostname: None,
            max_frame_size: u32::MAX,
            channel_max: u16::MAX,
            idle_timeout: None,
            outgoing_locales: Vec::new(),
            incoming_locales: Vec::new(),
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            properties: None,
        }
    }
}

impl DescribedType for Open {
    const NAME: &'static str = "open";
    const DESCRIPTOR_CODE: u64 = 0x10;
    const DESCRIPTOR_SYMBOL: &'static str = "amqp:open:list";
    const FIELD_COUNT: usize = 10;

    fn fields(&self) -> Vec<Value> {
        vec![
            Value::from(self.container_id.as_str()),
            self.hostname.clone().into(),
            Value::Uint(self.max_frame_size),
            Value::Ushort(self.channel_max),
            self.idle_timeout.into(),
            self.outgoing_locales.clone().into(),
            self.incoming_locales.clone().into(),
            self.offered_capabilities.clone().into(),
            self.desired_capabilities.clone().into(),
            self.properties.clone().into(),
        ]
    }

    fn from_fields(reader: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            container_id: reader.required("container-id")?,
            hostname: reader.optional()?,
            max_frame_size: reader.or(u32::MAX)?,
            channel_max: reader.or(u16::MAX)?,
            idle_timeout: reader.optional()?,
            outgoing_locales: reader.or_default()?,
            incoming_locales: reader.or_default()?,
            offered_capabilities: reader.or_default()?,
            desired_capabilities: reader.or_default()?,
            properties: reader.optional()?,
        })
    }
}

/// Begins a session on a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Begin {
    pub remote_channel: Option<u16>,
    pub next_outgoing_id: u32,
    pub incoming_window: u32,
    pub outgoing_window: u32,
    pub handle_max: u32,
    pub offered_capabilities: Vec<Symbol>,
    pub desired_capabilities: Vec<Symbol>,
    pub properties: Option<Fields>,
}

impl DescribedType for Begin {
    const NAME: &'static str = "begin";
    const DESCRIPTOR_CODE: u64 = 0x11;
    const DESCRIPTOR_SYMBOL: &'static str = "amqp:begin:list";
    const FIELD_COUNT: usize = 8;

    fn fields(&self) -> Vec<Value> {
        vec![
            self.remote_channel.into(),
            Value::Uint(self.next_outgoing_id),
            Value::Uint(self.incoming_window),
            Value::Uint(self.outgoing_window),
            Value::Uint(self.handle_max),
            self.offered_capabilities.clone().into(),
            self.desired_capabilities.clone().into(),
            self.properties.clone().into(),
        ]
    }

    fn from_fields(reader: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            remote_channel: reader.optional()?,
            next_outgoing_id: reader.required("next-outgoing-id")?,
            incoming_window: reader.required("incoming-window")?,
            outgoing_window: reader.required("outgoing-window")?,
            handle_max: reader.or(u32::MAX)?,
            offered_capabilities: reader.or_default()?,
            desired_capabilities: reader.or_default()?,
            properties: reader.optional()?,
        })
    }
}

/// Attaches a link to a session.
#[derive(Debug, Clone, PartialEq)]
pub struct Attach {
    pub name: String,
    pub handle: u32,
    pub role: Role,
    pub snd_settle_mode: SenderSettleMode,
    pub rcv_settle_mode: ReceiverSettleMode,
    pub source: Option<Source>,
    pub target: Option<Target>,
    pub unsettled: Option<Fields>,
    pub incomplete_unsettled: bool,
    pub initial_delivery_count: Option<u32>,
    pub max_message_size: Option<u64>,
    pub offered_capabilities: Vec<Symbol>,
    pub desired_capabilities: Vec<Symbol>,
    pub properties: Option<Fields>,
}

impl DescribedType for Attach {
    const NAME: &'static str = "attach";
    const DESCRIPTOR_CODE: u64 = 0x12;
    const DESCRIPTOR_SYMBOL: &'static str = "amqp:attach:list";
    const FIELD_COUNT: usize = 14;

    fn fields(&self) -> Vec<Value> {
        vec![
            Value::from(self.name.as_str()),
            Value::Uint(self.handle),
            self.role.into(),
            self.snd_settle_mode.into(),
            self.rcv_settle_mode.into(),
            self.source.as_ref().map(Value::from).unwrap_or(Value::Null),
            self.target.as_ref().map(Value::from).unwrap_or(Value::Null),
            self.unsettled.clone().into(),
            flag(self.incomplete_unsettled),
            self.initial_delivery_count.into(),
            self.max_message_size.into(),
            self.offered_capabilities.clone().into(),
            self.desired_capabilities.clone().into(),
            self.properties.clone().into(),
        ]
    }

    fn from_fields(reader: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            name: reader.required("name")?,
            handle: reader.required("handle")?,
            role: reader.required("role")?,
            snd_settle_mode: reader.or_default()?,
            rcv_settle_mode: reader.or_default()?,
            source: reader.optional()?,
            target: reader.optional()?,
            unsettled: reader.optional()?,
            incomplete_unsettled: reader.or_default()?,
            initial_delivery_count: reader.optional()?,
            max_message_size: reader.optional()?,
            offered_capabilities: reader.or_default()?,
            desired_capabilities: reader.or_default()?,
            properties: reader.optional()?,
        })
    }
}

/// Updates session and (optionally) link flow state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Flow {
    pub next_incoming_id: Option<u32>,
    pub incoming_window: u32,
    pub next_outgoing_id: u32,
    pub outgoing_window: u32,
    pub handle: Option<u32>,
    pub delivery_count: Option<u32>,
    pub link_credit: Option<u32>,
    pub available: Option<u32>,
    pub drain: bool,
    pub echo: bool,
    pub properties: Option<Fields>,
}

impl DescribedType for Flow {
    const NAME: &'static str = "flow";
    const DESCRIPTOR_CODE: u64 = 0x13;
    const DESCRIPTOR_SYMBOL: &'static str = "amqp:flow:list";
    const FIELD_COUNT: usize = 11;

    fn fields(&self) -> Vec<Value> {
        vec![
            self.next_incoming_id.into(),
            Value::Uint(self.incoming_window),
            Value::Uint(self.next_outgoing_id),
            Value::Uint(self.outgoing_window),
            self.handle.into(),
            self.delivery_count.into(),
            self.link_credit.into(),
            self.available.into(),
            flag(self.drain),
            flag(self.echo),
            self.properties.clone().into(),
        ]
    }

    fn from_fields(reader: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            next_incoming_id: reader.optional()?,
            incoming_window: reader.required("incoming-window")?,
            next_outgoing_id: reader.required("next-outgoing-id")?,
            outgoing_window: reader.required("outgoing-window")?,
            handle: reader.optional()?,
            delivery_count: reader.optional()?,
            link_credit: reader.optional()?,
            available: reader.optional()?,
            drain: reader.or_default()?,
            echo: reader.or_default()?,
            properties: reader.optional()?,
        })
    }
}

/// Carries one frame's worth of a delivery.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transfer {
    pub handle: u32,
    pub delivery_id: Option<u32>,
    pub delivery_tag: Option<Bytes>,
    pub message_format: Option<u32>,
    pub settled: Option<bool>,
    pub more: bool,
    pub rcv_settle_mode: Option<ReceiverSettleMode>,
    pub state: Option<DeliveryState>,
    pub resume: bool,
    pub aborted: bool,
    pub batchable: bool,
}

impl DescribedType for Transfer {
    const NAME: &'static str = "transfer";
    const DESCRIPTOR_CODE: u64 = 0x14;
    const DESCRIPTOR_SYMBOL: &'static str = "amqp:transfer:list";
    const FIELD_COUNT: usize = 11;

    fn fields(&self) -> Vec<Value> {
        vec![
            Value::Uint(self.handle),
            self.delivery_id.into(),
            self.delivery_tag.clone().into(),
            self.message_format.into(),
            self.settled.into(),
            flag(self.more),
            self.rcv_settle_mode.into(),
            state_value(&self.state),
            flag(self.resume),
            flag(self.aborted),
            flag(self.batchable),
        ]
    }

    fn from_fields(reader: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            handle: reader.required("handle")?,
            delivery_id: reader.optional()?,
            delivery_tag: reader.optional()?,
            message_format: reader.optional()?,
            settled: reader.optional()?,
            more: reader.or_default()?,
            rcv_settle_mode: reader.optional()?,
            state: reader.optional()?,
            resume: reader.or_default()?,
            aborted: reader.or_default()?,
            batchable: reader.or_default()?,
        })
    }
}

/// Updates the state of a range of deliveries.
#[derive(Debug, Clone, PartialEq)]
pub struct Disposition {
    pub role: Role,
    pub first: u32,
    pub last: Option<u32>,
    pub settled: bool,
    pub state: Option<DeliveryState>,
    pub batchable: bool,
}

impl DescribedType for Disposition {
    const NAME: &'static str = "disposition";
    const DESCRIPTOR_CODE: u64 = 0x15;
    const DESCRIPTOR_SYMBOL: &'static str = "amqp:disposition:list";
    const FIELD_COUNT: usize = 6;

    fn fields(&self) -> Vec<Value> {
        vec![
            self.role.into(),
            Value::Uint(self.first),
            self.last.into(),
            flag(self.settled),
            state_value(&self.state),
            flag(self.batchable),
        ]
    }

    fn from_fields(reader: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            role: reader.required("role")?,
            first: reader.required("first")?,
            last: reader.optional()?,
            settled: reader.or_default()?,
            state: reader.optional()?,
            batchable: reader.or_default()?,
        })
    }
}

/// Detaches a link.
#[derive(Debug, Clone, PartialEq)]
pub struct Detach {
    pub handle: u32,
    pub closed: bool,
    pub error: Option<ErrorCondition>,
}

impl DescribedType for Detach {
    const NAME: &'static str = "detach";
    const DESCRIPTOR_CODE: u64 = 0x16;
    const DESCRIPTOR_SYMBOL: &'static str = "amqp:detach:list";
    const FIELD_COUNT: usize = 3;

    fn fields(&self) -> Vec<Value> {
        vec![
            Value::Uint(self.handle),
            flag(self.closed),
            error_value(&self.error),
        ]
    }

    fn from_fields(reader: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            handle: reader.required("handle")?,
            closed: reader.or_default()?,
            error: reader.optional()?,
        })
    }
}

/// Ends a session.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct End {
    pub error: Option<ErrorCondition>,
}

impl DescribedType for End {
    const NAME: &'static str = "end";
    const DESCRIPTOR_CODE: u64 = 0x17;
    const DESCRIPTOR_SYMBOL: &'static str = "amqp:end:list";
    const FIELD_COUNT: usize = 1;

    fn fields(&self) -> Vec<Value> {
        vec![error_value(&self.error)]
    }

    fn from_fields(reader: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            error: reader.optional()?,
        })
    }
}

/// Closes the connection.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Close {
    pub error: Option<ErrorCondition>,
}

impl DescribedType for Close {
    const NAME: &'static str = "close";
    const DESCRIPTOR_CODE: u64 = 0x18;
    const DESCRIPTOR_SYMBOL: &'static str = "amqp:close:list";
    const FIELD_COUNT: usize = 1;

    fn fields(&self) -> Vec<Value> {
        vec![error_value(&self.error)]
    }

    fn from_fields(reader: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            error: reader.optional()?,
        })
    }
}

described_value_conversions!(Open, Begin, Attach, Flow, Transfer, Disposition, Detach, End, Close);

/// Any transport performative.
#[derive(Debug, Clone, PartialEq)]
pub enum Performative {
    Open(Open),
    Begin(Begin),
    Attach(Attach),
    Flow(Flow),
    Transfer(Transfer),
    Disposition(Disposition),
    Detach(Detach),
    End(End),
    Close(Close),
}

impl Performative {
    pub fn name(&self) -> &'static str {
        match self {
            Performative::Open(_) => Open::NAME,
            Performative::Begin(_) => Begin::NAME,
            Performative::Attach(_) => Attach::NAME,
            Performative::Flow(_) => Flow::NAME,
            Performative::Transfer(_) => Transfer::NAME,
            Performative::Disposition(_) => Disposition::NAME,
            Performative::Detach(_) => Detach::NAME,
            Performative::End(_) => End::NAME,
            Performative::Close(_) => Close::NAME,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Performative::Open(p) => p.to_value(),
            Performative::Begin(p) => p.to_value(),
            Performative::Attach(p) => p.to_value(),
            Performative::Flow(p) => p.to_value(),
            Performative::Transfer(p) => p.to_value(),
            Performative::Disposition(p) => p.to_value(),
            Performative::Detach(p) => p.to_value(),
            Performative::End(p) => p.to_value(),
            Performative::Close(p) => p.to_value(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        crate::encoder::encode(&self.to_value(), buf);
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let described = match value {
            Value::Described(described) => *described,
            other => {
                return Err(DecodeError::UnexpectedType {
                    expected: "performative",
                    actual: other.kind(),
                })
            }
        };
        let d = &described.descriptor;
        if is_descriptor::<Transfer>(d) {
            Transfer::from_described(described).map(Performative::Transfer)
        } else if is_descriptor::<Flow>(d) {
            Flow::from_described(described).map(Performative::Flow)
        } else if is_descriptor::<Disposition>(d) {
            Disposition::from_described(described).map(Performative::Disposition)
        } else if is_descriptor::<Attach>(d) {
            Attach::from_described(described).map(Performative::Attach)
        } else if is_descriptor::<Detach>(d) {
            Detach::from_described(described).map(Performative::Detach)
        } else if is_descriptor::<Begin>(d) {
            Begin::from_described(described).map(Performative::Begin)
        } else if is_descriptor::<End>(d) {
            End::from_described(described).map(Performative::End)
        } else if is_descriptor::<Open>(d) {
            Open::from_described(described).map(Performative::Open)
        } else if is_descriptor::<Close>(d) {
            Close::from_described(described).map(Performative::Close)
        } else {
            Err(DecodeError::UnknownDescriptor(descriptor_name(d)))
        }
    }
}

impl TryFromValue for Performative {
    fn try_from_value(value: Value) -> Result<Self> {
        Performative::from_value(value)
    }
}

macro_rules! performative_from {
    ($($variant:ident),*) => {
        $(
            impl From<$variant> for Performative {
                fn from(p: $variant) -> Self {
                    Performative::$variant(p)
                }
            }
        )*
    };
}

performative_from!(Open, Begin, Attach, Flow, Transfer, Disposition, Detach, End, Close);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode;
    use crate::encoder::encode_to_vec;

    fn round_trip(performative: Performative) -> Performative {
        let bytes = encode_to_vec(&performative.to_value());
        let (value, consumed) = decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        Performative::from_value(value).unwrap()
    }

    #[test]
    fn test_open_defaults_survive_round_trip() {
        let open = Performative::Open(Open::new("container"));
        assert_eq!(round_trip(open.clone()), open);
    }

    #[test]
    fn test_attach_round_trip() {
        let attach = Performative::Attach(Attach {
            name: "sender-1".into(),
            handle: 0,
            role: Role::Sender,
            snd_settle_mode: SenderSettleMode::Mixed,
            rcv_settle_mode: ReceiverSettleMode::First,
            source: Some(Source::new("src")),
            target: Some(Target::new("queue")),
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count: Some(0),
            max_message_size: None,
            offered_capabilities: vec![],
            desired_capabilities: vec![Symbol::from("cap")],
            properties: None,
        });
        assert_eq!(round_trip(attach.clone()), attach);
    }

    #[test]
    fn test_transfer_omits_trailing_defaults() {
        let transfer = Transfer {
            handle: 0,
            delivery_id: Some(0),
            delivery_tag: Some(Bytes::from_static(&[0])),
            message_format: Some(0),
            settled: Some(false),
            ..Default::default()
        };
        let Value::Described(described) = transfer.to_value() else {
            panic!("expected described value");
        };
        let Value::List(fields) = &described.value else {
            panic!("expected list");
        };
        assert_eq!(fields.len(), 5);
    }

    #[test]
    fn test_too_many_fields_for_end() {
        let value = Value::described(
            Value::Ulong(End::DESCRIPTOR_CODE),
            Value::List(vec![Value::Null, Value::Null]),
        );
        assert_eq!(
            Performative::from_value(value).unwrap_err(),
            DecodeError::TooManyFields {
                type_name: "end",
                max: 1,
                actual: 2
            }
        );
    }

    #[test]
    fn test_flow_requires_windows() {
        let value = Value::described(Value::Ulong(Flow::DESCRIPTOR_CODE), Value::List(vec![]));
        assert!(matches!(
            Performative::from_value(value),
            Err(DecodeError::MissingField { type_name: "flow", .. })
        ));
    }
}
