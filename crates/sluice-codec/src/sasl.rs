//! SASL negotiation frames.

use bytes::{Bytes, BytesMut};

use crate::described::{
    described_value_conversions, descriptor_name, is_descriptor, DescribedType, FieldReader,
    TryFromValue,
};
use crate::error::{DecodeError, Result};
use crate::value::{Symbol, Value};

/// Outcome code of a SASL exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslCode {
    Ok,
    Auth,
    Sys,
    SysPerm,
    SysTemp,
}

impl SaslCode {
    fn as_u8(self) -> u8 {
        match self {
            SaslCode::Ok => 0,
            SaslCode::Auth => 1,
            SaslCode::Sys => 2,
            SaslCode::SysPerm => 3,
            SaslCode::SysTemp => 4,
        }
    }
}

impl TryFromValue for SaslCode {
    fn try_from_value(value: Value) -> Result<Self> {
        match u8::try_from_value(value)? {
            0 => Ok(SaslCode::Ok),
            1 => Ok(SaslCode::Auth),
            2 => Ok(SaslCode::Sys),
            3 => Ok(SaslCode::SysPerm),
            4 => Ok(SaslCode::SysTemp),
            other => Err(DecodeError::InvalidValue {
                what: "sasl-code",
                value: u64::from(other),
            }),
        }
    }
}

/// Mechanisms the server offers.
#[derive(Debug, Clone, PartialEq)]
pub struct SaslMechanisms {
    pub mechanisms: Vec<Symbol>,
}

impl DescribedType for SaslMechanisms {
    const NAME: &'static str = "sasl-mechanisms";
    const DESCRIPTOR_CODE: u64 = 0x40;
    const DESCRIPTOR_SYMBOL: &'static str = "amqp:sasl-mechanisms:list";
    const FIELD_COUNT: usize = 1;

    fn fields(&self) -> Vec<Value> {
        vec![self.mechanisms.clone().into()]
    }

    fn from_fields(reader: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            mechanisms: reader.required("sasl-server-mechanisms")?,
        })
    }
}

/// The client's chosen mechanism and initial response.
#[derive(Debug, Clone, PartialEq)]
pub struct SaslInit {
    pub mechanism: Symbol,
    pub initial_response: Option<Bytes>,
    pub hostname: Option<String>,
}

impl DescribedType for SaslInit {
    const NAME: &'static str = "sasl-init";
    const DESCRIPTOR_CODE: u64 = 0x41;
    const DESCRIPTOR_SYMBOL: &'static str = "amqp:sasl-init:list";
    const FIELD_COUNT: usize = 3;

    fn fields(&self) -> Vec<Value> {
        vec![
            Value::Symbol(self.mechanism.clone()),
            self.initial_response.clone().into(),
            self.hostname.clone().into(),
        ]
    }

    fn from_fields(reader: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            mechanism: reader.required("mechanism")?,
            initial_response: reader.optional()?,
            hostname: reader.optional()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaslChallenge {
    pub challenge: Bytes,
}

impl DescribedType for SaslChallenge {
    const NAME: &'static str = "sasl-challenge";
    const DESCRIPTOR_CODE: u64 = 0x42;
    const DESCRIPTOR_SYMBOL: &'static str = "amqp:sasl-challenge:list";
    const FIELD_COUNT: usize = 1;

    fn fields(&self) -> Vec<Value> {
        vec![Value::Binary(self.challenge.clone())]
    }

    fn from_fields(reader: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            challenge: reader.required("challenge")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaslResponse {
    pub response: Bytes,
}

impl DescribedType for SaslResponse {
    const NAME: &'static str = "sasl-response";
    const DESCRIPTOR_CODE: u64 = 0x43;
    const DESCRIPTOR_SYMBOL: &'static str = "amqp:sasl-response:list";
    const FIELD_COUNT: usize = 1;

    fn fields(&self) -> Vec<Value> {
        vec![Value::Binary(self.response.clone())]
    }

    fn from_fields(reader: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            response: reader.required("response")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaslOutcome {
    pub code: SaslCode,
    pub additional_data: Option<Bytes>,
}

impl DescribedType for SaslOutcome {
    const NAME: &'static str = "sasl-outcome";
    const DESCRIPTOR_CODE: u64 = 0x44;
    const DESCRIPTOR_SYMBOL: &'static str = "amqp:sasl-outcome:list";
    const FIELD_COUNT: usize = 2;

    fn fields(&self) -> Vec<Value> {
        vec![
            Value::Ubyte(self.code.as_u8()),
            self.additional_data.clone().into(),
        ]
    }

    fn from_fields(reader: &mut FieldReader) -> Result<Self> {
        Ok(Self {
            code: reader.required("code")?,
            additional_data: reader.optional()?,
        })
    }
}

described_value_conversions!(SaslMechanisms, SaslInit, SaslChallenge, SaslResponse, SaslOutcome);

/// Any SASL frame body.
#[derive(Debug, Clone, PartialEq)]
pub enum SaslPerformative {
    Mechanisms(SaslMechanisms),
    Init(SaslInit),
    Challenge(SaslChallenge),
    Response(SaslResponse),
    Outcome(SaslOutcome),
}

impl SaslPerformative {
    pub fn name(&self) -> &'static str {
        match self {
            SaslPerformative::Mechanisms(_) => SaslMechanisms::NAME,
            SaslPerformative::Init(_) => SaslInit::NAME,
            SaslPerformative::Challenge(_) => SaslChallenge::NAME,
            SaslPerformative::Response(_) => SaslResponse::NAME,
            SaslPerformative::Outcome(_) => SaslOutcome::NAME,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            SaslPerformative::Mechanisms(p) => p.to_value(),
            SaslPerformative::Init(p) => p.to_value(),
            SaslPerformative::Challenge(p) => p.to_value(),
            SaslPerformative::Response(p) => p.to_value(),
            SaslPerformative::Outcome(p) => p.to_value(),
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
                    expected: "sasl performative",
                    actual: other.kind(),
                })
            }
        };
        let d = &described.descriptor;
        if is_descriptor::<SaslMechanisms>(d) {
            SaslMechanisms::from_described(described).map(SaslPerformative::Mechanisms)
        } else if is_descriptor::<SaslInit>(d) {
            SaslInit::from_described(described).map(SaslPerformative::Init)
        } else if is_descriptor::<SaslChallenge>(d) {
            SaslChallenge::from_described(described).map(SaslPerformative::Challenge)
        } else if is_descriptor::<SaslResponse>(d) {
            SaslResponse::from_described(described).map(SaslPerformative::Response)
        } else if is_descriptor::<SaslOutcome>(d) {
            SaslOutcome::from_described(described).map(SaslPerformative::Outcome)
        } else {
            Err(DecodeError::UnknownDescriptor(descriptor_name(d)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode;
    use crate::encoder::encode_to_vec;

    #[test]
    fn test_mechanisms_round_trip() {
        let frame = SaslPerformative::Mechanisms(SaslMechanisms {
            mechanisms: vec![Symbol::from("PLAIN"), Symbol::from("ANONYMOUS")],
        });
        let (value, _) = decode(&encode_to_vec(&frame.to_value())).unwrap();
        assert_eq!(SaslPerformative::from_value(value).unwrap(), frame);
    }

    #[test]
    fn test_outcome_code_out_of_range() {
        let value = Value::described(
            Value::Ulong(SaslOutcome::DESCRIPTOR_CODE),
            Value::List(vec![Value::Ubyte(9)]),
        );
        assert_eq!(
            SaslPerformative::from_value(value).unwrap_err(),
            DecodeError::InvalidValue {
                what: "sasl-code",
                value: 9
            }
        );
    }
}
