//! Client side SASL negotiation.
//!
//! [`SaslClientHandler`] sits in the handler chain. It replaces the AMQP
//! protocol header with the SASL header, holds every frame the engine writes
//! until the exchange succeeds, then sends the AMQP header followed by the
//! held frames.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use sluice_codec::{SaslCode, SaslInit, SaslPerformative, SaslResponse, Symbol};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::frame::{Frame, ProtocolHeader};
use crate::pipeline::{FrameHandler, HandlerContext};

/// What a mechanism may draw on when building responses.
#[derive(Clone, Default)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    /// Identity established by the transport, e.g. a client certificate.
    pub local_principal: Option<String>,
    pub vhost: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("local_principal", &self.local_principal)
            .field("vhost", &self.vhost)
            .finish()
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            ..Self::default()
        }
    }
}

/// A SASL mechanism as seen by the client.
pub trait Mechanism: Send {
    fn name(&self) -> &'static str;

    fn is_applicable(&self, credentials: &Credentials) -> bool;

    fn initial_response(&mut self, credentials: &Credentials) -> Result<Option<Bytes>>;

    fn challenge_response(&mut self, credentials: &Credentials, challenge: &Bytes)
        -> Result<Bytes>;
}

#[derive(Debug, Default)]
pub struct AnonymousMechanism;

impl Mechanism for AnonymousMechanism {
    fn name(&self) -> &'static str {
        "ANONYMOUS"
    }

    fn is_applicable(&self, _credentials: &Credentials) -> bool {
        true
    }

    fn initial_response(&mut self, _credentials: &Credentials) -> Result<Option<Bytes>> {
        Ok(Some(Bytes::new()))
    }

    fn challenge_response(&mut self, _: &Credentials, _: &Bytes) -> Result<Bytes> {
        Ok(Bytes::new())
    }
}

#[derive(Debug, Default)]
pub struct PlainMechanism;

impl Mechanism for PlainMechanism {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn is_applicable(&self, credentials: &Credentials) -> bool {
        let present = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.is_empty());
        present(&credentials.username) && present(&credentials.password)
    }

    /// `\0username\0password`
    fn initial_response(&mut self, credentials: &Credentials) -> Result<Option<Bytes>> {
        let username = credentials.username.as_deref().unwrap_or_default();
        let password = credentials.password.as_deref().unwrap_or_default();
        let mut buf = BytesMut::with_capacity(2 + username.len() + password.len());
        buf.put_u8(0);
        buf.put_slice(username.as_bytes());
        buf.put_u8(0);
        buf.put_slice(password.as_bytes());
        Ok(Some(buf.freeze()))
    }

    fn challenge_response(&mut self, _: &Credentials, _: &Bytes) -> Result<Bytes> {
        Ok(Bytes::new())
    }
}

#[derive(Debug, Default)]
pub struct ExternalMechanism;

impl Mechanism for ExternalMechanism {
    fn name(&self) -> &'static str {
        "EXTERNAL"
    }

    fn is_applicable(&self, credentials: &Credentials) -> bool {
        credentials.local_principal.is_some()
    }

    fn initial_response(&mut self, _credentials: &Credentials) -> Result<Option<Bytes>> {
        Ok(Some(Bytes::new()))
    }

    fn challenge_response(&mut self, _: &Credentials, _: &Bytes) -> Result<Bytes> {
        Ok(Bytes::new())
    }
}

/// The built in mechanisms, most preferred first.
pub fn default_mechanisms() -> Vec<Box<dyn Mechanism>> {
    vec![
        Box::new(ExternalMechanism),
        Box::new(PlainMechanism),
        Box::new(AnonymousMechanism),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaslState {
    Idle,
    HeaderSent,
    Negotiating,
    Succeeded,
}

/// Runs the client half of the SASL exchange inside the handler chain.
pub struct SaslClientHandler {
    credentials: Credentials,
    hostname: Option<String>,
    mechanisms: Vec<Box<dyn Mechanism>>,
    chosen: Option<usize>,
    state: SaslState,
    amqp_header_requested: bool,
    held: Vec<Frame>,
}

impl SaslClientHandler {
    pub fn new(credentials: Credentials) -> Self {
        Self::with_mechanisms(credentials, default_mechanisms())
    }

    /// Use `mechanisms` in preference order.
    pub fn with_mechanisms(credentials: Credentials, mechanisms: Vec<Box<dyn Mechanism>>) -> Self {
        Self {
            hostname: credentials.vhost.clone(),
            credentials,
            mechanisms,
            chosen: None,
            state: SaslState::Idle,
            amqp_header_requested: false,
            held: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == SaslState::Succeeded
    }

    /// Name of the mechanism chosen from the server's offer.
    pub fn chosen_mechanism(&self) -> Option<&'static str> {
        self.chosen.map(|index| self.mechanisms[index].name())
    }

    fn select(&self, offered: &[Symbol]) -> Result<usize> {
        self.mechanisms
            .iter()
            .position(|mechanism| {
                offered.iter().any(|o| o.as_str() == mechanism.name())
                    && mechanism.is_applicable(&self.credentials)
            })
            .ok_or_else(|| {
                let offered: Vec<&str> = offered.iter().map(|s| s.as_str()).collect();
                EngineError::Sasl(format!(
                    "no applicable mechanism among offered [{}]",
                    offered.join(", ")
                ))
            })
    }

    fn handle_sasl(&mut self, ctx: &mut HandlerContext, frame: SaslPerformative) -> Result<()> {
        match frame {
            SaslPerformative::Mechanisms(offer) => {
                let index = self.select(&offer.mechanisms)?;
                let mechanism = &mut self.mechanisms[index];
                debug!("Selected SASL mechanism {}", mechanism.name());
                let initial_response = mechanism.initial_response(&self.credentials)?;
                ctx.fire_write(Frame::Sasl(SaslPerformative::Init(SaslInit {
                    mechanism: Symbol::from(mechanism.name()),
                    initial_response,
                    hostname: self.hostname.clone(),
                })));
                self.chosen = Some(index);
                self.state = SaslState::Negotiating;
                Ok(())
            }
            SaslPerformative::Challenge(challenge) => {
                let index = self
                    .chosen
                    .ok_or_else(|| EngineError::Sasl("challenge before sasl-init".into()))?;
                let response = self.mechanisms[index]
                    .challenge_response(&self.credentials, &challenge.challenge)?;
                ctx.fire_write(Frame::Sasl(SaslPerformative::Response(SaslResponse {
                    response,
                })));
                Ok(())
            }
            SaslPerformative::Outcome(outcome) if outcome.code == SaslCode::Ok => {
                debug!("SASL negotiation succeeded");
                self.state = SaslState::Succeeded;
                if self.amqp_header_requested {
                    ctx.fire_write(Frame::Header(ProtocolHeader::Amqp));
                }
                for frame in self.held.drain(..) {
                    ctx.fire_write(frame);
                }
                Ok(())
            }
            SaslPerformative::Outcome(outcome) => Err(EngineError::Sasl(format!(
                "authentication failed with outcome {:?}",
                outcome.code
            ))),
            other => Err(EngineError::Sasl(format!(
                "unexpected {} from server",
                other.name()
            ))),
        }
    }
}

impl FrameHandler for SaslClientHandler {
    fn name(&self) -> &'static str {
        "sasl-client"
    }

    fn handle_read(&mut self, ctx: &mut HandlerContext, frame: Frame) -> Result<()> {
        if self.state == SaslState::Succeeded {
            ctx.fire_read(frame);
            return Ok(());
        }
        match frame {
            Frame::Header(ProtocolHeader::Sasl) => Ok(()),
            Frame::Sasl(performative) => self.handle_sasl(ctx, performative),
            other => Err(EngineError::Sasl(format!(
                "received {} before SASL completed",
                other.name()
            ))),
        }
    }

    fn handle_write(&mut self, ctx: &mut HandlerContext, frame: Frame) -> Result<()> {
        match (self.state, frame) {
            (SaslState::Succeeded, frame) => ctx.fire_write(frame),
            (SaslState::Idle, Frame::Header(ProtocolHeader::Amqp)) => {
                self.amqp_header_requested = true;
                self.state = SaslState::HeaderSent;
                ctx.fire_write(Frame::Header(ProtocolHeader::Sasl));
            }
            (_, Frame::Header(ProtocolHeader::Amqp)) => self.amqp_header_requested = true,
            (_, frame) => self.held.push(frame),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use sluice_codec::{Open, SaslChallenge, SaslMechanisms, SaslOutcome};

    use crate::frame::AmqpFrame;

    fn offer(names: &[&str]) -> Frame {
        Frame::Sasl(SaslPerformative::Mechanisms(SaslMechanisms {
            mechanisms: names.iter().map(|n| Symbol::from(*n)).collect(),
        }))
    }

    fn outcome(code: SaslCode) -> Frame {
        Frame::Sasl(SaslPerformative::Outcome(SaslOutcome {
            code,
            additional_data: None,
        }))
    }

    #[test]
    fn test_plain_initial_response() {
        let credentials = Credentials::new("user", "pass");
        let response = PlainMechanism.initial_response(&credentials).unwrap();
        assert_eq!(response, Some(Bytes::from_static(b"\0user\0pass")));
    }

    #[test]
    fn test_applicability() {
        let anonymous = Credentials::default();
        let user = Credentials::new("user", "pass");
        let principal = Credentials {
            local_principal: Some("CN=client".into()),
            ..Credentials::default()
        };

        assert!(AnonymousMechanism.is_applicable(&anonymous));
        assert!(!PlainMechanism.is_applicable(&anonymous));
        assert!(PlainMechanism.is_applicable(&user));
        assert!(!ExternalMechanism.is_applicable(&user));
        assert!(ExternalMechanism.is_applicable(&principal));
    }

    #[test]
    fn test_external_responses_are_empty() {
        let credentials = Credentials::default();
        let mut external = ExternalMechanism;
        assert_eq!(external.initial_response(&credentials).unwrap(), Some(Bytes::new()));
        assert!(external
            .challenge_response(&credentials, &Bytes::from_static(b"abc"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_handshake_holds_writes_until_outcome() {
        let mut pipeline = Pipeline::new();
        pipeline.add_last(Box::new(SaslClientHandler::new(Credentials::new("user", "pass"))));

        let out = pipeline.write(Frame::Header(ProtocolHeader::Amqp)).unwrap();
        assert_eq!(out.to_wire, vec![Frame::Header(ProtocolHeader::Sasl)]);

        let open = Frame::Amqp(AmqpFrame::new(0, Open::new("client")));
        let out = pipeline.write(open.clone()).unwrap();
        assert!(out.to_wire.is_empty());

        let out = pipeline.read(Frame::Header(ProtocolHeader::Sasl)).unwrap();
        assert!(out.to_engine.is_empty());

        let out = pipeline.read(offer(&["ANONYMOUS", "PLAIN"])).unwrap();
        match &out.to_wire[..] {
            [Frame::Sasl(SaslPerformative::Init(init))] => {
                assert_eq!(init.mechanism.as_str(), "PLAIN");
            }
            other => panic!("unexpected {:?}", other),
        }

        let challenge = Frame::Sasl(SaslPerformative::Challenge(SaslChallenge {
            challenge: Bytes::from_static(b"?"),
        }));
        let out = pipeline.read(challenge).unwrap();
        assert!(matches!(
            &out.to_wire[..],
            [Frame::Sasl(SaslPerformative::Response(_))]
        ));

        let out = pipeline.read(outcome(SaslCode::Ok)).unwrap();
        assert_eq!(out.to_wire, vec![Frame::Header(ProtocolHeader::Amqp), open]);

        let out = pipeline.read(Frame::Header(ProtocolHeader::Amqp)).unwrap();
        assert_eq!(out.to_engine, vec![Frame::Header(ProtocolHeader::Amqp)]);
    }

    #[test]
    fn test_no_applicable_mechanism() {
        let mut handler = SaslClientHandler::new(Credentials::default());
        let mut ctx = HandlerContext::default();
        let err = handler.handle_read(&mut ctx, offer(&["PLAIN"])).unwrap_err();
        assert!(matches!(err, EngineError::Sasl(_)));
    }

    #[test]
    fn test_failed_outcome() {
        let mut handler = SaslClientHandler::new(Credentials::default());
        let mut ctx = HandlerContext::default();
        handler.handle_read(&mut ctx, offer(&["ANONYMOUS"])).unwrap();
        assert_eq!(handler.chosen_mechanism(), Some("ANONYMOUS"));
        let err = handler
            .handle_read(&mut ctx, outcome(SaslCode::Auth))
            .unwrap_err();
        assert!(matches!(err, EngineError::Sasl(_)));
        assert!(!handler.is_complete());
    }
}
