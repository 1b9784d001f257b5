//! SASL negotiation in front of the AMQP connection

mod common;

use bytes::Bytes;
use common::*;
use sluice_codec::{SaslCode, SaslMechanisms, SaslOutcome, SaslPerformative, Symbol};
use sluice_engine::{
    ConnectionEvent, Credentials, Engine, EngineConfiguration, EngineError, Frame, FrameParser,
    ProtocolHeader, SaslClientHandler, TracingHandler,
};

fn mechanisms(names: &[&str]) -> Frame {
    Frame::Sasl(SaslPerformative::Mechanisms(SaslMechanisms {
        mechanisms: names.iter().map(|name| Symbol::from(*name)).collect(),
    }))
}

fn outcome(code: SaslCode) -> Frame {
    Frame::Sasl(SaslPerformative::Outcome(SaslOutcome {
        code,
        additional_data: None,
    }))
}

fn parse(parser: &mut FrameParser, bytes: &[u8]) -> Vec<Frame> {
    parser.feed(bytes);
    let mut frames = Vec::new();
    while let Some(frame) = parser.parse_frame().unwrap() {
        frames.push(frame);
    }
    frames
}

fn sasl_engine(credentials: Credentials) -> Engine {
    let mut engine = Engine::new(EngineConfiguration::default());
    engine.add_handler(Box::new(TracingHandler));
    engine.add_handler(Box::new(SaslClientHandler::new(credentials)));
    engine
}

#[test]
fn test_plain_handshake_then_open() {
    let mut engine = sasl_engine(Credentials::new("guest", "secret"));
    engine.open_connection().unwrap();

    let mut server_view = FrameParser::new(u32::MAX);
    let written = parse(&mut server_view, &engine.take_output());
    assert_eq!(written, vec![Frame::Header(ProtocolHeader::Sasl)]);

    engine
        .ingest(&encode(vec![
            Frame::Header(ProtocolHeader::Sasl),
            mechanisms(&["SCRAM-SHA-256", "PLAIN", "ANONYMOUS"]),
        ]))
        .unwrap();
    let written = parse(&mut server_view, &engine.take_output());
    let [Frame::Sasl(SaslPerformative::Init(init))] = written.as_slice() else {
        panic!("expected sasl-init, got {:?}", written);
    };
    assert_eq!(init.mechanism.as_str(), "PLAIN");
    assert_eq!(
        init.initial_response,
        Some(Bytes::from_static(b"\0guest\0secret"))
    );

    engine
        .ingest(&encode(vec![outcome(SaslCode::Ok)]))
        .unwrap();
    let mut amqp_view = FrameParser::new(u32::MAX);
    let names: Vec<&str> = parse(&mut amqp_view, &engine.take_output())
        .iter()
        .map(Frame::name)
        .collect();
    assert_eq!(names, vec!["amqp-header", "open"]);

    engine
        .ingest(&encode(vec![header(), amqp(0, peer_open())]))
        .unwrap();
    assert_eq!(engine.poll_connection_event(), Some(ConnectionEvent::Opened));
}

#[test]
fn test_failed_outcome_fails_engine() {
    let mut engine = sasl_engine(Credentials::new("guest", "wrong"));
    engine.open_connection().unwrap();
    engine.take_output();

    engine
        .ingest(&encode(vec![
            Frame::Header(ProtocolHeader::Sasl),
            mechanisms(&["PLAIN"]),
        ]))
        .unwrap();
    let result = engine.ingest(&encode(vec![outcome(SaslCode::Auth)]));
    assert!(matches!(result, Err(EngineError::Sasl(_))));
    assert!(matches!(
        engine.poll_connection_event(),
        Some(ConnectionEvent::Failed(EngineError::Sasl(_)))
    ));
    assert!(matches!(
        engine.open_connection(),
        Err(EngineError::EngineFailed(_))
    ));
}

#[test]
fn test_sasl_header_without_handler_is_fatal() {
    let mut engine = Engine::new(EngineConfiguration::default());
    engine.open_connection().unwrap();
    let result = engine.ingest(&ProtocolHeader::Sasl.bytes());
    assert!(matches!(result, Err(EngineError::Protocol(_))));
    assert!(engine.is_failed());
}
