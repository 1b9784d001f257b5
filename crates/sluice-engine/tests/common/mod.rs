//! Shared helpers: a scripted peer that reads what the engine wrote and
//! feeds hand built frames back.

#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use sluice_codec::{
    Attach, Begin, Flow, Open, Performative, ReceiverSettleMode, Role, SenderSettleMode, Source,
    Target, Transfer,
};
use sluice_engine::{
    write_frame, AmqpFrame, Engine, EngineConfiguration, Frame, FrameParser, LinkId,
    ProtocolHeader, SessionId,
};

/// Route engine logs to the test output; `RUST_LOG` picks the level.
pub fn install_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Peer {
    parser: FrameParser,
}

impl Peer {
    pub fn new() -> Self {
        install_tracing();
        Self {
            parser: FrameParser::new(u32::MAX),
        }
    }

    /// Everything the engine wrote since the last read.
    pub fn read(&mut self, engine: &mut Engine) -> Vec<Frame> {
        let bytes = engine.take_output();
        self.parser.feed(&bytes);
        let mut frames = Vec::new();
        while let Some(frame) = self.parser.parse_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    /// Performatives only, with Transfer payloads alongside.
    pub fn performatives(&mut self, engine: &mut Engine) -> Vec<(Performative, Option<Bytes>)> {
        self.read(engine)
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Amqp(AmqpFrame {
                    performative,
                    payload,
                    ..
                }) => Some((performative, payload)),
                _ => None,
            })
            .collect()
    }

    pub fn send(&self, engine: &mut Engine, frames: Vec<Frame>) -> sluice_engine::Result<()> {
        engine.ingest(&encode(frames))
    }
}

pub fn encode(frames: Vec<Frame>) -> Bytes {
    let mut buf = BytesMut::new();
    for frame in &frames {
        write_frame(frame, &mut buf);
    }
    buf.freeze()
}

pub fn amqp(channel: u16, performative: impl Into<Performative>) -> Frame {
    Frame::Amqp(AmqpFrame::new(channel, performative))
}

pub fn header() -> Frame {
    Frame::Header(ProtocolHeader::Amqp)
}

pub fn peer_open() -> Open {
    let mut open = Open::new("peer");
    open.max_frame_size = 65536;
    open
}

pub fn begin(remote_channel: Option<u16>, incoming_window: u32) -> Begin {
    Begin {
        remote_channel,
        next_outgoing_id: 0,
        incoming_window,
        outgoing_window: 1000,
        handle_max: u32::MAX,
        offered_capabilities: Vec::new(),
        desired_capabilities: Vec::new(),
        properties: None,
    }
}

pub fn attach(name: &str, handle: u32, role: Role) -> Attach {
    Attach {
        name: name.to_string(),
        handle,
        role,
        snd_settle_mode: SenderSettleMode::default(),
        rcv_settle_mode: ReceiverSettleMode::default(),
        source: Some(Source::new("queue")),
        target: Some(Target::new("queue")),
        unsettled: None,
        incomplete_unsettled: false,
        initial_delivery_count: role.is_sender().then_some(0),
        max_message_size: None,
        offered_capabilities: Vec::new(),
        desired_capabilities: Vec::new(),
        properties: None,
    }
}

/// A receiver's Flow granting `credit` on `handle`.
pub fn credit_flow(handle: u32, delivery_count: u32, credit: u32) -> Flow {
    Flow {
        next_incoming_id: Some(0),
        incoming_window: 1000,
        next_outgoing_id: 0,
        outgoing_window: 1000,
        handle: Some(handle),
        delivery_count: Some(delivery_count),
        link_credit: Some(credit),
        ..Flow::default()
    }
}

pub fn transfer(handle: u32, delivery_id: Option<u32>, more: bool) -> Transfer {
    Transfer {
        handle,
        delivery_id,
        delivery_tag: delivery_id.map(|id| Bytes::copy_from_slice(&id.to_be_bytes())),
        message_format: delivery_id.map(|_| 0),
        settled: Some(false),
        more,
        ..Transfer::default()
    }
}

/// An engine with an open connection and session, the peer having answered.
pub fn connected(config: EngineConfiguration, session_window: u32) -> (Engine, Peer, SessionId) {
    let mut engine = Engine::new(config);
    let mut peer = Peer::new();
    engine.open_connection().unwrap();
    let session = engine.create_session().unwrap();
    engine.open_session(session).unwrap();
    peer.read(&mut engine);
    peer.send(
        &mut engine,
        vec![
            header(),
            amqp(0, peer_open()),
            amqp(0, begin(Some(0), session_window)),
        ],
    )
    .unwrap();
    while engine.poll_connection_event().is_some() {}
    while engine.poll_session_event().is_some() {}
    (engine, peer, session)
}

/// A sender on handle 0, attached by the peer and granted `credit`.
pub fn attached_sender(credit: u32) -> (Engine, Peer, SessionId, LinkId) {
    let (mut engine, mut peer, session) = connected(EngineConfiguration::default(), 1000);
    let link = engine.create_sender(session, "sender").unwrap();
    engine.set_target(link, Target::new("queue")).unwrap();
    engine.open_link(link).unwrap();
    peer.read(&mut engine);
    peer.send(
        &mut engine,
        vec![
            amqp(0, attach("sender", 0, Role::Receiver)),
            amqp(0, credit_flow(0, 0, credit)),
        ],
    )
    .unwrap();
    while engine.poll_link_event().is_some() {}
    (engine, peer, session, link)
}

/// A receiver on handle 0 whose peer sender has attached.
pub fn attached_receiver() -> (Engine, Peer, SessionId, LinkId) {
    let (mut engine, mut peer, session) = connected(EngineConfiguration::default(), 1000);
    let link = engine.create_receiver(session, "receiver").unwrap();
    engine.set_source(link, Source::new("queue")).unwrap();
    engine.open_link(link).unwrap();
    peer.read(&mut engine);
    peer.send(&mut engine, vec![amqp(0, attach("receiver", 0, Role::Sender))])
        .unwrap();
    while engine.poll_link_event().is_some() {}
    (engine, peer, session, link)
}

/// Shuttle bytes between two engines until both are quiet.
pub fn pump(a: &mut Engine, b: &mut Engine) {
    loop {
        let from_a = a.take_output();
        let from_b = b.take_output();
        if from_a.is_empty() && from_b.is_empty() {
            return;
        }
        if !from_a.is_empty() {
            b.ingest(&from_a).unwrap();
        }
        if !from_b.is_empty() {
            a.ingest(&from_b).unwrap();
        }
    }
}

pub fn transfer_frame(channel: u16, transfer: Transfer, payload: &'static [u8]) -> Frame {
    Frame::Amqp(AmqpFrame::new(channel, transfer).with_payload(Bytes::from_static(payload)))
}
