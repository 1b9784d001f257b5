//! A small in-process broker built on the raw engine, reached over an
//! in-memory duplex pipe.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use sluice_client::{ClientConnection, ClientSession};
use sluice_codec::{DeliveryState, Section};
use sluice_engine::{
    ConnectionEvent, DeliveryEvent, DeliveryId, Engine, EngineConfiguration, LinkEvent, LinkId,
    SessionEvent,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

/// How the broker treats links the client attaches.
#[derive(Debug, Clone)]
pub struct Behaviour {
    /// Credit granted to each client sender
    pub credit: u32,
    /// Accept and settle incoming messages
    pub settle: bool,
    /// Answer drain requests from client receivers
    pub answer_drain: bool,
    /// Refuse attaches with this condition
    pub refuse_links: Option<&'static str>,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            credit: 10,
            settle: true,
            answer_drain: true,
            refuse_links: None,
        }
    }
}

/// What a test sees of the broker.
pub struct Broker {
    /// Complete messages received from client senders
    pub received: mpsc::UnboundedReceiver<Bytes>,
    /// Number of aborted deliveries seen
    pub aborted: mpsc::UnboundedReceiver<DeliveryId>,
    /// Messages to push to client receivers
    pub outbox: mpsc::UnboundedSender<Bytes>,
    /// Commands run against the broker engine
    pub control: mpsc::UnboundedSender<Box<dyn FnOnce(&mut Engine) + Send>>,
}

pub fn install_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Start a broker and connect a client to it.
pub async fn connect(behaviour: Behaviour) -> (ClientConnection, ClientSession, Broker) {
    install_tracing();
    let (client_io, broker_io) = tokio::io::duplex(64 * 1024);
    let broker = spawn_broker(broker_io, behaviour);
    let connection = ClientConnection::connect(client_io, EngineConfiguration::default())
        .await
        .unwrap();
    let session = connection.open_session().await.unwrap();
    (connection, session, broker)
}

/// An encoded message with a single Data section.
pub fn data_message(body: &[u8]) -> Bytes {
    Section::Data(Bytes::copy_from_slice(body)).encoded()
}

pub fn spawn_broker(io: DuplexStream, behaviour: Behaviour) -> Broker {
    let (received_tx, received) = mpsc::unbounded_channel();
    let (aborted_tx, aborted) = mpsc::unbounded_channel();
    let (outbox, outbox_rx) = mpsc::unbounded_channel();
    let (control, control_rx) = mpsc::unbounded_channel();
    let state = BrokerState {
        engine: Engine::new(EngineConfiguration::builder().container_id("broker").build().unwrap()),
        behaviour,
        senders: Vec::new(),
        pending: VecDeque::new(),
        partial: HashMap::new(),
        received: received_tx,
        aborted: aborted_tx,
    };
    tokio::spawn(run(state, io, outbox_rx, control_rx));
    Broker {
        received,
        aborted,
        outbox,
        control,
    }
}

struct BrokerState {
    engine: Engine,
    behaviour: Behaviour,
    senders: Vec<LinkId>,
    pending: VecDeque<Bytes>,
    partial: HashMap<DeliveryId, BytesMut>,
    received: mpsc::UnboundedSender<Bytes>,
    aborted: mpsc::UnboundedSender<DeliveryId>,
}

async fn run(
    mut state: BrokerState,
    mut io: DuplexStream,
    mut outbox: mpsc::UnboundedReceiver<Bytes>,
    mut control: mpsc::UnboundedReceiver<Box<dyn FnOnce(&mut Engine) + Send>>,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        if state.engine.tick(Instant::now()).is_err() {
            return;
        }
        state.dispatch();
        let output = state.engine.take_output();
        if !output.is_empty() && io.write_all(&output).await.is_err() {
            return;
        }
        tokio::select! {
            read = io.read(&mut buf) => match read {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    let _ = state.engine.ingest(&buf[..n]);
                }
            },
            Some(message) = outbox.recv() => state.pending.push_back(message),
            Some(command) = control.recv() => command(&mut state.engine),
        }
    }
}

impl BrokerState {
    fn dispatch(&mut self) {
        while let Some(event) = self.engine.poll_connection_event() {
            match event {
                ConnectionEvent::Opened => self.engine.open_connection().unwrap(),
                ConnectionEvent::Closed => self.engine.close_connection(None).unwrap(),
                ConnectionEvent::SessionRemotelyOpened(session) => {
                    self.engine.open_session(session).unwrap()
                }
                ConnectionEvent::Failed(_) => return,
            }
        }
        while let Some(event) = self.engine.poll_session_event() {
            match event {
                SessionEvent::LinkRemotelyOpened(link) => self.attach(link),
                SessionEvent::Closed(session) => {
                    let _ = self.engine.close_session(session, None);
                }
                SessionEvent::Opened(_) => {}
            }
        }
        while let Some(event) = self.engine.poll_link_event() {
            match event {
                LinkEvent::Closed(link) | LinkEvent::Detached(link) => {
                    let _ = self.engine.close_link(link, None);
                }
                LinkEvent::DrainRequested(link) if self.behaviour.answer_drain => {
                    self.engine.drained(link).unwrap();
                }
                _ => {}
            }
        }
        while let Some(event) = self.engine.poll_delivery_event() {
            match event {
                DeliveryEvent::Read(delivery) => self.read(delivery),
                DeliveryEvent::Aborted(delivery) => {
                    self.partial.remove(&delivery);
                    let _ = self.aborted.send(delivery);
                }
                DeliveryEvent::Updated(_) => {}
            }
        }
        self.push_pending();
    }

    fn attach(&mut self, link_id: LinkId) {
        let engine = &mut self.engine;
        let link = engine.link(link_id).unwrap();
        let source = link.remote_source().cloned().unwrap_or_default();
        let target = link.remote_target().cloned().unwrap_or_default();
        let sender = link.is_sender();
        engine.set_source(link_id, source).unwrap();
        engine.set_target(link_id, target).unwrap();
        engine.open_link(link_id).unwrap();
        if let Some(condition) = self.behaviour.refuse_links {
            let error = sluice_codec::ErrorCondition::new(condition, "refused by test broker");
            engine.close_link(link_id, Some(error)).unwrap();
            return;
        }
        if sender {
            self.senders.push(link_id);
        } else {
            engine.add_credit(link_id, self.behaviour.credit).unwrap();
        }
    }

    fn read(&mut self, delivery_id: DeliveryId) {
        let payload = self.engine.read_bytes(delivery_id).unwrap();
        self.partial
            .entry(delivery_id)
            .or_default()
            .extend_from_slice(&payload);
        let complete = self
            .engine
            .delivery(delivery_id)
            .map_or(false, |delivery| delivery.is_complete());
        if !complete {
            return;
        }
        let message = self.partial.remove(&delivery_id).unwrap_or_default();
        let _ = self.received.send(message.freeze());
        if self.behaviour.settle {
            self.engine
                .disposition(delivery_id, Some(DeliveryState::Accepted), true)
                .unwrap();
        }
    }

    fn push_pending(&mut self) {
        for &link in &self.senders {
            while !self.pending.is_empty() && self.engine.is_sendable(link) {
                let Some(message) = self.pending.pop_front() else {
                    break;
                };
                let delivery = self.engine.next_delivery(link).unwrap();
                self.engine.write_bytes(delivery, message, true).unwrap();
            }
        }
    }
}
