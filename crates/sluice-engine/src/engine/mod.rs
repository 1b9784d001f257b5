//! The sans-I/O protocol engine.
//!
//! Bytes go in through [`Engine::ingest`] and come out of
//! [`Engine::take_output`]. Everything else is a method call that validates
//! the request against endpoint state and queues the frames it implies.
//! Nothing blocks and nothing reads a clock; time only advances through
//! [`Engine::tick`].

mod inbound;
mod transfer;

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use sluice_codec::{
    conditions, Attach, Begin, Close, Detach, End, ErrorCondition, Open, Performative, Role,
    Source, Target,
};
use tracing::{debug, trace, warn};

use crate::config::EngineConfiguration;
use crate::connection::Connection;
use crate::delivery::{Delivery, DeliveryId};
use crate::endpoint::EndpointState;
use crate::error::{EngineError, Result};
use crate::event::{ConnectionEvent, DeliveryEvent, LinkEvent, SessionEvent};
use crate::frame::{write_frame, AmqpFrame, Frame, FrameParser, ProtocolHeader};
use crate::link::{Link, LinkId};
use crate::pipeline::{FrameHandler, Pipeline};
use crate::session::{Session, SessionId};
use crate::timer::Timers;

const OUTPUT_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy)]
enum TimerAction {
    DrainTimeout(LinkId),
}

#[derive(Debug, Default)]
struct IdleTracker {
    last_input: Option<Instant>,
    last_output: Option<Instant>,
    input_seen: bool,
    output_seen: bool,
}

fn lookup<'a, K: Ord + fmt::Debug, V>(map: &'a BTreeMap<K, V>, key: K) -> Result<&'a V> {
    map.get(&key)
        .ok_or_else(|| EngineError::illegal_state(format!("unknown {:?}", key)))
}

fn lookup_mut<'a, K: Ord + fmt::Debug, V>(
    map: &'a mut BTreeMap<K, V>,
    key: K,
) -> Result<&'a mut V> {
    map.get_mut(&key)
        .ok_or_else(|| EngineError::illegal_state(format!("unknown {:?}", key)))
}

/// An AMQP 1.0 connection engine
pub struct Engine {
    config: EngineConfiguration,
    pipeline: Pipeline,
    parser: FrameParser,
    output: BytesMut,
    connection: Connection,
    sessions: BTreeMap<SessionId, Session>,
    links: BTreeMap<LinkId, Link>,
    deliveries: BTreeMap<DeliveryId, Delivery>,
    next_id: u64,
    timers: Timers<TimerAction>,
    idle: IdleTracker,
    failure: Option<EngineError>,
    connection_events: VecDeque<ConnectionEvent>,
    session_events: VecDeque<SessionEvent>,
    link_events: VecDeque<LinkEvent>,
    delivery_events: VecDeque<DeliveryEvent>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("handlers", &self.pipeline.names())
            .field("connection", &self.connection)
            .field("sessions", &self.sessions.len())
            .field("links", &self.links.len())
            .field("deliveries", &self.deliveries.len())
            .field("failure", &self.failure)
            .finish()
    }
}

impl Engine {
    pub fn new(config: EngineConfiguration) -> Self {
        let parser = if config.streaming_decode {
            FrameParser::streaming(config.max_frame_size)
        } else {
            FrameParser::new(config.max_frame_size)
        };
        let output = config.buffer_allocator.allocate_with_capacity(OUTPUT_CAPACITY);
        Self {
            connection: Connection::new(config.channel_max),
            config,
            pipeline: Pipeline::new(),
            parser,
            output,
            sessions: BTreeMap::new(),
            links: BTreeMap::new(),
            deliveries: BTreeMap::new(),
            next_id: 0,
            timers: Timers::new(),
            idle: IdleTracker::default(),
            failure: None,
            connection_events: VecDeque::new(),
            session_events: VecDeque::new(),
            link_events: VecDeque::new(),
            delivery_events: VecDeque::new(),
        }
    }

    /// Add a handler at the core end of the handler chain.
    pub fn add_handler(&mut self, handler: Box<dyn FrameHandler>) {
        self.pipeline.add_last(handler);
    }

    pub fn config(&self) -> &EngineConfiguration {
        &self.config
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn session(&self, session: SessionId) -> Option<&Session> {
        self.sessions.get(&session)
    }

    pub fn link(&self, link: LinkId) -> Option<&Link> {
        self.links.get(&link)
    }

    pub fn delivery(&self, delivery: DeliveryId) -> Option<&Delivery> {
        self.deliveries.get(&delivery)
    }

    /// The error that failed the engine, if any.
    pub fn failure(&self) -> Option<&EngineError> {
        self.failure.as_ref()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub(crate) fn check_failed(&self) -> Result<()> {
        match &self.failure {
            Some(cause) => Err(EngineError::EngineFailed(Box::new(cause.clone()))),
            None => Ok(()),
        }
    }

    // ---- events ----

    pub fn poll_connection_event(&mut self) -> Option<ConnectionEvent> {
        self.connection_events.pop_front()
    }

    pub fn poll_session_event(&mut self) -> Option<SessionEvent> {
        self.session_events.pop_front()
    }

    pub fn poll_link_event(&mut self) -> Option<LinkEvent> {
        self.link_events.pop_front()
    }

    pub fn poll_delivery_event(&mut self) -> Option<DeliveryEvent> {
        self.delivery_events.pop_front()
    }

    // ---- I/O ----

    /// Feed bytes read from the transport.
    pub fn ingest(&mut self, bytes: &[u8]) -> Result<()> {
        self.check_failed()?;
        self.idle.input_seen = true;
        self.parser.feed(bytes);
        loop {
            let frame = match self.parser.parse_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(err) => return Err(self.fail(err)),
            };
            let output = match self.pipeline.read(frame) {
                Ok(output) => output,
                Err(err) => return Err(self.fail(err)),
            };
            for frame in output.to_wire {
                self.emit(&frame);
            }
            for frame in output.to_engine {
                if let Err(err) = self.process(frame) {
                    return Err(self.fail(err));
                }
            }
        }
    }

    /// Bytes to hand to the transport.
    pub fn take_output(&mut self) -> Bytes {
        self.output.split().freeze()
    }

    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// Advance timers and idle timeout handling.
    ///
    /// Returns the next instant at which `tick` has work to do.
    pub fn tick(&mut self, now: Instant) -> Result<Option<Instant>> {
        self.check_failed()?;

        for action in self.timers.expired(now) {
            match action {
                TimerAction::DrainTimeout(link_id) => {
                    if let Some(link) = self.links.get_mut(&link_id) {
                        debug!("Drain timed out on link {}", link.name);
                        link.drain = false;
                        link.drain_timer = None;
                        self.link_events.push_back(LinkEvent::DrainFailed(link_id));
                    }
                }
            }
        }

        if self.idle.input_seen || self.idle.last_input.is_none() {
            self.idle.last_input = Some(now);
            self.idle.input_seen = false;
        }
        if self.idle.output_seen || self.idle.last_output.is_none() {
            self.idle.last_output = Some(now);
            self.idle.output_seen = false;
        }

        let mut deadline = self.timers.next_deadline();
        let mut earliest = |candidate: Instant| {
            deadline = Some(deadline.map_or(candidate, |d| d.min(candidate)));
        };

        let open_sent = self.connection.endpoint.open_sent();
        let writable = open_sent && !self.connection.endpoint.close_sent();

        if let (Some(timeout), Some(last_input)) = (self.config.idle_timeout, self.idle.last_input) {
            if open_sent {
                let expires = last_input + timeout;
                if now >= expires {
                    let error = EngineError::protocol("local idle timeout expired");
                    let condition = ErrorCondition::new(
                        conditions::RESOURCE_LIMIT_EXCEEDED,
                        "local idle timeout expired",
                    );
                    return Err(self.fail_with(error, Some(condition)));
                }
                earliest(expires);
            }
        }

        if let (Some(remote), Some(last_output)) =
            (self.connection.remote_idle_timeout(), self.idle.last_output)
        {
            if writable {
                let interval = remote / 2;
                let mut due = last_output + interval;
                if now >= due {
                    trace!("Sending heartbeat");
                    self.write(Frame::Empty)?;
                    self.idle.last_output = Some(now);
                    self.idle.output_seen = false;
                    due = now + interval;
                }
                earliest(due);
            }
        }

        Ok(deadline)
    }

    // ---- connection ----

    pub fn open_connection(&mut self) -> Result<()> {
        self.check_failed()?;
        self.connection.endpoint.open()?;
        debug!("Opening connection as {}", self.config.container_id);
        self.flush_opens()
    }

    /// Close the connection, implicitly ending every session.
    pub fn close_connection(&mut self, error: Option<ErrorCondition>) -> Result<()> {
        self.check_failed()?;
        if !self.connection.endpoint.close(error.clone()) {
            return Ok(());
        }
        debug!("Closing connection");
        for session in self.sessions.values_mut() {
            session.endpoint.close_silently();
            session.blocked.clear();
        }
        for link in self.links.values_mut() {
            link.endpoint.close_silently();
            link.pending.clear();
        }
        if self.connection.endpoint.needs_close() {
            self.connection.endpoint.mark_close_sent();
            self.send(0, Close { error })?;
        }
        Ok(())
    }

    // ---- sessions ----

    pub fn create_session(&mut self) -> Result<SessionId> {
        self.check_failed()?;
        if self.connection.endpoint.is_closing() {
            return Err(EngineError::illegal_state(
                "cannot create a session on a closing connection",
            ));
        }
        let id = SessionId(self.allocate_id());
        let session = Session::new(
            id,
            self.config.incoming_window,
            self.config.outgoing_window,
            self.config.handle_max,
        );
        self.sessions.insert(id, session);
        Ok(id)
    }

    pub fn open_session(&mut self, session_id: SessionId) -> Result<()> {
        self.check_failed()?;
        if self.connection.endpoint.is_closing() {
            return Err(EngineError::illegal_state(
                "cannot open a session on a closing connection",
            ));
        }
        let session = lookup(&self.sessions, session_id)?;
        if session.endpoint.local_state() != EndpointState::Idle {
            return lookup_mut(&mut self.sessions, session_id)?.endpoint.open();
        }
        let channel = self
            .connection
            .free_channel()
            .ok_or_else(|| EngineError::illegal_state("no free channel"))?;
        let session = lookup_mut(&mut self.sessions, session_id)?;
        session.endpoint.open()?;
        session.local_channel = Some(channel);
        self.connection.sessions_by_channel.insert(channel, session_id);
        debug!("Opening session on channel {}", channel);
        self.flush_opens()
    }

    /// End a session, implicitly detaching every link on it.
    pub fn close_session(&mut self, session_id: SessionId, error: Option<ErrorCondition>) -> Result<()> {
        self.check_failed()?;
        let session = lookup_mut(&mut self.sessions, session_id)?;
        if !session.endpoint.close(error.clone()) {
            return Ok(());
        }
        session.blocked.clear();
        let links = session.links.clone();
        for link_id in links {
            if let Some(link) = self.links.get_mut(&link_id) {
                link.endpoint.close_silently();
                link.pending.clear();
                if let Some(timer) = link.drain_timer.take() {
                    self.timers.cancel(timer);
                }
            }
        }
        let session = lookup_mut(&mut self.sessions, session_id)?;
        if session.endpoint.needs_close() && !self.connection.endpoint.close_sent() {
            session.endpoint.mark_close_sent();
            if let Some(channel) = session.local_channel {
                debug!("Ending session on channel {}", channel);
                self.send(channel, End { error })?;
            }
        }
        self.maybe_free_session(session_id);
        Ok(())
    }

    // ---- links ----

    pub fn create_sender(&mut self, session: SessionId, name: impl Into<String>) -> Result<LinkId> {
        self.create_link(session, name.into(), Role::Sender)
    }

    pub fn create_receiver(&mut self, session: SessionId, name: impl Into<String>) -> Result<LinkId> {
        self.create_link(session, name.into(), Role::Receiver)
    }

    fn create_link(&mut self, session_id: SessionId, name: String, role: Role) -> Result<LinkId> {
        self.check_failed()?;
        self.check_parent_session(session_id)?;
        let id = LinkId(self.allocate_id());
        let session = lookup_mut(&mut self.sessions, session_id)?;
        session.links.push(id);
        self.links.insert(id, Link::new(id, session_id, name, role));
        Ok(id)
    }

    pub fn set_source(&mut self, link_id: LinkId, source: Source) -> Result<()> {
        let link = self.configurable_link(link_id)?;
        link.source = Some(source);
        Ok(())
    }

    pub fn set_target(&mut self, link_id: LinkId, target: Target) -> Result<()> {
        let link = self.configurable_link(link_id)?;
        link.target = Some(target);
        Ok(())
    }

    pub fn set_max_message_size(&mut self, link_id: LinkId, size: u64) -> Result<()> {
        let link = self.configurable_link(link_id)?;
        link.max_message_size = Some(size);
        Ok(())
    }

    fn configurable_link(&mut self, link_id: LinkId) -> Result<&mut Link> {
        self.check_failed()?;
        let link = lookup_mut(&mut self.links, link_id)?;
        if link.endpoint.open_sent() {
            return Err(EngineError::illegal_state(
                "link terminus cannot change after attach",
            ));
        }
        Ok(link)
    }

    pub fn open_link(&mut self, link_id: LinkId) -> Result<()> {
        self.check_failed()?;
        let session_id = lookup(&self.links, link_id)?.session;
        self.check_parent_session(session_id)?;
        let link = lookup(&self.links, link_id)?;
        if link.endpoint.local_state() != EndpointState::Idle {
            return lookup_mut(&mut self.links, link_id)?.endpoint.open();
        }
        let session = lookup_mut(&mut self.sessions, session_id)?;
        let handle = session
            .free_handle()
            .ok_or_else(|| EngineError::illegal_state("no free link handle"))?;
        session.links_by_handle.insert(handle, link_id);
        let link = lookup_mut(&mut self.links, link_id)?;
        link.endpoint.open()?;
        link.local_handle = Some(handle);
        debug!("Attaching link {} on handle {}", link.name, handle);
        self.flush_opens()
    }

    /// Detach with `closed=true`.
    pub fn close_link(&mut self, link_id: LinkId, error: Option<ErrorCondition>) -> Result<()> {
        self.close_link_inner(link_id, true, error)
    }

    /// Detach with `closed=false`, leaving the terminus in place.
    pub fn detach_link(&mut self, link_id: LinkId, error: Option<ErrorCondition>) -> Result<()> {
        self.close_link_inner(link_id, false, error)
    }

    fn close_link_inner(
        &mut self,
        link_id: LinkId,
        closed: bool,
        error: Option<ErrorCondition>,
    ) -> Result<()> {
        self.check_failed()?;
        let link = lookup_mut(&mut self.links, link_id)?;
        if !link.endpoint.close(error.clone()) {
            return Ok(());
        }
        link.detach_only = !closed;
        link.pending.clear();
        if let Some(timer) = link.drain_timer.take() {
            self.timers.cancel(timer);
        }
        let session_id = link.session;
        let handle = link.local_handle;
        let owes_detach = link.endpoint.needs_close();
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.blocked.retain(|id| *id != link_id);
        }
        if let (true, Some(channel), Some(handle)) =
            (owes_detach, self.writable_channel(session_id), handle)
        {
            lookup_mut(&mut self.links, link_id)?.endpoint.mark_close_sent();
            debug!("Detaching handle {} closed={}", handle, closed);
            self.send(
                channel,
                Detach {
                    handle,
                    closed,
                    error,
                },
            )?;
        }
        self.maybe_free_link(link_id);
        Ok(())
    }

    pub fn set_link_resource(&mut self, link_id: LinkId, resource: u64) -> Result<()> {
        lookup_mut(&mut self.links, link_id)?.linked_resource = Some(resource);
        Ok(())
    }

    pub fn set_delivery_resource(&mut self, delivery_id: DeliveryId, resource: u64) -> Result<()> {
        lookup_mut(&mut self.deliveries, delivery_id)?.linked_resource = Some(resource);
        Ok(())
    }

    // ---- internals ----

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_parent_session(&self, session_id: SessionId) -> Result<()> {
        if self.connection.endpoint.is_closing() {
            return Err(EngineError::illegal_state("connection is closing"));
        }
        if lookup(&self.sessions, session_id)?.endpoint.is_closing() {
            return Err(EngineError::illegal_state("session is closing"));
        }
        Ok(())
    }

    /// The session's channel, when frames may be sent on it.
    fn writable_channel(&self, session_id: SessionId) -> Option<u16> {
        let connection = &self.connection.endpoint;
        if !connection.open_sent() || connection.close_sent() {
            return None;
        }
        let session = self.sessions.get(&session_id)?;
        if !session.endpoint.open_sent() || session.endpoint.close_sent() {
            return None;
        }
        session.local_channel
    }

    fn local_open(&self) -> Open {
        let mut open = Open::new(self.config.container_id.clone());
        open.hostname = self.config.hostname.clone();
        open.max_frame_size = self.config.max_frame_size;
        open.channel_max = self.config.channel_max;
        open.idle_timeout = self
            .config
            .idle_timeout
            .map(|timeout| u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
        open
    }

    /// Send every opening performative whose parent has already gone out.
    fn flush_opens(&mut self) -> Result<()> {
        if self.connection.endpoint.local_state() == EndpointState::Idle {
            return Ok(());
        }
        if !self.connection.header_sent {
            self.connection.header_sent = true;
            self.write(Frame::Header(ProtocolHeader::Amqp))?;
        }
        if self.connection.endpoint.needs_open() {
            self.connection.endpoint.mark_open_sent();
            let open = self.local_open();
            self.send(0, open)?;
        }
        if self.connection.endpoint.close_sent() {
            return Ok(());
        }
        let session_ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for session_id in session_ids {
            self.flush_session_opens(session_id)?;
        }
        Ok(())
    }

    fn flush_session_opens(&mut self, session_id: SessionId) -> Result<()> {
        let session = lookup_mut(&mut self.sessions, session_id)?;
        if session.endpoint.needs_open() {
            if let Some(channel) = session.local_channel {
                session.endpoint.mark_open_sent();
                session.initial_outgoing_id = session.next_outgoing_id;
                let begin = Begin {
                    remote_channel: session.remote_channel,
                    next_outgoing_id: session.next_outgoing_id,
                    incoming_window: session.incoming_remaining,
                    outgoing_window: session.outgoing_window,
                    handle_max: session.handle_max,
                    offered_capabilities: Vec::new(),
                    desired_capabilities: Vec::new(),
                    properties: None,
                };
                self.send(channel, begin)?;
            }
        }
        let Some(channel) = self.writable_channel(session_id) else {
            return Ok(());
        };
        let links = lookup(&self.sessions, session_id)?.links.clone();
        for link_id in links {
            let link = lookup_mut(&mut self.links, link_id)?;
            let Some(handle) = link.local_handle else {
                continue;
            };
            if !link.endpoint.needs_open() {
                continue;
            }
            link.endpoint.mark_open_sent();
            let attach = Attach {
                name: link.name.clone(),
                handle,
                role: link.role,
                snd_settle_mode: link.snd_settle_mode,
                rcv_settle_mode: link.rcv_settle_mode,
                source: link.source.clone(),
                target: link.target.clone(),
                unsettled: None,
                incomplete_unsettled: false,
                initial_delivery_count: link.is_sender().then_some(link.delivery_count),
                max_message_size: link.max_message_size,
                offered_capabilities: Vec::new(),
                desired_capabilities: Vec::new(),
                properties: None,
            };
            let grant = !link.is_sender() && link.credit.available() > 0;
            self.send(channel, attach)?;
            if grant {
                self.send_link_flow(link_id, false)?;
            }
        }
        Ok(())
    }

    /// Forget a link once both sides have closed it.
    fn maybe_free_link(&mut self, link_id: LinkId) {
        let Some(link) = self.links.get_mut(&link_id) else {
            return;
        };
        if !link.endpoint.is_fully_closed() {
            return;
        }
        let handle = link.local_handle.take();
        let remote_handle = link.remote_handle.take();
        let deliveries = std::mem::take(&mut link.deliveries);
        link.current = None;
        if let Some(session) = self.sessions.get_mut(&link.session) {
            if let Some(handle) = handle {
                session.links_by_handle.remove(&handle);
            }
            if let Some(handle) = remote_handle {
                session.links_by_remote_handle.remove(&handle);
            }
            session.outgoing_unsettled.retain(|_, d| !deliveries.contains(d));
            session.incoming_unsettled.retain(|_, d| !deliveries.contains(d));
        }
        for delivery in deliveries {
            self.deliveries.remove(&delivery);
        }
        trace!("Released link {}", link.name);
    }

    /// Forget a session's channels once both sides have ended it.
    fn maybe_free_session(&mut self, session_id: SessionId) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        if !session.endpoint.is_fully_closed() {
            return;
        }
        if let Some(channel) = session.local_channel.take() {
            self.connection.sessions_by_channel.remove(&channel);
        }
        if let Some(channel) = session.remote_channel.take() {
            self.connection.sessions_by_remote_channel.remove(&channel);
        }
        let links = session.links.clone();
        for link_id in links {
            if let Some(link) = self.links.get_mut(&link_id) {
                link.endpoint.close_silently();
                link.endpoint.remote_closed(None);
            }
            self.maybe_free_link(link_id);
        }
    }

    fn send(&mut self, channel: u16, performative: impl Into<Performative>) -> Result<()> {
        self.write(Frame::Amqp(AmqpFrame::new(channel, performative)))
    }

    /// Run a frame through the handler chain towards the wire.
    fn write(&mut self, frame: Frame) -> Result<()> {
        let output = self.pipeline.write(frame)?;
        for frame in output.to_wire {
            self.emit(&frame);
        }
        for frame in output.to_engine {
            self.process(frame)?;
        }
        Ok(())
    }

    fn emit(&mut self, frame: &Frame) {
        trace!("Writing {}", frame.name());
        write_frame(frame, &mut self.output);
        self.idle.output_seen = true;
    }

    fn fail(&mut self, error: EngineError) -> EngineError {
        let condition = match &error {
            EngineError::Decode(_) => Some(conditions::DECODE_ERROR),
            EngineError::FrameSize { .. } => Some(conditions::FRAMING_ERROR),
            EngineError::Protocol(_) => Some(conditions::NOT_ALLOWED),
            EngineError::Sasl(_) => None,
            _ => Some(conditions::INTERNAL_ERROR),
        }
        .map(|condition| ErrorCondition::new(condition, error.to_string()));
        self.fail_with(error, condition)
    }

    /// Record a fatal error, send Close if possible and refuse further work.
    fn fail_with(&mut self, error: EngineError, condition: Option<ErrorCondition>) -> EngineError {
        if self.failure.is_some() {
            return error;
        }
        warn!("Connection failed: {}", error);
        self.failure = Some(error.clone());
        self.pipeline.fire_error(&error);

        let endpoint = &mut self.connection.endpoint;
        endpoint.close(condition.clone());
        if endpoint.open_sent() && !endpoint.close_sent() {
            endpoint.mark_close_sent();
            if let Err(err) = self.send(0, Close { error: condition }) {
                debug!("Could not send Close after failure: {}", err);
            }
        }
        self.connection.endpoint.remote_closed(None);
        self.connection_events
            .push_back(ConnectionEvent::Failed(error.clone()));
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameParser;

    fn frames(parser: &mut FrameParser, bytes: &[u8]) -> Vec<Frame> {
        parser.feed(bytes);
        let mut out = Vec::new();
        while let Some(frame) = parser.parse_frame().unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn test_open_writes_header_then_open() {
        let mut engine = Engine::new(EngineConfiguration::default());
        engine.open_connection().unwrap();

        let mut parser = FrameParser::new(u32::MAX);
        let written = frames(&mut parser, &engine.take_output());
        assert_eq!(written.len(), 2);
        assert_eq!(written[0], Frame::Header(ProtocolHeader::Amqp));
        match &written[1] {
            Frame::Amqp(AmqpFrame {
                performative: Performative::Open(open),
                ..
            }) => assert_eq!(open.container_id, "sluice"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_children_wait_for_parents() {
        let mut engine = Engine::new(EngineConfiguration::default());
        let session = engine.create_session().unwrap();
        let link = engine.create_sender(session, "early").unwrap();
        engine.open_link(link).unwrap();
        engine.open_session(session).unwrap();
        assert!(!engine.has_output());

        engine.open_connection().unwrap();
        let mut parser = FrameParser::new(u32::MAX);
        let names: Vec<&str> = frames(&mut parser, &engine.take_output())
            .iter()
            .map(Frame::name)
            .collect();
        assert_eq!(names, vec!["amqp-header", "open", "begin", "attach"]);
    }

    #[test]
    fn test_close_twice_sends_once() {
        let mut engine = Engine::new(EngineConfiguration::default());
        engine.open_connection().unwrap();
        engine.take_output();
        engine.close_connection(None).unwrap();
        engine.close_connection(None).unwrap();

        let mut parser = FrameParser::new(u32::MAX);
        parser.feed(&ProtocolHeader::Amqp.bytes());
        let written = frames(&mut parser, &engine.take_output());
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].name(), "close");
    }

    #[test]
    fn test_child_of_closed_parent_is_illegal() {
        let mut engine = Engine::new(EngineConfiguration::default());
        engine.open_connection().unwrap();
        let session = engine.create_session().unwrap();
        engine.open_session(session).unwrap();
        let link = engine.create_receiver(session, "late").unwrap();
        engine.close_session(session, None).unwrap();

        assert!(matches!(
            engine.open_link(link),
            Err(EngineError::IllegalState(_))
        ));
        assert!(matches!(
            engine.create_sender(session, "later"),
            Err(EngineError::IllegalState(_))
        ));

        engine.close_connection(None).unwrap();
        assert!(matches!(
            engine.create_session(),
            Err(EngineError::IllegalState(_))
        ));
    }

    #[test]
    fn test_terminus_frozen_after_attach() {
        let mut engine = Engine::new(EngineConfiguration::default());
        engine.open_connection().unwrap();
        let session = engine.create_session().unwrap();
        engine.open_session(session).unwrap();
        let link = engine.create_sender(session, "s").unwrap();
        engine.set_target(link, Target::new("queue")).unwrap();
        engine.open_link(link).unwrap();
        assert!(matches!(
            engine.set_target(link, Target::new("other")),
            Err(EngineError::IllegalState(_))
        ));
    }
}
