//! Performatives arriving from the peer.

use bytes::Bytes;
use sluice_codec::{
    conditions, Attach, Begin, Close, Detach, Disposition, End, ErrorCondition, Flow, Open,
    Performative, Role, Transfer,
};
use tracing::{debug, warn};

use super::{lookup, lookup_mut, Engine};
use crate::delivery::{Delivery, DeliveryId};
use crate::endpoint::EndpointState;
use crate::error::{EngineError, Result};
use crate::event::{ConnectionEvent, DeliveryEvent, LinkEvent, SessionEvent};
use crate::frame::{AmqpFrame, Frame, ProtocolHeader};
use crate::link::{Link, LinkId};
use crate::session::{Session, SessionId};

impl Engine {
    /// Apply a frame that made it through the handler chain.
    pub(super) fn process(&mut self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Header(ProtocolHeader::Amqp) => {
                if self.connection.header_received {
                    return Err(EngineError::protocol("duplicate protocol header"));
                }
                self.connection.header_received = true;
                Ok(())
            }
            Frame::Header(ProtocolHeader::Sasl) => Err(EngineError::protocol(
                "peer requires SASL but no SASL handler is installed",
            )),
            Frame::Sasl(performative) => Err(EngineError::protocol(format!(
                "unexpected SASL frame {}",
                performative.name()
            ))),
            Frame::Empty => Ok(()),
            Frame::Amqp(frame) => self.process_performative(frame),
        }
    }

    fn process_performative(&mut self, frame: AmqpFrame) -> Result<()> {
        let AmqpFrame {
            channel,
            performative,
            payload,
        } = frame;

        if !self.connection.header_received {
            return Err(EngineError::protocol(format!(
                "{} received before the protocol header",
                performative.name()
            )));
        }
        let remote = self.connection.endpoint.remote_state();
        match (&performative, remote) {
            (Performative::Open(_), EndpointState::Idle) => {}
            (Performative::Open(_), _) => return Err(EngineError::protocol("duplicate Open")),
            (_, EndpointState::Idle) => {
                return Err(EngineError::protocol(format!(
                    "{} received before Open",
                    performative.name()
                )))
            }
            (_, EndpointState::Closed) => {
                return Err(EngineError::protocol(format!(
                    "{} received after Close",
                    performative.name()
                )))
            }
            _ => {}
        }

        match performative {
            Performative::Open(open) => self.on_open(open),
            Performative::Close(close) => self.on_close(close),
            Performative::Begin(begin) => self.on_begin(channel, begin),
            Performative::End(end) => self.on_end(channel, end),
            Performative::Attach(attach) => self.on_attach(channel, attach),
            Performative::Detach(detach) => self.on_detach(channel, detach),
            Performative::Flow(flow) => self.on_flow(channel, flow),
            Performative::Transfer(transfer) => {
                self.on_transfer(channel, transfer, payload.unwrap_or_default())
            }
            Performative::Disposition(disposition) => self.on_disposition(channel, disposition),
        }
    }

    fn on_open(&mut self, open: Open) -> Result<()> {
        debug!(
            "Peer {} opened with max frame {}",
            open.container_id, open.max_frame_size
        );
        self.connection.remote_open = Some(open);
        self.connection.endpoint.remote_opened();
        self.connection_events.push_back(ConnectionEvent::Opened);
        Ok(())
    }

    fn on_close(&mut self, close: Close) -> Result<()> {
        debug!("Peer closed connection: {:?}", close.error);
        self.connection.endpoint.remote_closed(close.error);
        for session in self.sessions.values_mut() {
            session.endpoint.remote_closed(None);
        }
        for link in self.links.values_mut() {
            link.endpoint.remote_closed(None);
            if let Some(timer) = link.drain_timer.take() {
                self.timers.cancel(timer);
            }
        }
        self.connection_events.push_back(ConnectionEvent::Closed);
        Ok(())
    }

    fn session_for_channel(&self, channel: u16) -> Result<SessionId> {
        self.connection
            .sessions_by_remote_channel
            .get(&channel)
            .copied()
            .ok_or_else(|| EngineError::protocol(format!("frame on unknown channel {}", channel)))
    }

    /// Resolve a remote handle, failing with unattached-handle.
    fn link_for_handle(&mut self, session_id: SessionId, handle: u32) -> Result<LinkId> {
        let found = lookup(&self.sessions, session_id)?
            .links_by_remote_handle
            .get(&handle)
            .copied();
        match found {
            Some(link) => Ok(link),
            None => {
                let error = EngineError::protocol(format!("frame on unattached handle {}", handle));
                let condition = ErrorCondition::new(conditions::UNATTACHED_HANDLE, error.to_string());
                Err(self.fail_with(error, Some(condition)))
            }
        }
    }

    fn on_begin(&mut self, channel: u16, begin: Begin) -> Result<()> {
        if self.connection.sessions_by_remote_channel.contains_key(&channel) {
            return Err(EngineError::protocol(format!(
                "Begin on channel {} already in use",
                channel
            )));
        }
        let (session_id, initiated_locally) = match begin.remote_channel {
            Some(local) => {
                let session_id = self
                    .connection
                    .sessions_by_channel
                    .get(&local)
                    .copied()
                    .ok_or_else(|| {
                        EngineError::protocol(format!("Begin answers unknown channel {}", local))
                    })?;
                (session_id, true)
            }
            None => {
                let session_id = SessionId(self.allocate_id());
                let session = Session::new(
                    session_id,
                    self.config.incoming_window,
                    self.config.outgoing_window,
                    self.config.handle_max,
                );
                self.sessions.insert(session_id, session);
                (session_id, false)
            }
        };

        let session = lookup_mut(&mut self.sessions, session_id)?;
        session.remote_channel = Some(channel);
        session.next_incoming_id = begin.next_outgoing_id;
        session.remote_incoming_window = begin.incoming_window;
        session.remote_outgoing_window = begin.outgoing_window;
        session.remote_handle_max = begin.handle_max;
        session.endpoint.remote_opened();
        self.connection
            .sessions_by_remote_channel
            .insert(channel, session_id);
        debug!("Peer began session on channel {}", channel);

        if initiated_locally {
            self.session_events.push_back(SessionEvent::Opened(session_id));
        } else {
            self.connection_events
                .push_back(ConnectionEvent::SessionRemotelyOpened(session_id));
        }
        self.service_session(session_id)
    }

    fn on_end(&mut self, channel: u16, end: End) -> Result<()> {
        let session_id = self.session_for_channel(channel)?;
        let session = lookup_mut(&mut self.sessions, session_id)?;
        debug!("Peer ended session on channel {}", channel);
        session.endpoint.remote_closed(end.error);
        session.links_by_remote_handle.clear();
        let links = session.links.clone();
        self.connection.sessions_by_remote_channel.remove(&channel);
        for link_id in links {
            if let Some(link) = self.links.get_mut(&link_id) {
                link.endpoint.remote_closed(None);
                link.remote_handle = None;
                link.drain = false;
                if let Some(timer) = link.drain_timer.take() {
                    self.timers.cancel(timer);
                }
            }
        }
        self.session_events.push_back(SessionEvent::Closed(session_id));
        self.maybe_free_session(session_id);
        Ok(())
    }

    fn on_attach(&mut self, channel: u16, attach: Attach) -> Result<()> {
        let session_id = self.session_for_channel(channel)?;
        let in_use = lookup(&self.sessions, session_id)?
            .links_by_remote_handle
            .contains_key(&attach.handle);
        if in_use {
            let error = EngineError::protocol(format!("handle {} already attached", attach.handle));
            let condition = ErrorCondition::new(conditions::HANDLE_IN_USE, error.to_string());
            return Err(self.fail_with(error, Some(condition)));
        }
        let session = lookup(&self.sessions, session_id)?;

        // The peer's role is the opposite of ours.
        let local_role = match attach.role {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        };
        let existing = session.links.iter().copied().find(|id| {
            self.links.get(id).is_some_and(|link| {
                link.name == attach.name
                    && link.role == local_role
                    && link.remote_handle.is_none()
                    && link.endpoint.remote_state() == EndpointState::Idle
            })
        });

        let (link_id, initiated_locally) = match existing {
            Some(link_id) => (link_id, true),
            None => {
                let link_id = LinkId(self.allocate_id());
                let link = Link::new(link_id, session_id, attach.name.clone(), local_role);
                self.links.insert(link_id, link);
                lookup_mut(&mut self.sessions, session_id)?.links.push(link_id);
                (link_id, false)
            }
        };

        lookup_mut(&mut self.sessions, session_id)?
            .links_by_remote_handle
            .insert(attach.handle, link_id);
        let link = lookup_mut(&mut self.links, link_id)?;
        debug!("Peer attached link {} on handle {}", link.name, attach.handle);
        link.remote_handle = Some(attach.handle);
        link.remote_source = attach.source;
        link.remote_target = attach.target;
        if !link.is_sender() {
            link.delivery_count = attach.initial_delivery_count.unwrap_or(0);
        }
        if !initiated_locally {
            link.snd_settle_mode = attach.snd_settle_mode;
            link.rcv_settle_mode = attach.rcv_settle_mode;
        }
        link.endpoint.remote_opened();

        if initiated_locally {
            self.link_events.push_back(LinkEvent::Opened(link_id));
        } else {
            self.session_events
                .push_back(SessionEvent::LinkRemotelyOpened(link_id));
        }
        Ok(())
    }

    fn on_detach(&mut self, channel: u16, detach: Detach) -> Result<()> {
        let session_id = self.session_for_channel(channel)?;
        let link_id = self.link_for_handle(session_id, detach.handle)?;
        lookup_mut(&mut self.sessions, session_id)?
            .links_by_remote_handle
            .remove(&detach.handle);

        let link = lookup_mut(&mut self.links, link_id)?;
        debug!("Peer detached link {} closed={}", link.name, detach.closed);
        link.endpoint.remote_closed(detach.error);
        link.remote_handle = None;
        link.drain = false;
        if let Some(timer) = link.drain_timer.take() {
            self.timers.cancel(timer);
        }
        let event = if detach.closed {
            LinkEvent::Closed(link_id)
        } else {
            LinkEvent::Detached(link_id)
        };
        self.link_events.push_back(event);
        self.maybe_free_link(link_id);
        Ok(())
    }

    fn on_flow(&mut self, channel: u16, flow: Flow) -> Result<()> {
        let session_id = self.session_for_channel(channel)?;
        let session = lookup_mut(&mut self.sessions, session_id)?;
        session.update_remote_incoming_window(flow.next_incoming_id, flow.incoming_window);
        session.remote_outgoing_window = flow.outgoing_window;

        match flow.handle {
            Some(handle) => {
                let link_id = self.link_for_handle(session_id, handle)?;
                self.on_link_flow(link_id, &flow)?;
                if flow.echo {
                    self.send_link_flow(link_id, false)?;
                }
            }
            None if flow.echo => self.send_session_flow(session_id)?,
            None => {}
        }
        self.service_session(session_id)
    }

    fn on_link_flow(&mut self, link_id: LinkId, flow: &Flow) -> Result<()> {
        let link = lookup_mut(&mut self.links, link_id)?;
        let link_credit = flow.link_credit.unwrap_or(0);

        if link.is_sender() {
            let was_sendable = link.is_sendable();
            let delivery_count = flow.delivery_count.unwrap_or(0);
            let credit = crate::flow_control::sender_credit(
                delivery_count,
                link_credit,
                link.delivery_count,
            );
            link.credit.set(credit);
            link.drain = flow.drain;
            let now_sendable = link.is_sendable();
            self.link_events.push_back(LinkEvent::CreditUpdated(link_id));
            if !was_sendable && now_sendable {
                self.link_events.push_back(LinkEvent::Sendable(link_id));
            }
            if flow.drain {
                self.link_events.push_back(LinkEvent::DrainRequested(link_id));
            }
            return Ok(());
        }

        if let Some(delivery_count) = flow.delivery_count {
            let limit = link
                .delivery_count
                .wrapping_add(link.credit.available());
            let credit = limit.wrapping_sub(delivery_count);
            if credit <= link.credit.available() {
                link.credit.set(credit);
            } else {
                link.credit.set(0);
            }
            link.delivery_count = delivery_count;
        }
        self.link_events.push_back(LinkEvent::CreditUpdated(link_id));
        self.check_drained(link_id);
        Ok(())
    }

    /// Finish a receiver's drain once the sender has used up the credit.
    pub(super) fn check_drained(&mut self, link_id: LinkId) {
        let Some(link) = self.links.get_mut(&link_id) else {
            return;
        };
        if link.is_sender() || !link.drain || link.credit.available() > 0 {
            return;
        }
        link.drain = false;
        if let Some(timer) = link.drain_timer.take() {
            self.timers.cancel(timer);
        }
        debug!("Drain complete on link {}", link.name);
        self.link_events.push_back(LinkEvent::Drained(link_id));
    }

    fn on_transfer(&mut self, channel: u16, transfer: Transfer, payload: Bytes) -> Result<()> {
        let session_id = self.session_for_channel(channel)?;
        if lookup(&self.sessions, session_id)?.incoming_remaining == 0 {
            let error = EngineError::protocol("transfer beyond the incoming window");
            let condition = ErrorCondition::new(conditions::WINDOW_VIOLATION, error.to_string());
            return Err(self.fail_with(error, Some(condition)));
        }
        let session = lookup_mut(&mut self.sessions, session_id)?;
        session.next_incoming_id = session.next_incoming_id.wrapping_add(1);
        session.incoming_remaining -= 1;
        let replenish = session.incoming_remaining <= session.incoming_window / 2;

        let link_id = self.link_for_handle(session_id, transfer.handle)?;
        let link = lookup_mut(&mut self.links, link_id)?;
        if link.is_sender() {
            return Err(EngineError::protocol(format!(
                "transfer received on sending link {}",
                link.name
            )));
        }

        if link.endpoint.local_state() != EndpointState::Closed {
            self.read_transfer(session_id, link_id, transfer, payload)?;
        }

        if replenish {
            let session = lookup_mut(&mut self.sessions, session_id)?;
            session.incoming_remaining = session.incoming_window;
            self.send_session_flow(session_id)?;
        }
        Ok(())
    }

    fn read_transfer(
        &mut self,
        session_id: SessionId,
        link_id: LinkId,
        transfer: Transfer,
        payload: Bytes,
    ) -> Result<()> {
        let link = lookup_mut(&mut self.links, link_id)?;
        let delivery_id = match link.current {
            Some(delivery_id) => delivery_id,
            None => {
                let wire_id = transfer.delivery_id.ok_or_else(|| {
                    EngineError::protocol("first transfer of a delivery has no delivery-id")
                })?;
                let delivery_id = DeliveryId(self.next_id);
                self.next_id += 1;

                if !link.credit.try_consume() {
                    warn!("Transfer on link {} arrived without credit", link.name);
                }
                link.delivery_count = link.delivery_count.wrapping_add(1);
                link.current = Some(delivery_id);
                link.deliveries.insert(delivery_id);

                let mut delivery = Delivery::new(delivery_id, link_id);
                delivery.wire_id = Some(wire_id);
                delivery.tag = transfer.delivery_tag.clone();
                delivery.message_format = transfer.message_format.unwrap_or(0);
                delivery.started = true;
                self.deliveries.insert(delivery_id, delivery);
                if transfer.settled != Some(true) {
                    lookup_mut(&mut self.sessions, session_id)?
                        .incoming_unsettled
                        .insert(wire_id, delivery_id);
                }
                delivery_id
            }
        };

        let delivery = lookup_mut(&mut self.deliveries, delivery_id)?;
        if transfer.state.is_some() {
            delivery.remote_state = transfer.state;
        }
        let settled = transfer.settled == Some(true);
        if settled {
            delivery.remotely_settled = true;
        }
        let wire_id = delivery.wire_id;

        if transfer.aborted {
            delivery.aborted = true;
            delivery.partial = false;
            delivery.remotely_settled = true;
            delivery.payload.clear();
            lookup_mut(&mut self.links, link_id)?.current = None;
            if let Some(wire_id) = wire_id {
                lookup_mut(&mut self.sessions, session_id)?
                    .incoming_unsettled
                    .remove(&wire_id);
            }
            self.delivery_events
                .push_back(DeliveryEvent::Aborted(delivery_id));
        } else {
            delivery.payload.extend_from_slice(&payload);
            delivery.partial = transfer.more;
            if !transfer.more {
                delivery.complete = true;
                lookup_mut(&mut self.links, link_id)?.current = None;
            }
            if settled {
                if let Some(wire_id) = wire_id {
                    lookup_mut(&mut self.sessions, session_id)?
                        .incoming_unsettled
                        .remove(&wire_id);
                }
            }
            self.delivery_events.push_back(DeliveryEvent::Read(delivery_id));
        }

        self.check_drained(link_id);
        Ok(())
    }

    fn on_disposition(&mut self, channel: u16, disposition: Disposition) -> Result<()> {
        let session_id = self.session_for_channel(channel)?;
        let session = lookup_mut(&mut self.sessions, session_id)?;
        let last = disposition.last.unwrap_or(disposition.first);
        if last < disposition.first {
            return Ok(());
        }
        // A disposition from the receiving side concerns what we sent.
        let unsettled = match disposition.role {
            Role::Receiver => &mut session.outgoing_unsettled,
            Role::Sender => &mut session.incoming_unsettled,
        };
        let matched: Vec<(u32, DeliveryId)> = unsettled
            .range(disposition.first..=last)
            .map(|(wire_id, delivery)| (*wire_id, *delivery))
            .collect();
        if disposition.settled {
            for (wire_id, _) in &matched {
                unsettled.remove(wire_id);
            }
        }

        for (_, delivery_id) in matched {
            let Some(delivery) = self.deliveries.get_mut(&delivery_id) else {
                continue;
            };
            if disposition.state.is_some() {
                delivery.remote_state = disposition.state.clone();
            }
            if disposition.settled {
                delivery.remotely_settled = true;
            }
            self.delivery_events
                .push_back(DeliveryEvent::Updated(delivery_id));
        }
        Ok(())
    }
}
