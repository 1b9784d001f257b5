//! Outgoing deliveries, credit and dispositions.

use std::time::Instant;

use bytes::Bytes;
use sluice_codec::{encoded_size, DeliveryState, Disposition, Flow, Performative, Transfer};
use tracing::{debug, trace};

use super::{lookup, lookup_mut, Engine, TimerAction};
use crate::delivery::{Delivery, DeliveryId};
use crate::endpoint::EndpointState;
use crate::error::{EngineError, Result};
use crate::frame::{AmqpFrame, Frame, FRAME_HEADER_SIZE};
use crate::link::{LinkId, PendingTransfer};
use crate::session::SessionId;

impl Engine {
    // ---- sender side ----

    /// Whether a new delivery could be started on the link right now.
    pub fn is_sendable(&self, link: LinkId) -> bool {
        self.failure.is_none() && self.links.get(&link).is_some_and(|link| link.is_sendable())
    }

    /// The sender's in-progress delivery, starting one if there is none.
    pub fn current_delivery(&mut self, link_id: LinkId) -> Result<DeliveryId> {
        self.check_failed()?;
        let link = lookup(&self.links, link_id)?;
        if let Some(current) = link.current {
            return Ok(current);
        }
        self.start_delivery(link_id)
    }

    /// Start a new delivery on a sender.
    ///
    /// A current delivery that never put bytes on the link is discarded and
    /// replaced.
    pub fn next_delivery(&mut self, link_id: LinkId) -> Result<DeliveryId> {
        self.check_failed()?;
        let link = lookup(&self.links, link_id)?;
        if let Some(current) = link.current {
            match self.deliveries.get(&current) {
                Some(delivery) if delivery.is_open() && delivery.started => {
                    return Err(EngineError::illegal_state(
                        "previous delivery on this link is still in progress",
                    ));
                }
                Some(delivery) if delivery.is_open() => {
                    self.deliveries.remove(&current);
                    let link = lookup_mut(&mut self.links, link_id)?;
                    link.deliveries.remove(&current);
                    link.current = None;
                }
                _ => {}
            }
        }
        self.start_delivery(link_id)
    }

    fn start_delivery(&mut self, link_id: LinkId) -> Result<DeliveryId> {
        let link = lookup(&self.links, link_id)?;
        if !link.is_sender() {
            return Err(EngineError::illegal_state("receivers do not start deliveries"));
        }
        if link.endpoint.local_state() == EndpointState::Closed {
            return Err(EngineError::illegal_state("link is closed"));
        }
        let id = DeliveryId(self.allocate_id());
        let link = lookup_mut(&mut self.links, link_id)?;
        link.current = Some(id);
        link.deliveries.insert(id);
        self.deliveries.insert(id, Delivery::new(id, link_id));
        Ok(id)
    }

    pub fn set_delivery_tag(&mut self, delivery_id: DeliveryId, tag: Bytes) -> Result<()> {
        let delivery = self.unstarted(delivery_id)?;
        delivery.tag = Some(tag);
        Ok(())
    }

    pub fn set_message_format(&mut self, delivery_id: DeliveryId, format: u32) -> Result<()> {
        let delivery = self.unstarted(delivery_id)?;
        delivery.message_format = format;
        Ok(())
    }

    fn unstarted(&mut self, delivery_id: DeliveryId) -> Result<&mut Delivery> {
        self.check_failed()?;
        let delivery = lookup_mut(&mut self.deliveries, delivery_id)?;
        if delivery.started {
            return Err(EngineError::illegal_state(
                "delivery already started transferring",
            ));
        }
        Ok(delivery)
    }

    /// Queue payload bytes for a delivery, splitting them into frames that
    /// fit the peer's max frame size.
    ///
    /// The first bytes of a delivery consume one unit of link credit. With
    /// `complete` the last frame carries `more=false`, even for an empty
    /// payload.
    pub fn write_bytes(
        &mut self,
        delivery_id: DeliveryId,
        payload: impl Into<Bytes>,
        complete: bool,
    ) -> Result<()> {
        self.check_failed()?;
        let payload = payload.into();
        let delivery = lookup(&self.deliveries, delivery_id)?;
        if delivery.aborted {
            return Err(EngineError::illegal_state("delivery was aborted"));
        }
        if delivery.complete {
            return Err(EngineError::illegal_state("delivery is already complete"));
        }
        let link_id = delivery.link;
        let first = !delivery.started;
        if payload.is_empty() && !complete {
            return Ok(());
        }

        let link = lookup_mut(&mut self.links, link_id)?;
        if !link.is_sender() {
            return Err(EngineError::illegal_state("cannot write to a receiver"));
        }
        if link.endpoint.local_state() != EndpointState::Active
            || !link.endpoint.open_sent()
            || link.endpoint.remote_state() == EndpointState::Closed
        {
            return Err(EngineError::illegal_state("link is not open for sending"));
        }
        if first {
            if !link.credit.try_consume() {
                return Err(EngineError::illegal_state("link has no credit"));
            }
            link.delivery_count = link.delivery_count.wrapping_add(1);
        }
        let handle = link
            .local_handle
            .ok_or_else(|| EngineError::illegal_state("link has no handle"))?;
        let session_id = link.session;
        let untagged = self
            .deliveries
            .get(&delivery_id)
            .is_some_and(|delivery| delivery.tag.is_none());
        let generated_tag = (first && untagged).then(|| link.next_delivery_tag());

        let delivery = lookup_mut(&mut self.deliveries, delivery_id)?;
        if let Some(tag) = generated_tag {
            delivery.tag = Some(tag);
        }
        delivery.started = true;
        delivery.partial = !complete;
        if complete {
            delivery.complete = true;
        }

        let first_template = Transfer {
            handle,
            delivery_tag: delivery.tag.clone(),
            message_format: Some(delivery.message_format),
            settled: Some(delivery.locally_settled),
            state: delivery.local_state.clone(),
            ..Transfer::default()
        };
        let continuation = Transfer {
            handle,
            ..Transfer::default()
        };
        let max_frame = self.connection.remote_max_frame_size() as usize;
        let frames = split_payload(
            delivery_id,
            payload,
            complete,
            first.then_some(first_template),
            continuation,
            max_frame,
        );

        let link = lookup_mut(&mut self.links, link_id)?;
        trace!("Queued {} transfer frames on {}", frames.len(), link.name);
        link.pending.extend(frames);
        if complete && link.current == Some(delivery_id) {
            link.current = None;
        }
        self.enqueue_link(session_id, link_id);
        self.service_session(session_id)
    }

    /// Abort a delivery that has not completed.
    ///
    /// A delivery with nothing written is left untouched and stays current.
    /// If no frame reached the wire yet the credit it consumed is returned.
    /// Otherwise frames still queued are dropped and a settled, aborted
    /// Transfer follows what was sent. Settled deliveries cannot be aborted.
    pub fn abort(&mut self, delivery_id: DeliveryId) -> Result<()> {
        self.check_failed()?;
        let link_id = lookup(&self.deliveries, delivery_id)?.link;
        if !lookup(&self.links, link_id)?.is_sender() {
            return Err(EngineError::illegal_state("receivers cannot abort deliveries"));
        }
        let delivery = lookup_mut(&mut self.deliveries, delivery_id)?;
        if delivery.aborted || !delivery.started {
            return Ok(());
        }
        if delivery.complete {
            return Err(EngineError::illegal_state(
                "cannot abort a delivery that has completed",
            ));
        }
        if delivery.locally_settled {
            return Err(EngineError::illegal_state(
                "cannot abort a delivery that is already settled",
            ));
        }
        delivery.aborted = true;
        delivery.partial = false;
        let wire_id = delivery.wire_id;
        let tag = delivery.tag.clone();

        let link = lookup_mut(&mut self.links, link_id)?;
        if link.current == Some(delivery_id) {
            link.current = None;
        }
        link.pending.retain(|pending| pending.delivery != delivery_id);
        let session_id = link.session;
        let handle = link.local_handle;

        let Some(wire_id) = wire_id else {
            debug!("Aborting unsent delivery on {}", link.name);
            link.credit.grant(1);
            link.delivery_count = link.delivery_count.wrapping_sub(1);
            if link.pending.is_empty() {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.blocked.retain(|id| *id != link_id);
                }
            }
            return Ok(());
        };

        let Some(handle) = handle else {
            return Ok(());
        };
        link.pending.push_back(PendingTransfer {
            delivery: delivery_id,
            transfer: Transfer {
                handle,
                delivery_id: Some(wire_id),
                delivery_tag: tag,
                settled: Some(true),
                aborted: true,
                ..Transfer::default()
            },
            payload: Bytes::new(),
        });
        lookup_mut(&mut self.deliveries, delivery_id)?.locally_settled = true;
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.outgoing_unsettled.remove(&wire_id);
        }
        self.enqueue_link(session_id, link_id);
        self.service_session(session_id)
    }

    /// Answer a drain request: give up remaining credit and tell the
    /// receiver. Returns the credit that was discarded.
    pub fn drained(&mut self, link_id: LinkId) -> Result<u32> {
        self.check_failed()?;
        let link = lookup_mut(&mut self.links, link_id)?;
        if !link.is_sender() {
            return Err(EngineError::illegal_state("only senders answer a drain"));
        }
        if !link.drain {
            return Ok(0);
        }
        let discarded = link.credit.drain_all();
        link.delivery_count = link.delivery_count.wrapping_add(discarded);
        debug!("Drained {} credit on {}", discarded, link.name);
        self.send_link_flow(link_id, false)?;
        if let Some(link) = self.links.get_mut(&link_id) {
            link.drain = false;
        }
        Ok(discarded)
    }

    // ---- receiver side ----

    /// Grant more credit to the peer's sender.
    pub fn add_credit(&mut self, link_id: LinkId, credit: u32) -> Result<()> {
        self.check_failed()?;
        let link = lookup_mut(&mut self.links, link_id)?;
        if link.is_sender() {
            return Err(EngineError::illegal_state("senders cannot grant credit"));
        }
        if link.endpoint.is_closing() {
            return Err(EngineError::illegal_state("link is closing"));
        }
        if credit == 0 {
            return Ok(());
        }
        link.credit.grant(credit);
        self.send_link_flow(link_id, false)
    }

    /// Ask the sender to use or return all outstanding credit.
    ///
    /// Returns false when there is no credit to drain. With a deadline the
    /// drain fails through [`LinkEvent::DrainFailed`](crate::LinkEvent) once
    /// [`Engine::tick`] passes it.
    pub fn drain(&mut self, link_id: LinkId, deadline: Option<Instant>) -> Result<bool> {
        self.check_failed()?;
        let link = lookup_mut(&mut self.links, link_id)?;
        if link.is_sender() {
            return Err(EngineError::illegal_state("only receivers drain"));
        }
        if link.endpoint.is_closing() {
            return Err(EngineError::illegal_state("link is closing"));
        }
        if link.drain {
            return Err(EngineError::illegal_state("a drain is already in progress"));
        }
        if link.credit.available() == 0 {
            return Ok(false);
        }
        link.drain = true;
        if let Some(deadline) = deadline {
            let timer = self
                .timers
                .schedule(deadline, TimerAction::DrainTimeout(link_id));
            link.drain_timer = Some(timer);
        }
        self.send_link_flow(link_id, false)?;
        Ok(true)
    }

    /// Take the payload received so far.
    pub fn read_bytes(&mut self, delivery_id: DeliveryId) -> Result<Bytes> {
        self.check_failed()?;
        let delivery = lookup_mut(&mut self.deliveries, delivery_id)?;
        Ok(delivery.payload.split().freeze())
    }

    // ---- both sides ----

    /// Update the local state of a delivery and optionally settle it.
    ///
    /// Settling is final. Repeating the settled state, or settling again
    /// without a state, does nothing.
    pub fn disposition(
        &mut self,
        delivery_id: DeliveryId,
        state: Option<DeliveryState>,
        settle: bool,
    ) -> Result<()> {
        self.check_failed()?;
        let delivery = lookup_mut(&mut self.deliveries, delivery_id)?;
        if delivery.locally_settled {
            return match state {
                None => Ok(()),
                Some(state) if delivery.local_state.as_ref() == Some(&state) => Ok(()),
                Some(_) => Err(EngineError::illegal_state(
                    "delivery is already settled with a different state",
                )),
            };
        }
        if state.is_some() {
            delivery.local_state = state;
        }
        if settle {
            delivery.locally_settled = true;
        }
        let started = delivery.started;
        let emitted = delivery.wire_id.is_some();
        let wire_id = delivery.wire_id;
        let local_state = delivery.local_state.clone();
        let link_id = delivery.link;

        let link = lookup_mut(&mut self.links, link_id)?;
        let session_id = link.session;
        let sender = link.is_sender();
        if sender {
            if !started {
                // Rides on the first frame.
                return Ok(());
            }
            if !emitted {
                if let Some(first) = link
                    .pending
                    .iter_mut()
                    .find(|pending| pending.delivery == delivery_id)
                {
                    first.transfer.settled = Some(settle);
                    first.transfer.state = local_state;
                    return Ok(());
                }
            } else if link
                .pending
                .iter()
                .any(|pending| pending.delivery == delivery_id)
            {
                lookup_mut(&mut self.deliveries, delivery_id)?.pending_disposition = true;
                return Ok(());
            }
        }

        if settle {
            if let (Some(session), Some(wire_id)) = (self.sessions.get_mut(&session_id), wire_id) {
                if sender {
                    session.outgoing_unsettled.remove(&wire_id);
                } else {
                    session.incoming_unsettled.remove(&wire_id);
                }
            }
        }
        self.send_disposition(delivery_id)
    }

    pub fn settle(&mut self, delivery_id: DeliveryId) -> Result<()> {
        self.disposition(delivery_id, None, true)
    }

    /// Drop a settled delivery from the engine's tables.
    pub fn release_delivery(&mut self, delivery_id: DeliveryId) -> Result<()> {
        let Some(delivery) = self.deliveries.remove(&delivery_id) else {
            return Ok(());
        };
        if let Some(link) = self.links.get_mut(&delivery.link) {
            link.deliveries.remove(&delivery_id);
            if link.current == Some(delivery_id) {
                link.current = None;
            }
            link.pending.retain(|pending| pending.delivery != delivery_id);
            if let (Some(session), Some(wire_id)) =
                (self.sessions.get_mut(&link.session), delivery.wire_id)
            {
                session.outgoing_unsettled.remove(&wire_id);
                session.incoming_unsettled.remove(&wire_id);
            }
        }
        Ok(())
    }

    // ---- internals ----

    fn send_disposition(&mut self, delivery_id: DeliveryId) -> Result<()> {
        let delivery = lookup(&self.deliveries, delivery_id)?;
        let Some(first) = delivery.wire_id else {
            return Ok(());
        };
        if delivery.remotely_settled {
            return Ok(());
        }
        let link = lookup(&self.links, delivery.link)?;
        let Some(channel) = self.writable_channel(link.session) else {
            return Ok(());
        };
        let disposition = Disposition {
            role: link.role,
            first,
            last: None,
            settled: delivery.locally_settled,
            state: delivery.local_state.clone(),
            batchable: false,
        };
        self.send(channel, disposition)
    }

    pub(super) fn send_link_flow(&mut self, link_id: LinkId, echo: bool) -> Result<()> {
        let link = lookup(&self.links, link_id)?;
        if !link.endpoint.open_sent() || link.endpoint.close_sent() {
            return Ok(());
        }
        let Some(handle) = link.local_handle else {
            return Ok(());
        };
        let Some(channel) = self.writable_channel(link.session) else {
            return Ok(());
        };
        let session = lookup(&self.sessions, link.session)?;
        let flow = Flow {
            next_incoming_id: session.remote_channel.map(|_| session.next_incoming_id),
            incoming_window: session.incoming_remaining,
            next_outgoing_id: session.next_outgoing_id,
            outgoing_window: session.outgoing_window,
            handle: Some(handle),
            delivery_count: Some(link.delivery_count),
            link_credit: Some(link.credit.available()),
            available: None,
            drain: link.drain,
            echo,
            properties: None,
        };
        self.send(channel, flow)
    }

    pub(super) fn send_session_flow(&mut self, session_id: SessionId) -> Result<()> {
        let Some(channel) = self.writable_channel(session_id) else {
            return Ok(());
        };
        let session = lookup(&self.sessions, session_id)?;
        let flow = Flow {
            next_incoming_id: session.remote_channel.map(|_| session.next_incoming_id),
            incoming_window: session.incoming_remaining,
            next_outgoing_id: session.next_outgoing_id,
            outgoing_window: session.outgoing_window,
            ..Flow::default()
        };
        self.send(channel, flow)
    }

    fn enqueue_link(&mut self, session_id: SessionId, link_id: LinkId) {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            if !session.blocked.contains(&link_id) {
                session.blocked.push_back(link_id);
            }
        }
    }

    /// Emit queued transfers while the peer's incoming window allows.
    pub(super) fn service_session(&mut self, session_id: SessionId) -> Result<()> {
        loop {
            if self.writable_channel(session_id).is_none() {
                return Ok(());
            }
            let session = lookup_mut(&mut self.sessions, session_id)?;
            if session.remote_channel.is_none() || session.remote_incoming_window == 0 {
                return Ok(());
            }
            let Some(link_id) = session.blocked.front().copied() else {
                return Ok(());
            };
            let Some(link) = self.links.get_mut(&link_id) else {
                session.blocked.pop_front();
                continue;
            };
            let Some(pending) = link.pending.pop_front() else {
                session.blocked.pop_front();
                continue;
            };
            if link.pending.is_empty() {
                session.blocked.pop_front();
            }
            self.emit_transfer(session_id, pending)?;
        }
    }

    fn emit_transfer(&mut self, session_id: SessionId, pending: PendingTransfer) -> Result<()> {
        let PendingTransfer {
            delivery: delivery_id,
            mut transfer,
            payload,
        } = pending;
        let session = lookup_mut(&mut self.sessions, session_id)?;
        let Some(channel) = session.local_channel else {
            return Ok(());
        };
        let Some(delivery) = self.deliveries.get_mut(&delivery_id) else {
            return Ok(());
        };

        if delivery.wire_id.is_none() {
            let wire_id = session.next_delivery_id;
            session.next_delivery_id = session.next_delivery_id.wrapping_add(1);
            delivery.wire_id = Some(wire_id);
            transfer.delivery_id = Some(wire_id);
            if transfer.settled != Some(true) {
                session.outgoing_unsettled.insert(wire_id, delivery_id);
            }
        }
        session.next_outgoing_id = session.next_outgoing_id.wrapping_add(1);
        session.remote_incoming_window = session.remote_incoming_window.saturating_sub(1);

        let last_frame = !transfer.more || transfer.aborted;
        let disposition_owed = last_frame && !transfer.aborted && delivery.pending_disposition;
        if disposition_owed {
            delivery.pending_disposition = false;
        }
        let payload = (!payload.is_empty()).then_some(payload);
        let frame = AmqpFrame {
            channel,
            performative: Performative::Transfer(transfer),
            payload,
        };
        self.write(Frame::Amqp(frame))?;
        if disposition_owed {
            self.send_disposition(delivery_id)?;
        }
        Ok(())
    }
}

/// Cut a payload into frames no larger than `max_frame_size`.
///
/// The first frame's overhead is sized with the largest possible
/// delivery-id since the id is only assigned when the frame is sent.
fn split_payload(
    delivery: DeliveryId,
    mut payload: Bytes,
    complete: bool,
    first: Option<Transfer>,
    continuation: Transfer,
    max_frame_size: usize,
) -> Vec<PendingTransfer> {
    let mut frames = Vec::new();
    let mut first = first;
    loop {
        let mut transfer = first.take().unwrap_or_else(|| continuation.clone());
        let mut sizing = transfer.clone();
        if sizing.message_format.is_some() {
            sizing.delivery_id = Some(u32::MAX);
        }
        sizing.more = true;
        let overhead =
            FRAME_HEADER_SIZE + encoded_size(&Performative::Transfer(sizing).to_value());
        let room = max_frame_size.saturating_sub(overhead).max(1);

        let chunk = payload.split_to(room.min(payload.len()));
        let last = payload.is_empty();
        transfer.more = !(last && complete);
        frames.push(PendingTransfer {
            delivery,
            transfer,
            payload: chunk,
        });
        if last {
            return frames;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_template() -> Transfer {
        Transfer {
            handle: 0,
            delivery_tag: Some(Bytes::from_static(b"tag")),
            message_format: Some(0),
            settled: Some(false),
            ..Transfer::default()
        }
    }

    #[test]
    fn test_split_respects_frame_size() {
        let payload = Bytes::from(vec![7u8; 5000]);
        let frames = split_payload(
            DeliveryId(1),
            payload,
            true,
            Some(first_template()),
            Transfer::default(),
            512,
        );
        assert!(frames.len() > 9);
        let total: usize = frames.iter().map(|f| f.payload.len()).sum();
        assert_eq!(total, 5000);
        for frame in &frames {
            let mut sized = frame.transfer.clone();
            if sized.message_format.is_some() {
                sized.delivery_id = Some(u32::MAX);
            }
            let size = FRAME_HEADER_SIZE
                + encoded_size(&Performative::Transfer(sized).to_value())
                + frame.payload.len();
            assert!(size <= 512, "frame of {} bytes", size);
        }
        assert!(frames[..frames.len() - 1].iter().all(|f| f.transfer.more));
        assert!(!frames.last().unwrap().transfer.more);
        assert!(frames[0].transfer.delivery_tag.is_some());
        assert!(frames[1].transfer.delivery_tag.is_none());
    }

    #[test]
    fn test_empty_complete_write_is_one_frame() {
        let frames = split_payload(
            DeliveryId(1),
            Bytes::new(),
            true,
            None,
            Transfer::default(),
            512,
        );
        assert_eq!(frames.len(), 1);
        assert!(!frames[0].transfer.more);
        assert!(frames[0].payload.is_empty());
    }

    #[test]
    fn test_incomplete_write_keeps_more() {
        let frames = split_payload(
            DeliveryId(1),
            Bytes::from_static(b"abc"),
            false,
            Some(first_template()),
            Transfer::default(),
            512,
        );
        assert_eq!(frames.len(), 1);
        assert!(frames[0].transfer.more);
    }
}
