//! Sessions multiplexed over a connection.

use std::collections::{BTreeMap, VecDeque};

use crate::delivery::DeliveryId;
use crate::endpoint::{Endpoint, Lifecycle};
use crate::link::LinkId;

/// Stable key for a session in the engine's tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub(crate) u64);

impl SessionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// A session and its transfer windows.
#[derive(Debug)]
pub struct Session {
    pub(crate) id: SessionId,
    pub(crate) endpoint: Endpoint,
    pub(crate) local_channel: Option<u16>,
    pub(crate) remote_channel: Option<u16>,

    /// Outgoing transfer-id announced in our Begin.
    pub(crate) initial_outgoing_id: u32,
    pub(crate) next_outgoing_id: u32,
    pub(crate) outgoing_window: u32,
    /// Frames the peer will still accept.
    pub(crate) remote_incoming_window: u32,
    pub(crate) next_delivery_id: u32,

    pub(crate) next_incoming_id: u32,
    pub(crate) incoming_window: u32,
    /// Frames this side will still accept before re-advertising.
    pub(crate) incoming_remaining: u32,
    pub(crate) remote_outgoing_window: u32,

    pub(crate) handle_max: u32,
    pub(crate) remote_handle_max: u32,
    pub(crate) links: Vec<LinkId>,
    pub(crate) links_by_handle: BTreeMap<u32, LinkId>,
    pub(crate) links_by_remote_handle: BTreeMap<u32, LinkId>,
    /// Our outgoing deliveries the peer has not settled, by delivery-id.
    pub(crate) outgoing_unsettled: BTreeMap<u32, DeliveryId>,
    /// Incoming deliveries not yet settled, by delivery-id.
    pub(crate) incoming_unsettled: BTreeMap<u32, DeliveryId>,
    /// Links with queued transfers, serviced front to back.
    pub(crate) blocked: VecDeque<LinkId>,
}

impl Session {
    pub(crate) fn new(id: SessionId, incoming_window: u32, outgoing_window: u32, handle_max: u32) -> Self {
        Self {
            id,
            endpoint: Endpoint::default(),
            local_channel: None,
            remote_channel: None,
            initial_outgoing_id: 0,
            next_outgoing_id: 0,
            outgoing_window,
            remote_incoming_window: 0,
            next_delivery_id: 0,
            next_incoming_id: 0,
            incoming_window,
            incoming_remaining: incoming_window,
            remote_outgoing_window: 0,
            handle_max,
            remote_handle_max: u32::MAX,
            links: Vec::new(),
            links_by_handle: BTreeMap::new(),
            links_by_remote_handle: BTreeMap::new(),
            outgoing_unsettled: BTreeMap::new(),
            incoming_unsettled: BTreeMap::new(),
            blocked: VecDeque::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn channel(&self) -> Option<u16> {
        self.local_channel
    }

    pub fn remote_channel(&self) -> Option<u16> {
        self.remote_channel
    }

    pub fn links(&self) -> &[LinkId] {
        &self.links
    }

    pub fn remote_incoming_window(&self) -> u32 {
        self.remote_incoming_window
    }

    pub fn next_outgoing_id(&self) -> u32 {
        self.next_outgoing_id
    }

    pub fn incoming_window(&self) -> u32 {
        self.incoming_remaining
    }

    /// Recomputes the peer's incoming window from a Flow. A peer that has
    /// not seen our Begin yet counts from our initial outgoing-id.
    pub(crate) fn update_remote_incoming_window(&mut self, next_incoming_id: Option<u32>, incoming_window: u32) {
        self.remote_incoming_window = next_incoming_id
            .unwrap_or(self.initial_outgoing_id)
            .wrapping_add(incoming_window)
            .wrapping_sub(self.next_outgoing_id);
    }

    /// Lowest handle not used by a local link.
    pub(crate) fn free_handle(&self) -> Option<u32> {
        let max = self.handle_max.min(self.remote_handle_max);
        let mut candidate = 0u32;
        for handle in self.links_by_handle.keys() {
            if *handle != candidate {
                break;
            }
            candidate = candidate.checked_add(1)?;
        }
        (candidate <= max).then_some(candidate)
    }
}

impl Lifecycle for Session {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn endpoint_mut(&mut self) -> &mut Endpoint {
        &mut self.endpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_free_handle() {
        let mut session = Session::new(SessionId(0), 10, 10, 3);
        assert_eq!(session.free_handle(), Some(0));
        session.links_by_handle.insert(0, LinkId(0));
        session.links_by_handle.insert(2, LinkId(2));
        assert_eq!(session.free_handle(), Some(1));
        session.links_by_handle.insert(1, LinkId(1));
        session.links_by_handle.insert(3, LinkId(3));
        assert_eq!(session.free_handle(), None);
    }

    #[test]
    fn test_flow_without_next_incoming_id_counts_from_initial_id() {
        let mut session = Session::new(SessionId(0), 10, 10, 3);
        session.initial_outgoing_id = 100;
        session.next_outgoing_id = 103;

        session.update_remote_incoming_window(None, 10);
        assert_eq!(session.remote_incoming_window(), 7);

        session.update_remote_incoming_window(Some(103), 10);
        assert_eq!(session.remote_incoming_window(), 10);
    }

    #[test]
    fn test_remote_window_wraps_around_transfer_ids() {
        let mut session = Session::new(SessionId(0), 10, 10, 3);
        session.initial_outgoing_id = u32::MAX - 1;
        session.next_outgoing_id = 1;

        session.update_remote_incoming_window(None, 5);
        assert_eq!(session.remote_incoming_window(), 2);
    }
}
