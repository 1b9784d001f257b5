//! Deliveries on a link.

use bytes::{Bytes, BytesMut};
use sluice_codec::DeliveryState;

use crate::link::LinkId;

/// Stable key for a delivery in the engine's tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryId(pub(crate) u64);

impl DeliveryId {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// One message transfer attempt, incoming or outgoing.
#[derive(Debug)]
pub struct Delivery {
    pub(crate) id: DeliveryId,
    pub(crate) link: LinkId,
    /// Session scoped delivery-id, assigned when the first frame is sent
    /// or read.
    pub(crate) wire_id: Option<u32>,
    pub(crate) tag: Option<Bytes>,
    pub(crate) message_format: u32,
    pub(crate) local_state: Option<DeliveryState>,
    pub(crate) remote_state: Option<DeliveryState>,
    pub(crate) locally_settled: bool,
    pub(crate) remotely_settled: bool,
    pub(crate) aborted: bool,
    /// More frames are expected.
    pub(crate) partial: bool,
    /// The first frame has been queued (outgoing) or read (incoming).
    pub(crate) started: bool,
    /// The final frame has been queued or read.
    pub(crate) complete: bool,
    /// A local disposition waits for the remaining frames to go out.
    pub(crate) pending_disposition: bool,
    pub(crate) payload: BytesMut,
    pub(crate) linked_resource: Option<u64>,
}

impl Delivery {
    pub(crate) fn new(id: DeliveryId, link: LinkId) -> Self {
        Self {
            id,
            link,
            wire_id: None,
            tag: None,
            message_format: 0,
            local_state: None,
            remote_state: None,
            locally_settled: false,
            remotely_settled: false,
            aborted: false,
            partial: false,
            started: false,
            complete: false,
            pending_disposition: false,
            payload: BytesMut::new(),
            linked_resource: None,
        }
    }

    pub fn id(&self) -> DeliveryId {
        self.id
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn delivery_id(&self) -> Option<u32> {
        self.wire_id
    }

    pub fn tag(&self) -> Option<&Bytes> {
        self.tag.as_ref()
    }

    pub fn message_format(&self) -> u32 {
        self.message_format
    }

    pub fn local_state(&self) -> Option<&DeliveryState> {
        self.local_state.as_ref()
    }

    pub fn remote_state(&self) -> Option<&DeliveryState> {
        self.remote_state.as_ref()
    }

    pub fn is_settled(&self) -> bool {
        self.locally_settled
    }

    pub fn is_remotely_settled(&self) -> bool {
        self.remotely_settled
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    /// Whether the final frame has been queued or read.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Bytes received and not yet read by the application.
    pub fn available(&self) -> usize {
        self.payload.len()
    }

    pub fn linked_resource(&self) -> Option<u64> {
        self.linked_resource
    }

    /// Neither aborted nor finished.
    pub(crate) fn is_open(&self) -> bool {
        !self.aborted && !self.complete
    }
}
