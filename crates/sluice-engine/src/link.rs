//! Links attached to a session.

use std::collections::{BTreeSet, VecDeque};

use bytes::Bytes;
use sluice_codec::{ReceiverSettleMode, Role, SenderSettleMode, Source, Target, Transfer};

use crate::delivery::DeliveryId;
use crate::endpoint::{Endpoint, Lifecycle};
use crate::flow_control::LinkCredit;
use crate::session::SessionId;
use crate::timer::TimerId;

/// Stable key for a link in the engine's tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub(crate) u64);

impl LinkId {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// A Transfer waiting for session window.
#[derive(Debug)]
pub(crate) struct PendingTransfer {
    pub(crate) delivery: DeliveryId,
    pub(crate) transfer: Transfer,
    pub(crate) payload: Bytes,
}

/// A sender or receiver link.
#[derive(Debug)]
pub struct Link {
    pub(crate) id: LinkId,
    pub(crate) session: SessionId,
    pub(crate) name: String,
    pub(crate) role: Role,
    pub(crate) endpoint: Endpoint,
    pub(crate) local_handle: Option<u32>,
    pub(crate) remote_handle: Option<u32>,
    pub(crate) source: Option<Source>,
    pub(crate) target: Option<Target>,
    pub(crate) remote_source: Option<Source>,
    pub(crate) remote_target: Option<Target>,
    pub(crate) snd_settle_mode: SenderSettleMode,
    pub(crate) rcv_settle_mode: ReceiverSettleMode,
    pub(crate) max_message_size: Option<u64>,
    pub(crate) delivery_count: u32,
    pub(crate) credit: LinkCredit,
    /// Sender: the receiver asked for a drain. Receiver: a drain is in progress.
    pub(crate) drain: bool,
    pub(crate) drain_timer: Option<TimerId>,
    /// The delivery currently being written or read.
    pub(crate) current: Option<DeliveryId>,
    pub(crate) next_tag: u64,
    pub(crate) pending: VecDeque<PendingTransfer>,
    pub(crate) deliveries: BTreeSet<DeliveryId>,
    /// Closed locally with `closed=false`.
    pub(crate) detach_only: bool,
    pub(crate) linked_resource: Option<u64>,
}

impl Link {
    pub(crate) fn new(id: LinkId, session: SessionId, name: String, role: Role) -> Self {
        Self {
            id,
            session,
            name,
            role,
            endpoint: Endpoint::default(),
            local_handle: None,
            remote_handle: None,
            source: None,
            target: None,
            remote_source: None,
            remote_target: None,
            snd_settle_mode: SenderSettleMode::default(),
            rcv_settle_mode: ReceiverSettleMode::default(),
            max_message_size: None,
            delivery_count: 0,
            credit: LinkCredit::default(),
            drain: false,
            drain_timer: None,
            current: None,
            next_tag: 0,
            pending: VecDeque::new(),
            deliveries: BTreeSet::new(),
            detach_only: false,
            linked_resource: None,
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_sender(&self) -> bool {
        self.role.is_sender()
    }

    pub fn handle(&self) -> Option<u32> {
        self.local_handle
    }

    pub fn remote_handle(&self) -> Option<u32> {
        self.remote_handle
    }

    pub fn source(&self) -> Option<&Source> {
        self.source.as_ref()
    }

    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    pub fn remote_source(&self) -> Option<&Source> {
        self.remote_source.as_ref()
    }

    pub fn remote_target(&self) -> Option<&Target> {
        self.remote_target.as_ref()
    }

    pub fn credit(&self) -> u32 {
        self.credit.available()
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn is_draining(&self) -> bool {
        self.drain
    }

    pub fn current_delivery(&self) -> Option<DeliveryId> {
        self.current
    }

    /// Transfer frames queued behind the session window.
    pub fn queued_frames(&self) -> usize {
        self.pending.len()
    }

    pub fn linked_resource(&self) -> Option<u64> {
        self.linked_resource
    }

    /// Open with credit to start a delivery.
    pub fn is_sendable(&self) -> bool {
        self.is_sender()
            && self.endpoint.is_open()
            && self.endpoint.open_sent()
            && self.credit.available() > 0
    }

    pub(crate) fn next_delivery_tag(&mut self) -> Bytes {
        let tag = self.next_tag;
        self.next_tag += 1;
        Bytes::copy_from_slice(&tag.to_be_bytes())
    }
}

impl Lifecycle for Link {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn endpoint_mut(&mut self) -> &mut Endpoint {
        &mut self.endpoint
    }
}
