//! Events the engine raises for the application to poll.
//!
//! Each endpoint category has its own queue. Events name endpoints by id;
//! the application looks up whatever it associates with that id.

use crate::delivery::DeliveryId;
use crate::error::EngineError;
use crate::link::LinkId;
use crate::session::SessionId;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The peer's Open arrived.
    Opened,
    /// The peer's Close arrived.
    Closed,
    /// The peer began a session this side did not start.
    SessionRemotelyOpened(SessionId),
    /// The engine failed and refuses further work.
    Failed(EngineError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Opened(SessionId),
    Closed(SessionId),
    /// The peer attached a link this side did not start.
    LinkRemotelyOpened(LinkId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Opened(LinkId),
    /// Remote Detach with `closed` set.
    Closed(LinkId),
    /// Remote Detach without `closed`.
    Detached(LinkId),
    CreditUpdated(LinkId),
    /// The link went from unsendable to sendable.
    Sendable(LinkId),
    /// The receiver asked this sender to use or return its credit.
    DrainRequested(LinkId),
    /// A drain this receiver requested finished.
    Drained(LinkId),
    /// A drain this receiver requested ran past its deadline.
    DrainFailed(LinkId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryEvent {
    /// Payload arrived for an incoming delivery.
    Read(DeliveryId),
    /// The peer changed the state or settlement of a delivery.
    Updated(DeliveryId),
    /// An incoming delivery was aborted by its sender.
    Aborted(DeliveryId),
}
