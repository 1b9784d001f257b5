//! Connection level state.

use std::collections::BTreeMap;
use std::time::Duration;

use sluice_codec::Open;

use crate::config::MIN_MAX_FRAME_SIZE;
use crate::endpoint::{Endpoint, Lifecycle};
use crate::session::SessionId;

/// The connection endpoint and its channel tables.
#[derive(Debug)]
pub struct Connection {
    pub(crate) endpoint: Endpoint,
    pub(crate) header_sent: bool,
    pub(crate) header_received: bool,
    pub(crate) remote_open: Option<Open>,
    pub(crate) channel_max: u16,
    pub(crate) sessions_by_channel: BTreeMap<u16, SessionId>,
    pub(crate) sessions_by_remote_channel: BTreeMap<u16, SessionId>,
}

impl Connection {
    pub(crate) fn new(channel_max: u16) -> Self {
        Self {
            endpoint: Endpoint::default(),
            header_sent: false,
            header_received: false,
            remote_open: None,
            channel_max,
            sessions_by_channel: BTreeMap::new(),
            sessions_by_remote_channel: BTreeMap::new(),
        }
    }

    pub fn remote_open(&self) -> Option<&Open> {
        self.remote_open.as_ref()
    }

    pub fn remote_container_id(&self) -> Option<&str> {
        self.remote_open.as_ref().map(|open| open.container_id.as_str())
    }

    /// Largest frame the peer accepts; 512 until its Open arrives.
    pub fn remote_max_frame_size(&self) -> u32 {
        self.remote_open
            .as_ref()
            .map(|open| open.max_frame_size.max(MIN_MAX_FRAME_SIZE))
            .unwrap_or(MIN_MAX_FRAME_SIZE)
    }

    pub fn remote_idle_timeout(&self) -> Option<Duration> {
        self.remote_open
            .as_ref()
            .and_then(|open| open.idle_timeout)
            .filter(|ms| *ms > 0)
            .map(|ms| Duration::from_millis(u64::from(ms)))
    }

    /// Lowest channel not used by a local session.
    pub(crate) fn free_channel(&self) -> Option<u16> {
        let remote_max = self
            .remote_open
            .as_ref()
            .map(|open| open.channel_max)
            .unwrap_or(u16::MAX);
        let max = self.channel_max.min(remote_max);
        let mut candidate = 0u16;
        for channel in self.sessions_by_channel.keys() {
            if *channel != candidate {
                break;
            }
            candidate = candidate.checked_add(1)?;
        }
        (candidate <= max).then_some(candidate)
    }
}

impl Lifecycle for Connection {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn endpoint_mut(&mut self) -> &mut Endpoint {
        &mut self.endpoint
    }
}
