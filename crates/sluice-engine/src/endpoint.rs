//! Lifecycle shared by connections, sessions and links.

use sluice_codec::ErrorCondition;

use crate::error::{EngineError, Result};

/// One side's view of an endpoint. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum EndpointState {
    #[default]
    Idle,
    Active,
    Closed,
}

/// Local and remote lifecycle of a connection, session or link.
#[derive(Debug, Clone, Default)]
pub struct Endpoint {
    local: EndpointState,
    remote: EndpointState,
    local_error: Option<ErrorCondition>,
    remote_error: Option<ErrorCondition>,
    open_sent: bool,
    close_sent: bool,
}

impl Endpoint {
    pub fn local_state(&self) -> EndpointState {
        self.local
    }

    pub fn remote_state(&self) -> EndpointState {
        self.remote
    }

    pub fn local_error(&self) -> Option<&ErrorCondition> {
        self.local_error.as_ref()
    }

    pub fn remote_error(&self) -> Option<&ErrorCondition> {
        self.remote_error.as_ref()
    }

    /// Both sides active.
    pub fn is_open(&self) -> bool {
        self.local == EndpointState::Active && self.remote == EndpointState::Active
    }

    /// Either side closed.
    pub fn is_closing(&self) -> bool {
        self.local == EndpointState::Closed || self.remote == EndpointState::Closed
    }

    /// Both sides closed.
    pub fn is_fully_closed(&self) -> bool {
        self.local == EndpointState::Closed && self.remote == EndpointState::Closed
    }

    pub fn open_sent(&self) -> bool {
        self.open_sent
    }

    pub fn close_sent(&self) -> bool {
        self.close_sent
    }

    /// Opened locally but the opening performative is still owed. An
    /// endpoint closed before its open went out is never sent at all.
    pub fn needs_open(&self) -> bool {
        self.local == EndpointState::Active && !self.open_sent
    }

    /// Closed locally but the closing performative is still owed.
    pub fn needs_close(&self) -> bool {
        self.local == EndpointState::Closed && self.open_sent && !self.close_sent
    }

    pub(crate) fn open(&mut self) -> Result<()> {
        match self.local {
            EndpointState::Idle => {
                self.local = EndpointState::Active;
                Ok(())
            }
            EndpointState::Active => Ok(()),
            EndpointState::Closed => Err(EngineError::illegal_state(
                "endpoint cannot be reopened once closed",
            )),
        }
    }

    /// Returns false when the endpoint was already closed locally.
    pub(crate) fn close(&mut self, error: Option<ErrorCondition>) -> bool {
        if self.local == EndpointState::Closed {
            return false;
        }
        self.local = EndpointState::Closed;
        self.local_error = error;
        true
    }

    /// Close without ever sending a closing performative; the parent's
    /// closing performative covers it.
    pub(crate) fn close_silently(&mut self) {
        self.local = EndpointState::Closed;
        self.close_sent = true;
    }

    pub(crate) fn mark_open_sent(&mut self) {
        self.open_sent = true;
    }

    pub(crate) fn mark_close_sent(&mut self) {
        self.close_sent = true;
    }

    pub(crate) fn remote_opened(&mut self) -> bool {
        if self.remote != EndpointState::Idle {
            return false;
        }
        self.remote = EndpointState::Active;
        true
    }

    pub(crate) fn remote_closed(&mut self, error: Option<ErrorCondition>) -> bool {
        if self.remote == EndpointState::Closed {
            return false;
        }
        self.remote = EndpointState::Closed;
        self.remote_error = error;
        true
    }
}

/// Anything with an [`Endpoint`] lifecycle.
pub trait Lifecycle {
    fn endpoint(&self) -> &Endpoint;

    fn endpoint_mut(&mut self) -> &mut Endpoint;

    fn local_state(&self) -> EndpointState {
        self.endpoint().local_state()
    }

    fn remote_state(&self) -> EndpointState {
        self.endpoint().remote_state()
    }

    fn is_open(&self) -> bool {
        self.endpoint().is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_state_moves_forward_only() {
        let mut endpoint = Endpoint::default();
        endpoint.open().unwrap();
        endpoint.open().unwrap();
        assert!(endpoint.close(None));
        assert!(!endpoint.close(None));
        assert!(matches!(
            endpoint.open(),
            Err(EngineError::IllegalState(_))
        ));
        assert_eq!(endpoint.local_state(), EndpointState::Closed);
    }

    #[test]
    fn test_open_and_close_owed() {
        let mut endpoint = Endpoint::default();
        assert!(!endpoint.needs_open());
        endpoint.open().unwrap();
        assert!(endpoint.needs_open());
        endpoint.mark_open_sent();
        endpoint.close(None);
        assert!(endpoint.needs_close());
        endpoint.mark_close_sent();
        assert!(!endpoint.needs_close());
    }

    #[test]
    fn test_close_before_open_sent_owes_nothing() {
        let mut endpoint = Endpoint::default();
        endpoint.open().unwrap();
        endpoint.close(None);
        assert!(!endpoint.needs_close());
    }

    #[test]
    fn test_remote_transitions() {
        let mut endpoint = Endpoint::default();
        assert!(endpoint.remote_opened());
        assert!(!endpoint.remote_opened());
        endpoint.open().unwrap();
        assert!(endpoint.is_open());
        let error = ErrorCondition::new("amqp:internal-error", "boom");
        assert!(endpoint.remote_closed(Some(error.clone())));
        assert!(endpoint.is_closing());
        assert!(!endpoint.is_fully_closed());
        assert_eq!(endpoint.remote_error(), Some(&error));
    }
}
