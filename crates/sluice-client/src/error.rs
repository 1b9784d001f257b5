//! Client error types.

use std::io;

use sluice_engine::EngineError;

/// Errors surfaced by the async client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("{0} is closed")]
    ResourceClosed(String),

    #[error("Delivery was aborted by the sender")]
    DeliveryAborted,

    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

impl ClientError {
    /// Whether the connection behind this error can no longer be used.
    pub fn is_fatal(&self) -> bool {
        match self {
            ClientError::Engine(err) => err.is_fatal(),
            ClientError::ConnectionFailed(_) => true,
            ClientError::ResourceClosed(_)
            | ClientError::DeliveryAborted
            | ClientError::Configuration(_) => false,
        }
    }

    /// Convert into an I/O error for stream style callers.
    ///
    /// A dead connection maps to `BrokenPipe`, everything else to `Other`.
    /// The client error stays reachable through `get_ref`.
    pub fn into_io(self) -> io::Error {
        let kind = if self.is_fatal() {
            io::ErrorKind::BrokenPipe
        } else {
            io::ErrorKind::Other
        };
        io::Error::new(kind, self)
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Configuration(err.to_string())
    }
}

impl From<ClientError> for io::Error {
    fn from(err: ClientError) -> Self {
        err.into_io()
    }
}

/// Result alias used throughout the client.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_engine_maps_to_broken_pipe() {
        let cause = EngineError::protocol("unknown channel 4");
        let err = ClientError::from(EngineError::EngineFailed(Box::new(cause)));
        let io = err.into_io();
        assert_eq!(io.kind(), io::ErrorKind::BrokenPipe);
        let inner = io
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<ClientError>())
            .unwrap();
        assert!(matches!(inner, ClientError::Engine(EngineError::EngineFailed(_))));
    }

    #[test]
    fn test_illegal_state_maps_to_other() {
        let err = ClientError::from(EngineError::illegal_state("double settle"));
        assert_eq!(err.into_io().kind(), io::ErrorKind::Other);
    }

    #[test]
    fn test_bad_json_is_configuration_error() {
        let err: ClientError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, ClientError::Configuration(_)));
        assert!(!err.is_fatal());
    }
}
