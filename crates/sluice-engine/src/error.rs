//! Engine error types.

use sluice_codec::{DecodeError, ErrorCondition};

/// Errors raised by the protocol engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Frame of {size} bytes exceeds the maximum of {max}")]
    FrameSize { size: u32, max: u32 },

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Operation timed out: {0}")]
    OperationTimedOut(String),

    #[error("Remotely closed: {}", describe(.0))]
    RemotelyClosed(Option<ErrorCondition>),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("SASL negotiation failed: {0}")]
    Sasl(String),

    #[error("Engine failed: {0}")]
    EngineFailed(Box<EngineError>),
}

fn describe(condition: &Option<ErrorCondition>) -> String {
    match condition {
        Some(condition) => condition.to_string(),
        None => "no error condition".to_string(),
    }
}

impl EngineError {
    pub fn illegal_state(message: impl Into<String>) -> Self {
        EngineError::IllegalState(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        EngineError::Protocol(message.into())
    }

    /// Whether this error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::Decode(_)
            | EngineError::FrameSize { .. }
            | EngineError::Protocol(_)
            | EngineError::Sasl(_)
            | EngineError::EngineFailed(_) => true,
            EngineError::IllegalState(_)
            | EngineError::OperationTimedOut(_)
            | EngineError::RemotelyClosed(_) => false,
        }
    }

    /// The error that originally failed the engine.
    pub fn root_cause(&self) -> &EngineError {
        match self {
            EngineError::EngineFailed(cause) => cause.root_cause(),
            other => other,
        }
    }
}

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;
