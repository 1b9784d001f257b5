//! Async tokio client for the Sluice AMQP 1.0 engine.
//!
//! This crate provides:
//! - A connection driver that runs the sans-I/O engine over any
//!   `AsyncRead + AsyncWrite` transport
//! - Sessions with streaming senders and receivers
//! - Credit window management, drain with timeout and delivery tracking
//! - Options loadable from JSON configuration

pub mod connection;
mod driver;
pub mod error;
pub mod options;
pub mod receiver;
pub mod sender;

pub use connection::{ClientConnection, ClientSession};
pub use error::{ClientError, Result};
pub use options::{
    CreditWindowPolicy, OutputStreamOptions, StreamReceiverOptions, StreamSenderOptions,
};
pub use receiver::{StreamDelivery, StreamReceiver};
pub use sender::{StreamSender, StreamSenderMessage, Tracker};
