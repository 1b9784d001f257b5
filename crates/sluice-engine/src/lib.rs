//! Sans-I/O AMQP 1.0 protocol engine for Sluice.
//!
//! This crate provides:
//! - Frame parsing and writing over caller supplied bytes
//! - A handler chain between the wire and the engine core, with SASL
//!   client negotiation and frame tracing handlers
//! - Connection, session and link lifecycles with deferred opens
//! - Session windows, link credit, drain and delivery settlement
//! - Streamed message sends through [`StreamSendBuffer`]
//!
//! The engine never performs I/O or reads a clock. Callers feed bytes with
//! [`Engine::ingest`], collect bytes with [`Engine::take_output`] and drive
//! timers with [`Engine::tick`].

pub mod buffer;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod event;
pub mod flow_control;
pub mod frame;
pub mod link;
pub mod pipeline;
pub mod sasl;
pub mod session;
pub mod stream;
pub mod timer;

pub use buffer::{default_allocator, BufferAllocator, HeapAllocator};
pub use config::{EngineConfiguration, EngineConfigurationBuilder};
pub use connection::Connection;
pub use delivery::{Delivery, DeliveryId};
pub use endpoint::{Endpoint, EndpointState, Lifecycle};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use event::{ConnectionEvent, DeliveryEvent, LinkEvent, SessionEvent};
pub use flow_control::LinkCredit;
pub use frame::{write_frame, AmqpFrame, Frame, FrameParser, ProtocolHeader};
pub use link::{Link, LinkId};
pub use pipeline::{FrameHandler, HandlerContext, Pipeline, PipelineOutput, TracingHandler};
pub use sasl::{
    default_mechanisms, AnonymousMechanism, Credentials, ExternalMechanism, Mechanism,
    PlainMechanism, SaslClientHandler,
};
pub use session::{Session, SessionId};
pub use stream::{FlushStatus, StreamSendBuffer};
pub use timer::{TimerId, Timers};
