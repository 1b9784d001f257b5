//! Engine configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::{default_allocator, BufferAllocator};
use crate::error::{EngineError, Result};

/// Smallest frame size a peer may negotiate.
pub const MIN_MAX_FRAME_SIZE: u32 = 512;

/// Default session incoming window, in frames.
pub const DEFAULT_INCOMING_WINDOW: u32 = 2048;

/// Engine configuration
#[derive(Clone)]
pub struct EngineConfiguration {
    /// Largest frame this engine accepts and advertises
    pub max_frame_size: u32,
    /// Allocator for output and payload buffers
    pub buffer_allocator: Arc<dyn BufferAllocator>,
    /// Container id sent in Open
    pub container_id: String,
    /// Hostname sent in Open
    pub hostname: Option<String>,
    /// Highest channel number this engine will use
    pub channel_max: u16,
    /// Close the connection when nothing arrives for this long
    pub idle_timeout: Option<Duration>,
    /// Session incoming window, in frames
    pub incoming_window: u32,
    /// Session outgoing window, in frames
    pub outgoing_window: u32,
    /// Highest link handle per session
    pub handle_max: u32,
    /// Decode performatives incrementally as frame bytes arrive
    pub streaming_decode: bool,
}

impl fmt::Debug for EngineConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfiguration")
            .field("max_frame_size", &self.max_frame_size)
            .field("container_id", &self.container_id)
            .field("hostname", &self.hostname)
            .field("channel_max", &self.channel_max)
            .field("idle_timeout", &self.idle_timeout)
            .field("incoming_window", &self.incoming_window)
            .field("outgoing_window", &self.outgoing_window)
            .field("handle_max", &self.handle_max)
            .field("streaming_decode", &self.streaming_decode)
            .finish()
    }
}

impl Default for EngineConfiguration {
    fn default() -> Self {
        Self {
            max_frame_size: 65536,
            buffer_allocator: default_allocator(),
            container_id: "sluice".to_string(),
            hostname: None,
            channel_max: u16::MAX,
            idle_timeout: None,
            incoming_window: DEFAULT_INCOMING_WINDOW,
            outgoing_window: u32::MAX,
            handle_max: u32::MAX,
            streaming_decode: false,
        }
    }
}

impl EngineConfiguration {
    /// Create a builder for configuring an engine
    pub fn builder() -> EngineConfigurationBuilder {
        EngineConfigurationBuilder::new()
    }
}

/// Builder for [`EngineConfiguration`]
#[derive(Debug, Default)]
pub struct EngineConfigurationBuilder {
    config: EngineConfiguration,
}

impl EngineConfigurationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.config.max_frame_size = size;
        self
    }

    pub fn buffer_allocator(mut self, allocator: Arc<dyn BufferAllocator>) -> Self {
        self.config.buffer_allocator = allocator;
        self
    }

    pub fn container_id(mut self, container_id: impl Into<String>) -> Self {
        self.config.container_id = container_id.into();
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.config.hostname = Some(hostname.into());
        self
    }

    pub fn channel_max(mut self, channel_max: u16) -> Self {
        self.config.channel_max = channel_max;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    pub fn incoming_window(mut self, frames: u32) -> Self {
        self.config.incoming_window = frames;
        self
    }

    pub fn outgoing_window(mut self, frames: u32) -> Self {
        self.config.outgoing_window = frames;
        self
    }

    pub fn handle_max(mut self, handle_max: u32) -> Self {
        self.config.handle_max = handle_max;
        self
    }

    pub fn streaming_decode(mut self, enabled: bool) -> Self {
        self.config.streaming_decode = enabled;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<EngineConfiguration> {
        if self.config.max_frame_size < MIN_MAX_FRAME_SIZE {
            return Err(EngineError::illegal_state(format!(
                "max frame size {} is below the minimum of {}",
                self.config.max_frame_size, MIN_MAX_FRAME_SIZE
            )));
        }
        if self.config.incoming_window == 0 {
            return Err(EngineError::illegal_state("incoming window must be positive"));
        }
        if let Some(timeout) = self.config.idle_timeout {
            if timeout.as_millis() > u128::from(u32::MAX) {
                return Err(EngineError::illegal_state(
                    "idle timeout does not fit in 32 bits of milliseconds",
                ));
            }
        }
        Ok(self.config)
    }
}
