//! Handler chain between the wire and the engine core.
//!
//! Handler 0 sits next to the wire. Reads travel from the wire towards the
//! core, writes travel from the core towards the wire. A handler may forward
//! an event, replace it, fire events in the opposite direction, or drop it.

use std::collections::VecDeque;

use tracing::{trace, warn};

use crate::error::{EngineError, Result};
use crate::frame::Frame;

/// A handler that intercepts frames flowing through the engine.
pub trait FrameHandler: Send {
    fn name(&self) -> &'static str;

    /// Called for each frame read from the wire.
    fn handle_read(&mut self, ctx: &mut HandlerContext, frame: Frame) -> Result<()> {
        ctx.fire_read(frame);
        Ok(())
    }

    /// Called for each frame the engine writes.
    fn handle_write(&mut self, ctx: &mut HandlerContext, frame: Frame) -> Result<()> {
        ctx.fire_write(frame);
        Ok(())
    }

    /// Called once when the engine fails.
    fn handle_error(&mut self, _error: &EngineError) {}
}

/// Collects the events a handler fires while handling one frame.
#[derive(Debug, Default)]
pub struct HandlerContext {
    reads: Vec<Frame>,
    writes: Vec<Frame>,
}

impl HandlerContext {
    /// Pass a frame on towards the engine core.
    pub fn fire_read(&mut self, frame: Frame) {
        self.reads.push(frame);
    }

    /// Pass a frame on towards the wire.
    pub fn fire_write(&mut self, frame: Frame) {
        self.writes.push(frame);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Deliver to the handler at this index, or the core past the end.
    Read(usize),
    /// Deliver to the handler below this index, or the wire at zero.
    Write(usize),
}

/// Frames that made it through the chain.
#[derive(Debug, Default)]
pub struct PipelineOutput {
    pub to_engine: Vec<Frame>,
    pub to_wire: Vec<Frame>,
}

/// An ordered chain of handlers.
#[derive(Default)]
pub struct Pipeline {
    handlers: Vec<Box<dyn FrameHandler>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler at the core end of the chain.
    pub fn add_last(&mut self, handler: Box<dyn FrameHandler>) {
        self.handlers.push(handler);
    }

    /// Add a handler at the wire end of the chain.
    pub fn add_first(&mut self, handler: Box<dyn FrameHandler>) {
        self.handlers.insert(0, handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Run a frame read from the wire through the chain.
    pub fn read(&mut self, frame: Frame) -> Result<PipelineOutput> {
        self.run(Direction::Read(0), frame)
    }

    /// Run a frame written by the core through the chain.
    pub fn write(&mut self, frame: Frame) -> Result<PipelineOutput> {
        let top = self.handlers.len();
        self.run(Direction::Write(top), frame)
    }

    /// Notify every handler, wire end first.
    pub fn fire_error(&mut self, error: &EngineError) {
        for handler in &mut self.handlers {
            handler.handle_error(error);
        }
    }

    fn run(&mut self, start: Direction, frame: Frame) -> Result<PipelineOutput> {
        let mut output = PipelineOutput::default();
        let mut queue = VecDeque::from([(start, frame)]);

        while let Some((direction, frame)) = queue.pop_front() {
            let mut ctx = HandlerContext::default();
            let index = match direction {
                Direction::Read(index) if index == self.handlers.len() => {
                    output.to_engine.push(frame);
                    continue;
                }
                Direction::Write(0) => {
                    output.to_wire.push(frame);
                    continue;
                }
                Direction::Read(index) => {
                    self.handlers[index].handle_read(&mut ctx, frame)?;
                    index
                }
                Direction::Write(index) => {
                    let index = index - 1;
                    self.handlers[index].handle_write(&mut ctx, frame)?;
                    index
                }
            };
            queue.extend(ctx.reads.into_iter().map(|f| (Direction::Read(index + 1), f)));
            queue.extend(ctx.writes.into_iter().map(|f| (Direction::Write(index), f)));
        }
        Ok(output)
    }
}

/// Logs every frame passing through the chain.
#[derive(Debug, Default)]
pub struct TracingHandler;

impl FrameHandler for TracingHandler {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn handle_read(&mut self, ctx: &mut HandlerContext, frame: Frame) -> Result<()> {
        trace!("RECV: {:?}", frame);
        ctx.fire_read(frame);
        Ok(())
    }

    fn handle_write(&mut self, ctx: &mut HandlerContext, frame: Frame) -> Result<()> {
        trace!("SENT: {:?}", frame);
        ctx.fire_write(frame);
        Ok(())
    }

    fn handle_error(&mut self, error: &EngineError) {
        warn!("Engine failed: {}", error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ProtocolHeader;

    /// Answers every read with a heartbeat and swallows the read.
    struct Echo;

    impl FrameHandler for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn handle_read(&mut self, ctx: &mut HandlerContext, _frame: Frame) -> Result<()> {
            ctx.fire_write(Frame::Empty);
            Ok(())
        }
    }

    /// Rewrites AMQP headers into SASL headers on the way out.
    struct Rewrite;

    impl FrameHandler for Rewrite {
        fn name(&self) -> &'static str {
            "rewrite"
        }

        fn handle_write(&mut self, ctx: &mut HandlerContext, frame: Frame) -> Result<()> {
            match frame {
                Frame::Header(ProtocolHeader::Amqp) => {
                    ctx.fire_write(Frame::Header(ProtocolHeader::Sasl))
                }
                other => ctx.fire_write(other),
            }
            Ok(())
        }
    }

    struct Failing;

    impl FrameHandler for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn handle_read(&mut self, _ctx: &mut HandlerContext, _frame: Frame) -> Result<()> {
            Err(EngineError::Sasl("rejected".into()))
        }
    }

    #[test]
    fn test_empty_pipeline_passes_through() {
        let mut pipeline = Pipeline::new();
        let out = pipeline.read(Frame::Empty).unwrap();
        assert_eq!(out.to_engine, vec![Frame::Empty]);
        assert!(out.to_wire.is_empty());

        let out = pipeline.write(Frame::Empty).unwrap();
        assert_eq!(out.to_wire, vec![Frame::Empty]);
    }

    #[test]
    fn test_read_can_trigger_write_through_lower_handlers() {
        let mut pipeline = Pipeline::new();
        pipeline.add_last(Box::new(Rewrite));
        pipeline.add_last(Box::new(Echo));
        pipeline.add_last(Box::new(TracingHandler));
        assert_eq!(pipeline.names(), vec!["rewrite", "echo", "tracing"]);

        let out = pipeline.read(Frame::Header(ProtocolHeader::Amqp)).unwrap();
        assert!(out.to_engine.is_empty());
        assert_eq!(out.to_wire, vec![Frame::Empty]);

        let out = pipeline.write(Frame::Header(ProtocolHeader::Amqp)).unwrap();
        assert_eq!(out.to_wire, vec![Frame::Header(ProtocolHeader::Sasl)]);
    }

    #[test]
    fn test_handler_error_propagates() {
        let mut pipeline = Pipeline::new();
        pipeline.add_first(Box::new(Failing));
        assert_eq!(
            pipeline.read(Frame::Empty).unwrap_err(),
            EngineError::Sasl("rejected".into())
        );
    }
}
