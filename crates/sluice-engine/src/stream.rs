//! Incremental message encoding for streamed sends.
//!
//! A [`StreamSendBuffer`] writes a message into one delivery as it is
//! produced: preamble sections first, then the body as Data sections, then
//! an optional footer. Body bytes are staged up to the write buffer size and
//! flushed as non-final transfers; completing the stream sends the final
//! frame.

use bytes::{Bytes, BytesMut};
use sluice_codec::messaging::write_data_section_header;
use sluice_codec::{Fields, Header, Properties, Section};
use tracing::debug;

use crate::delivery::DeliveryId;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::link::LinkId;

/// Outcome of pushing staged bytes to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    Flushed,
    /// No credit for the first frame, or earlier frames are still queued.
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Open,
    /// Body closed without completing; waiting for a footer and `complete`.
    BodyClosed,
    Completed,
    Aborted,
}

#[derive(Debug)]
struct Body {
    declared: Option<usize>,
    written: usize,
    complete_on_close: bool,
    section_written: bool,
}

/// Streams one message into a delivery on a sender link.
#[derive(Debug)]
pub struct StreamSendBuffer {
    link: LinkId,
    delivery: DeliveryId,
    write_buffer_size: usize,
    header: Option<Header>,
    delivery_annotations: Option<Fields>,
    message_annotations: Option<Fields>,
    properties: Option<Properties>,
    application_properties: Option<Fields>,
    footer: Option<Fields>,
    preamble_sent: bool,
    body: Option<Body>,
    staged: BytesMut,
    state: StreamState,
}

impl StreamSendBuffer {
    /// Start a new delivery on `link` for the streamed message.
    pub fn new(engine: &mut Engine, link: LinkId, write_buffer_size: usize) -> Result<Self> {
        if write_buffer_size == 0 {
            return Err(EngineError::illegal_state("write buffer size must be positive"));
        }
        let delivery = engine.next_delivery(link)?;
        Ok(Self {
            link,
            delivery,
            write_buffer_size,
            header: None,
            delivery_annotations: None,
            message_annotations: None,
            properties: None,
            application_properties: None,
            footer: None,
            preamble_sent: false,
            body: None,
            staged: BytesMut::with_capacity(write_buffer_size),
            state: StreamState::Open,
        })
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn delivery(&self) -> DeliveryId {
        self.delivery
    }

    pub fn is_complete(&self) -> bool {
        self.state == StreamState::Completed
    }

    pub fn is_aborted(&self) -> bool {
        self.state == StreamState::Aborted
    }

    /// Body bytes accepted so far.
    pub fn bytes_written(&self) -> usize {
        self.body.as_ref().map_or(0, |body| body.written)
    }

    /// Body bytes staged but not yet handed to the engine.
    pub fn staged(&self) -> usize {
        self.staged.len()
    }

    pub fn set_header(&mut self, header: Header) -> Result<()> {
        self.check_preamble()?;
        self.header = Some(header);
        Ok(())
    }

    pub fn set_delivery_annotations(&mut self, annotations: Fields) -> Result<()> {
        self.check_preamble()?;
        self.delivery_annotations = Some(annotations);
        Ok(())
    }

    pub fn set_message_annotations(&mut self, annotations: Fields) -> Result<()> {
        self.check_preamble()?;
        self.message_annotations = Some(annotations);
        Ok(())
    }

    pub fn set_properties(&mut self, properties: Properties) -> Result<()> {
        self.check_preamble()?;
        self.properties = Some(properties);
        Ok(())
    }

    pub fn set_application_properties(&mut self, properties: Fields) -> Result<()> {
        self.check_preamble()?;
        self.application_properties = Some(properties);
        Ok(())
    }

    /// The footer goes out with the final frame.
    pub fn set_footer(&mut self, footer: Fields) -> Result<()> {
        self.check_unfinished()?;
        self.footer = Some(footer);
        Ok(())
    }

    /// Open the body. A declared length is encoded as a single Data section
    /// and closing short of it aborts the delivery.
    pub fn open_body(&mut self, body_length: Option<usize>, complete_on_close: bool) -> Result<()> {
        self.check_unfinished()?;
        if self.body.is_some() {
            return Err(EngineError::illegal_state("message body already opened"));
        }
        if body_length.is_some_and(|length| u32::try_from(length).is_err()) {
            return Err(EngineError::illegal_state("declared body length exceeds 4GiB"));
        }
        self.body = Some(Body {
            declared: body_length,
            written: 0,
            complete_on_close,
            section_written: false,
        });
        Ok(())
    }

    /// Stage body bytes, flushing as soon as the write buffer fills.
    ///
    /// Returns how many bytes were accepted; fewer than `data.len()` means
    /// the link blocked and the caller should retry once it is sendable.
    /// Accepted bytes may stay staged behind a blocked flush.
    pub fn write(&mut self, engine: &mut Engine, data: &[u8]) -> Result<usize> {
        engine.check_failed()?;
        if self.state != StreamState::Open {
            return Err(EngineError::illegal_state("message stream is closed"));
        }
        if self.body.is_none() {
            self.open_body(None, true)?;
        }
        if let Some(Body {
            declared: Some(declared),
            written,
            ..
        }) = &self.body
        {
            if written + data.len() > *declared {
                return Err(EngineError::illegal_state(
                    "write exceeds the declared body length",
                ));
            }
        }

        let mut accepted = 0;
        while accepted < data.len() {
            if self.staged.len() >= self.write_buffer_size
                && self.flush(engine)? == FlushStatus::Blocked
            {
                break;
            }
            let room = self.write_buffer_size - self.staged.len();
            let count = room.min(data.len() - accepted);
            self.staged
                .extend_from_slice(&data[accepted..accepted + count]);
            accepted += count;
            if self.staged.len() >= self.write_buffer_size
                && self.flush(engine)? == FlushStatus::Blocked
            {
                break;
            }
        }
        if let Some(body) = self.body.as_mut() {
            body.written += accepted;
        }
        Ok(accepted)
    }

    /// Hand staged bytes to the engine as a non-final transfer.
    pub fn flush(&mut self, engine: &mut Engine) -> Result<FlushStatus> {
        engine.check_failed()?;
        if self.staged.is_empty() {
            return Ok(FlushStatus::Flushed);
        }
        if self.is_blocked(engine)? {
            return Ok(FlushStatus::Blocked);
        }
        let payload = self.compose(false);
        engine.write_bytes(self.delivery, payload, false)?;
        self.preamble_sent = true;
        Ok(FlushStatus::Flushed)
    }

    /// Close the body.
    ///
    /// Short of a declared length this flushes what was written and aborts.
    /// Otherwise the message completes, unless the body was opened without
    /// `complete_on_close`, in which case [`complete`](Self::complete) is
    /// still owed.
    pub fn close(&mut self, engine: &mut Engine) -> Result<FlushStatus> {
        match self.state {
            StreamState::Open => {}
            StreamState::BodyClosed | StreamState::Completed | StreamState::Aborted => {
                return Ok(FlushStatus::Flushed)
            }
        }
        let (short, complete_on_close) = match &self.body {
            Some(body) => (
                body.declared.is_some_and(|declared| body.written < declared),
                body.complete_on_close,
            ),
            None => (false, true),
        };
        if short {
            debug!("Stream closed before its declared length, aborting");
            self.flush(engine)?;
            self.abort(engine)?;
            return Ok(FlushStatus::Flushed);
        }
        if complete_on_close {
            return self.complete(engine);
        }
        self.state = StreamState::BodyClosed;
        Ok(FlushStatus::Flushed)
    }

    /// Send the final frame with whatever is left.
    pub fn complete(&mut self, engine: &mut Engine) -> Result<FlushStatus> {
        match self.state {
            StreamState::Completed => return Ok(FlushStatus::Flushed),
            StreamState::Aborted => {
                return Err(EngineError::illegal_state("message stream was aborted"))
            }
            StreamState::Open | StreamState::BodyClosed => {}
        }
        if let Some(Body {
            declared: Some(declared),
            written,
            ..
        }) = &self.body
        {
            if written < declared {
                return Err(EngineError::illegal_state(
                    "declared body length not reached",
                ));
            }
        }
        if self.is_blocked(engine)? {
            return Ok(FlushStatus::Blocked);
        }
        let payload = self.compose(true);
        engine.write_bytes(self.delivery, payload, true)?;
        self.preamble_sent = true;
        self.state = StreamState::Completed;
        Ok(FlushStatus::Flushed)
    }

    pub fn abort(&mut self, engine: &mut Engine) -> Result<()> {
        if self.state == StreamState::Aborted {
            return Ok(());
        }
        if self.state == StreamState::Completed {
            return Err(EngineError::illegal_state("message stream already completed"));
        }
        engine.abort(self.delivery)?;
        self.staged.clear();
        self.state = StreamState::Aborted;
        Ok(())
    }

    fn check_preamble(&self) -> Result<()> {
        self.check_unfinished()?;
        if self.preamble_sent || self.bytes_written() > 0 || !self.staged.is_empty() {
            return Err(EngineError::illegal_state(
                "message sections are fixed once the body is written",
            ));
        }
        Ok(())
    }

    fn check_unfinished(&self) -> Result<()> {
        match self.state {
            StreamState::Completed | StreamState::Aborted => {
                Err(EngineError::illegal_state("message stream is finished"))
            }
            StreamState::Open | StreamState::BodyClosed => Ok(()),
        }
    }

    fn is_blocked(&self, engine: &Engine) -> Result<bool> {
        let link = engine
            .link(self.link)
            .ok_or_else(|| EngineError::illegal_state("link no longer exists"))?;
        let delivery = engine
            .delivery(self.delivery)
            .ok_or_else(|| EngineError::illegal_state("delivery no longer exists"))?;
        Ok((!delivery.started && link.credit() == 0) || link.queued_frames() > 0)
    }

    fn compose(&mut self, last: bool) -> Bytes {
        let mut buf = BytesMut::new();
        if !self.preamble_sent {
            let sections = [
                self.header.clone().map(Section::Header),
                self.delivery_annotations
                    .clone()
                    .map(Section::DeliveryAnnotations),
                self.message_annotations
                    .clone()
                    .map(Section::MessageAnnotations),
                self.properties.clone().map(Section::Properties),
                self.application_properties
                    .clone()
                    .map(Section::ApplicationProperties),
            ];
            for section in sections.into_iter().flatten() {
                section.encode(&mut buf);
            }
        }

        let body = self.body.get_or_insert(Body {
            declared: None,
            written: 0,
            complete_on_close: true,
            section_written: false,
        });
        match body.declared {
            Some(declared) => {
                if !body.section_written && (!self.staged.is_empty() || last) {
                    write_data_section_header(declared as u32, &mut buf);
                    body.section_written = true;
                }
                buf.extend_from_slice(&self.staged);
            }
            None => {
                if !self.staged.is_empty() || (last && !body.section_written) {
                    write_data_section_header(self.staged.len() as u32, &mut buf);
                    buf.extend_from_slice(&self.staged);
                    body.section_written = true;
                }
            }
        }
        self.staged.clear();

        if last {
            if let Some(footer) = self.footer.clone() {
                Section::Footer(footer).encode(&mut buf);
            }
        }
        buf.freeze()
    }
}
