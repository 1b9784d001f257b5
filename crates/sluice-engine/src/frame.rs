//! AMQP frame envelope.
//!
//! Frame format: [size u32][doff u8][type u8][channel u16][extended header][body]
//! The size counts the whole frame, doff counts 4 byte words up to the body.
//! A frame of exactly 8 bytes carries no body and serves as a heartbeat.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sluice_codec::{decode, DecodeError, Performative, SaslPerformative, StreamDecoder, Value};
use tracing::trace;

use crate::error::{EngineError, Result};

/// Size of the fixed frame header and of the protocol header.
pub const FRAME_HEADER_SIZE: usize = 8;

pub const AMQP_FRAME_TYPE: u8 = 0;
pub const SASL_FRAME_TYPE: u8 = 1;

const DEFAULT_DOFF: u8 = 2;

/// The protocol header exchanged before any frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolHeader {
    Amqp,
    Sasl,
}

impl ProtocolHeader {
    pub fn bytes(self) -> [u8; 8] {
        let id = match self {
            ProtocolHeader::Amqp => 0,
            ProtocolHeader::Sasl => 3,
        };
        [b'A', b'M', b'Q', b'P', id, 1, 0, 0]
    }

    fn parse(bytes: &[u8]) -> Result<Self> {
        match bytes {
            [b'A', b'M', b'Q', b'P', 0, 1, 0, 0] => Ok(ProtocolHeader::Amqp),
            [b'A', b'M', b'Q', b'P', 3, 1, 0, 0] => Ok(ProtocolHeader::Sasl),
            other => Err(EngineError::protocol(format!(
                "unsupported protocol header {:02x?}",
                other
            ))),
        }
    }
}

/// A transport frame on a channel, with the payload of a Transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct AmqpFrame {
    pub channel: u16,
    pub performative: Performative,
    pub payload: Option<Bytes>,
}

impl AmqpFrame {
    pub fn new(channel: u16, performative: impl Into<Performative>) -> Self {
        Self {
            channel,
            performative: performative.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Anything read from or written to the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Header(ProtocolHeader),
    Amqp(AmqpFrame),
    Sasl(SaslPerformative),
    Empty,
}

impl Frame {
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Header(ProtocolHeader::Amqp) => "amqp-header",
            Frame::Header(ProtocolHeader::Sasl) => "sasl-header",
            Frame::Amqp(frame) => frame.performative.name(),
            Frame::Sasl(performative) => performative.name(),
            Frame::Empty => "empty",
        }
    }
}

#[derive(Debug)]
struct PartialFrame {
    frame_type: u8,
    channel: u16,
    body_remaining: usize,
    performative: Option<Value>,
}

/// Frame parser for decoding frames from a byte stream
#[derive(Debug)]
pub struct FrameParser {
    buffer: BytesMut,
    max_frame_size: u32,
    expect_header: bool,
    /// Present in streaming mode.
    decoder: Option<StreamDecoder>,
    partial: Option<PartialFrame>,
}

impl FrameParser {
    /// Create a parser that waits for whole frames before decoding
    pub fn new(max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_frame_size,
            expect_header: true,
            decoder: None,
            partial: None,
        }
    }

    /// Create a parser that decodes each performative as its bytes arrive
    pub fn streaming(max_frame_size: u32) -> Self {
        Self {
            decoder: Some(StreamDecoder::new()),
            ..Self::new(max_frame_size)
        }
    }

    /// Add data to the parser buffer
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes received but not yet parsed into a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Try to parse a complete frame from the buffer
    pub fn parse_frame(&mut self) -> Result<Option<Frame>> {
        if self.expect_header {
            if self.buffer.len() < FRAME_HEADER_SIZE {
                return Ok(None);
            }
            let header = ProtocolHeader::parse(&self.buffer[..FRAME_HEADER_SIZE])?;
            self.buffer.advance(FRAME_HEADER_SIZE);
            self.expect_header = false;
            trace!("Read protocol header {:?}", header);
            return Ok(Some(Frame::Header(header)));
        }

        if self.partial.is_none() {
            if self.buffer.len() < FRAME_HEADER_SIZE {
                return Ok(None);
            }
            let size = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]);
            let doff = self.buffer[4];
            let frame_type = self.buffer[5];
            let channel = u16::from_be_bytes([self.buffer[6], self.buffer[7]]);

            if size > self.max_frame_size {
                return Err(EngineError::FrameSize {
                    size,
                    max: self.max_frame_size,
                });
            }
            let body_offset = usize::from(doff) * 4;
            let size = size as usize;
            if doff < DEFAULT_DOFF || body_offset > size {
                return Err(EngineError::protocol(format!(
                    "malformed frame header: size {} doff {}",
                    size, doff
                )));
            }

            if size == body_offset {
                if frame_type != AMQP_FRAME_TYPE {
                    return Err(EngineError::protocol("empty frame of non-AMQP type"));
                }
                if self.buffer.len() < size {
                    return Ok(None);
                }
                self.buffer.advance(size);
                return Ok(Some(Frame::Empty));
            }

            if self.decoder.is_none() {
                if self.buffer.len() < size {
                    return Ok(None);
                }
                let mut body = self.buffer.split_to(size).freeze();
                body.advance(body_offset);
                let (value, consumed) = decode(&body)?;
                let payload = body.slice(consumed..);
                return self.build_frame(frame_type, channel, value, payload).map(Some);
            }

            if self.buffer.len() < body_offset {
                return Ok(None);
            }
            self.buffer.advance(body_offset);
            self.partial = Some(PartialFrame {
                frame_type,
                channel,
                body_remaining: size - body_offset,
                performative: None,
            });
        }

        let (Some(partial), Some(decoder)) = (self.partial.as_mut(), self.decoder.as_mut()) else {
            return Ok(None);
        };

        if partial.performative.is_none() {
            let available = self.buffer.len().min(partial.body_remaining);
            let mut chunk = &self.buffer[..available];
            let decoded = decoder.decode(&mut chunk)?;
            let consumed = available - chunk.len();
            self.buffer.advance(consumed);
            partial.body_remaining -= consumed;
            match decoded {
                Some(value) => partial.performative = Some(value),
                None if partial.body_remaining == 0 => {
                    decoder.reset();
                    return Err(DecodeError::Truncated {
                        needed: 1,
                        remaining: 0,
                    }
                    .into());
                }
                None => return Ok(None),
            }
        }

        if self.buffer.len() < partial.body_remaining {
            return Ok(None);
        }
        let payload = self.buffer.split_to(partial.body_remaining).freeze();
        let frame_type = partial.frame_type;
        let channel = partial.channel;
        let value = partial.performative.take().unwrap_or(Value::Null);
        self.partial = None;
        self.build_frame(frame_type, channel, value, payload).map(Some)
    }

    fn build_frame(
        &mut self,
        frame_type: u8,
        channel: u16,
        value: Value,
        payload: Bytes,
    ) -> Result<Frame> {
        match frame_type {
            AMQP_FRAME_TYPE => {
                let performative = Performative::from_value(value)?;
                trace!(
                    "Read {} on channel {} with {} payload bytes",
                    performative.name(),
                    channel,
                    payload.len()
                );
                let payload = match performative {
                    Performative::Transfer(_) => Some(payload),
                    _ => None,
                };
                Ok(Frame::Amqp(AmqpFrame {
                    channel,
                    performative,
                    payload,
                }))
            }
            SASL_FRAME_TYPE => {
                let performative = SaslPerformative::from_value(value)?;
                trace!("Read {}", performative.name());
                if matches!(performative, SaslPerformative::Outcome(_)) {
                    self.expect_header = true;
                }
                Ok(Frame::Sasl(performative))
            }
            other => Err(EngineError::protocol(format!("unknown frame type {}", other))),
        }
    }
}

/// Encode a frame to the output buffer
pub fn write_frame(frame: &Frame, buf: &mut BytesMut) {
    match frame {
        Frame::Header(header) => buf.put_slice(&header.bytes()),
        Frame::Empty => write_envelope(buf, AMQP_FRAME_TYPE, 0, |_| {}),
        Frame::Amqp(frame) => write_envelope(buf, AMQP_FRAME_TYPE, frame.channel, |buf| {
            frame.performative.encode(buf);
            if let Some(payload) = &frame.payload {
                buf.put_slice(payload);
            }
        }),
        Frame::Sasl(performative) => {
            write_envelope(buf, SASL_FRAME_TYPE, 0, |buf| performative.encode(buf))
        }
    }
}

fn write_envelope(buf: &mut BytesMut, frame_type: u8, channel: u16, body: impl FnOnce(&mut BytesMut)) {
    let start = buf.len();
    buf.put_u32(0);
    buf.put_u8(DEFAULT_DOFF);
    buf.put_u8(frame_type);
    buf.put_u16(channel);
    body(buf);
    let size = (buf.len() - start) as u32;
    buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
}
