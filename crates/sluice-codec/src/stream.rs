//! Incremental decoding.
//!
//! [`StreamDecoder`] accepts input in arbitrary chunks. Bytes are consumed
//! from the source as soon as they are read; a token split across two calls
//! (a constructor, a length field, a fixed width body or a variable payload)
//! is held in a scratch buffer and compound values under construction are
//! kept on an explicit stack, so resuming never re-reads committed bytes.

use bytes::{Buf, Bytes};
use tracing::trace;

use crate::codes;
use crate::constructor::{read_width, Layout, TypeConstructor};
use crate::decoder::pair_up;
use crate::error::{DecodeError, Result};
use crate::value::{Array, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Need {
    Constructor,
    Fixed(TypeConstructor, usize),
    Length(TypeConstructor, usize),
    Payload(TypeConstructor, usize),
    CompoundHeader { width: usize, map: bool },
    ArrayHeader { width: usize },
    ArrayConstructor,
}

impl Need {
    fn bytes(&self) -> usize {
        match *self {
            Need::Constructor | Need::ArrayConstructor => 1,
            Need::Fixed(_, n) | Need::Payload(_, n) => n,
            Need::Length(_, width) => width,
            Need::CompoundHeader { width, .. } | Need::ArrayHeader { width } => 2 * width,
        }
    }
}

#[derive(Debug)]
struct ListFrame {
    map: bool,
    declared: usize,
    end: usize,
    count: usize,
    items: Vec<Value>,
}

#[derive(Debug)]
struct ArrayFrame {
    declared: usize,
    end: usize,
    count: usize,
    /// Unset while the element constructor (and optional descriptor) is read.
    element: Option<TypeConstructor>,
    descriptor: Option<Value>,
    items: Vec<Value>,
}

#[derive(Debug)]
enum Open {
    List(ListFrame),
    Array(ArrayFrame),
    Described(Option<Value>),
}

impl Open {
    fn end(&self) -> Option<usize> {
        match self {
            Open::List(list) => Some(list.end),
            Open::Array(array) => Some(array.end),
            Open::Described(_) => None,
        }
    }
}

/// Resumable decoder for values arriving in pieces.
#[derive(Debug)]
pub struct StreamDecoder {
    need: Need,
    scratch: Vec<u8>,
    stack: Vec<Open>,
    /// Bytes consumed since the current top level value started.
    offset: usize,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self {
            need: Need::Constructor,
            scratch: Vec::new(),
            stack: Vec::new(),
            offset: 0,
        }
    }

    /// Whether a value has been started but not finished.
    pub fn is_partial(&self) -> bool {
        self.offset > 0 || !self.scratch.is_empty()
    }

    /// Discards any partially decoded value.
    pub fn reset(&mut self) {
        self.need = Need::Constructor;
        self.scratch.clear();
        self.stack.clear();
        self.offset = 0;
    }

    /// Consumes bytes from `src` until one complete value is decoded.
    ///
    /// Returns `Ok(None)` when `src` ran out first; the consumed bytes are
    /// retained and decoding resumes on the next call. Any error resets the
    /// decoder.
    pub fn decode<B: Buf>(&mut self, src: &mut B) -> Result<Option<Value>> {
        let result = self.advance(src);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn advance<B: Buf>(&mut self, src: &mut B) -> Result<Option<Value>> {
        loop {
            let need = self.need;
            let n = need.bytes();
            if !self.fill(src, n) {
                return Ok(None);
            }
            if let Some(end) = self.innermost_end() {
                if self.offset + n > end {
                    return Err(DecodeError::SizeExceedsRemaining {
                        what: "element",
                        declared: n,
                        remaining: end.saturating_sub(self.offset),
                    });
                }
            }
            self.offset += n;
            let token = std::mem::take(&mut self.scratch);

            let produced = match need {
                Need::Constructor => self.start(TypeConstructor::from_code(token[0])?)?,
                Need::Fixed(ctor, _) => Some(ctor.fixed_value(&token)?),
                Need::Length(ctor, width) => {
                    let len = read_width(&token, width);
                    self.check_within("length", len)?;
                    self.need = Need::Payload(ctor, len);
                    None
                }
                Need::Payload(ctor, _) => Some(ctor.variable_value(Bytes::from(token))?),
                Need::CompoundHeader { width, map } => self.open_compound(&token, width, map)?,
                Need::ArrayHeader { width } => {
                    self.open_array(&token, width)?;
                    None
                }
                Need::ArrayConstructor => self.array_constructor(token[0])?,
            };

            if let Some(value) = produced {
                if let Some(done) = self.complete(value)? {
                    return Ok(Some(done));
                }
            }
        }
    }

    /// Moves bytes from `src` into the scratch buffer until it holds `needed`.
    fn fill<B: Buf>(&mut self, src: &mut B, needed: usize) -> bool {
        while self.scratch.len() < needed && src.has_remaining() {
            let chunk = src.chunk();
            let n = chunk.len().min(needed - self.scratch.len());
            self.scratch.extend_from_slice(&chunk[..n]);
            src.advance(n);
        }
        self.scratch.len() == needed
    }

    fn innermost_end(&self) -> Option<usize> {
        self.stack.iter().rev().find_map(Open::end)
    }

    fn check_within(&self, what: &'static str, declared: usize) -> Result<()> {
        match self.innermost_end() {
            Some(end) if self.offset + declared > end => Err(DecodeError::SizeExceedsRemaining {
                what,
                declared,
                remaining: end - self.offset,
            }),
            _ => Ok(()),
        }
    }

    fn check_end(&self, end: usize, declared: usize) -> Result<()> {
        if self.offset == end {
            Ok(())
        } else {
            Err(DecodeError::SizeMismatch {
                declared,
                actual: declared + self.offset - end,
            })
        }
    }

    /// Prepares to read the body selected by `ctor`, returning the value
    /// immediately when the constructor carries no body.
    fn start(&mut self, ctor: TypeConstructor) -> Result<Option<Value>> {
        match ctor.layout() {
            Layout::Empty => return Ok(Some(ctor.empty_value())),
            Layout::Fixed(n) => self.need = Need::Fixed(ctor, n),
            Layout::Variable { width } => self.need = Need::Length(ctor, width),
            Layout::Compound { width, map } => self.need = Need::CompoundHeader { width, map },
            Layout::Array { width } => self.need = Need::ArrayHeader { width },
            Layout::Described => {
                self.stack.push(Open::Described(None));
                self.need = Need::Constructor;
            }
        }
        Ok(None)
    }

    fn open_compound(&mut self, header: &[u8], width: usize, map: bool) -> Result<Option<Value>> {
        let size = read_width(header, width);
        let count = read_width(&header[width..], width);
        let end = self.offset - width + size;
        self.check_within("size", size.saturating_sub(width))?;
        if size < width {
            return Err(DecodeError::SizeMismatch {
                declared: size,
                actual: width,
            });
        }
        if count > size - width {
            return Err(DecodeError::SizeExceedsRemaining {
                what: "count",
                declared: count,
                remaining: size - width,
            });
        }
        if map && count % 2 != 0 {
            return Err(DecodeError::OddMapCount(count));
        }
        if count == 0 {
            self.check_end(end, size)?;
            return Ok(Some(if map {
                Value::Map(Vec::new())
            } else {
                Value::List(Vec::new())
            }));
        }
        self.stack.push(Open::List(ListFrame {
            map,
            declared: size,
            end,
            count,
            items: Vec::with_capacity(count),
        }));
        self.need = Need::Constructor;
        Ok(None)
    }

    fn open_array(&mut self, header: &[u8], width: usize) -> Result<()> {
        let size = read_width(header, width);
        let count = read_width(&header[width..], width);
        self.check_within("size", size.saturating_sub(width))?;
        if size < width + 1 {
            return Err(DecodeError::SizeMismatch {
                declared: size,
                actual: width + 1,
            });
        }
        self.stack.push(Open::Array(ArrayFrame {
            declared: size,
            end: self.offset - width + size,
            count,
            element: None,
            descriptor: None,
            items: Vec::new(),
        }));
        self.need = Need::ArrayConstructor;
        Ok(())
    }

    fn array_constructor(&mut self, code: u8) -> Result<Option<Value>> {
        let Some(Open::Array(mut array)) = self.stack.pop() else {
            return Err(DecodeError::UnknownConstructor(code));
        };
        if code == codes::DESCRIBED {
            if array.descriptor.is_some() {
                return Err(DecodeError::UnknownConstructor(code));
            }
            // The next completed value lands in the frame as its descriptor.
            self.stack.push(Open::Array(array));
            self.need = Need::Constructor;
            return Ok(None);
        }
        let element = TypeConstructor::from_code(code)?;
        if array.count > array.end - self.offset {
            return Err(DecodeError::SizeExceedsRemaining {
                what: "count",
                declared: array.count,
                remaining: array.end - self.offset,
            });
        }
        if array.count == 0 {
            self.check_end(array.end, array.declared)?;
            return Ok(Some(Value::Array(Array::from_parts(
                element.kind(),
                array.descriptor,
                Vec::new(),
            ))));
        }
        array.element = Some(element);
        array.items.reserve(array.count.min(array.end - self.offset));
        self.stack.push(Open::Array(array));
        self.start(element)
    }

    /// Attaches a finished value to its parent, closing every parent it
    /// completes. Returns the top level value once it is finished.
    fn complete(&mut self, mut value: Value) -> Result<Option<Value>> {
        loop {
            match self.stack.pop() {
                None => {
                    trace!(bytes = self.offset, kind = %value.kind(), "decoded value");
                    self.reset();
                    return Ok(Some(value));
                }
                Some(Open::Described(None)) => {
                    self.stack.push(Open::Described(Some(value)));
                    self.need = Need::Constructor;
                    return Ok(None);
                }
                Some(Open::Described(Some(descriptor))) => {
                    value = Value::described(descriptor, value);
                }
                Some(Open::List(mut list)) => {
                    list.items.push(value);
                    if list.items.len() < list.count {
                        self.stack.push(Open::List(list));
                        self.need = Need::Constructor;
                        return Ok(None);
                    }
                    self.check_end(list.end, list.declared)?;
                    value = if list.map {
                        Value::Map(pair_up(list.items))
                    } else {
                        Value::List(list.items)
                    };
                }
                Some(Open::Array(mut array)) => {
                    let Some(element) = array.element else {
                        array.descriptor = Some(value);
                        self.stack.push(Open::Array(array));
                        self.need = Need::ArrayConstructor;
                        return Ok(None);
                    };
                    array.items.push(value);
                    if array.items.len() < array.count {
                        self.stack.push(Open::Array(array));
                        match self.start(element)? {
                            Some(next) => {
                                value = next;
                                continue;
                            }
                            None => return Ok(None),
                        }
                    }
                    self.check_end(array.end, array.declared)?;
                    value = Value::Array(Array::from_parts(
                        element.kind(),
                        array.descriptor,
                        array.items,
                    ));
                }
            }
        }
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}
