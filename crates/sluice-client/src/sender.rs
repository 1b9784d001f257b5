//! Streaming senders.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sluice_codec::{DeliveryState, ErrorCondition, Fields, Header, Properties, Source, Target};
use sluice_engine::{
    DeliveryId, EndpointState, EngineError, FlushStatus, Lifecycle, LinkId, SessionId,
    StreamSendBuffer,
};
use tracing::debug;

use crate::connection::{link_name, remote_opened};
use crate::driver::{DriverState, Shared};
use crate::error::{ClientError, Result};
use crate::options::{OutputStreamOptions, StreamSenderOptions};

/// A sender link that writes messages as streams.
pub struct StreamSender {
    shared: Arc<Shared>,
    link: LinkId,
    address: String,
    options: StreamSenderOptions,
}

impl fmt::Debug for StreamSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSender")
            .field("link", &self.link)
            .field("address", &self.address)
            .field("options", &self.options)
            .finish()
    }
}

impl StreamSender {
    pub(crate) async fn open(
        shared: Arc<Shared>,
        session: SessionId,
        address: String,
        options: StreamSenderOptions,
    ) -> Result<Self> {
        let link = shared
            .with_state(|state| {
                let name = match &options.link_name {
                    Some(name) => name.clone(),
                    None => link_name(state, "sender", &address),
                };
                let link = state.engine.create_sender(session, name)?;
                state.engine.set_source(link, Source::default())?;
                state.engine.set_target(link, Target::new(address.clone()))?;
                state.engine.open_link(link)?;
                state.auto_settle.insert(link, options.auto_settle);
                Ok(link)
            })
            .await?;
        debug!("Opening sender to {}", address);
        shared
            .wait_for_within(options.open_timeout_duration(), "sender attach", |state| {
                let link = link_state(state, link)?;
                remote_opened(link.remote_state(), link.endpoint().remote_error())
            })
            .await?;
        Ok(Self {
            shared,
            link,
            address,
            options,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    /// Credit the peer has granted and this sender has not yet used.
    pub async fn credit(&self) -> Result<u32> {
        let link = self.link;
        self.shared
            .with_state(|state| Ok(link_state(state, link)?.credit()))
            .await
    }

    /// Start streaming a new message.
    ///
    /// Fails while the previous message on this sender is still open.
    pub async fn begin_message(&self) -> Result<StreamSenderMessage> {
        let link = self.link;
        let options = &self.options;
        let buffer = self
            .shared
            .with_state(|state| {
                check_usable(state, link)?;
                let frame_size = state.engine.connection().remote_max_frame_size();
                let size = options.effective_write_buffer_size(frame_size);
                Ok(StreamSendBuffer::new(&mut state.engine, link, size)?)
            })
            .await?;
        Ok(StreamSenderMessage {
            shared: Arc::clone(&self.shared),
            buffer,
            send_timeout: options.send_timeout_duration(),
        })
    }

    /// Send `body` as a single Data section and complete the message.
    pub async fn send(&self, body: impl Into<Bytes>) -> Result<Tracker> {
        let body = body.into();
        let mut message = self.begin_message().await?;
        message.open_body(OutputStreamOptions::new().body_length(body.len()))?;
        message.write_body(&body).await?;
        message.finish().await
    }

    /// Detach with `closed=true` and wait for the peer's Detach.
    pub async fn close(&self) -> Result<()> {
        self.shut(true, None).await
    }

    /// Detach without closing the terminus.
    pub async fn detach(&self) -> Result<()> {
        self.shut(false, None).await
    }

    pub async fn close_with(&self, error: ErrorCondition) -> Result<()> {
        self.shut(true, Some(error)).await
    }

    async fn shut(&self, close: bool, error: Option<ErrorCondition>) -> Result<()> {
        shut_link(&self.shared, self.link, close, error).await?;
        self.shared
            .with_state(|state| {
                state.auto_settle.remove(&self.link);
                Ok(())
            })
            .await
    }
}

/// One message being streamed on a [`StreamSender`].
///
/// Sections other than the body are set before the first body byte; the
/// footer may be set until the message completes. Body writes and the
/// output stream calls report failures as [`io::Error`].
pub struct StreamSenderMessage {
    shared: Arc<Shared>,
    buffer: StreamSendBuffer,
    send_timeout: Option<Duration>,
}

impl fmt::Debug for StreamSenderMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSenderMessage")
            .field("delivery", &self.buffer.delivery())
            .field("bytes_written", &self.buffer.bytes_written())
            .field("complete", &self.buffer.is_complete())
            .field("aborted", &self.buffer.is_aborted())
            .finish()
    }
}

impl StreamSenderMessage {
    pub fn delivery(&self) -> DeliveryId {
        self.buffer.delivery()
    }

    pub fn is_complete(&self) -> bool {
        self.buffer.is_complete()
    }

    pub fn is_aborted(&self) -> bool {
        self.buffer.is_aborted()
    }

    pub fn set_header(&mut self, header: Header) -> Result<()> {
        Ok(self.buffer.set_header(header)?)
    }

    pub fn set_delivery_annotations(&mut self, annotations: Fields) -> Result<()> {
        Ok(self.buffer.set_delivery_annotations(annotations)?)
    }

    pub fn set_message_annotations(&mut self, annotations: Fields) -> Result<()> {
        Ok(self.buffer.set_message_annotations(annotations)?)
    }

    pub fn set_properties(&mut self, properties: Properties) -> Result<()> {
        Ok(self.buffer.set_properties(properties)?)
    }

    pub fn set_application_properties(&mut self, properties: Fields) -> Result<()> {
        Ok(self.buffer.set_application_properties(properties)?)
    }

    pub fn set_footer(&mut self, footer: Fields) -> Result<()> {
        Ok(self.buffer.set_footer(footer)?)
    }

    /// Open the body with explicit options. Writing without opening uses
    /// [`OutputStreamOptions::default`].
    pub fn open_body(&mut self, options: OutputStreamOptions) -> Result<()> {
        Ok(self
            .buffer
            .open_body(options.body_length, options.complete_send_on_close)?)
    }

    /// Write all of `data`, waiting for credit as needed.
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_body(data).await.map_err(ClientError::into_io)
    }

    /// Push staged body bytes to the peer.
    pub async fn flush(&mut self) -> io::Result<()> {
        let buffer = &mut self.buffer;
        self.shared
            .wait_for_within(self.send_timeout, "flush", |state| {
                flushed(buffer.flush(&mut state.engine)?)
            })
            .await
            .map_err(ClientError::into_io)
    }

    /// Close the body stream.
    ///
    /// Completes the message unless the body was opened without
    /// `complete_send_on_close`; aborts it when closed short of a declared
    /// body length.
    pub async fn close(&mut self) -> io::Result<()> {
        let buffer = &mut self.buffer;
        self.shared
            .wait_for_within(self.send_timeout, "close", |state| {
                flushed(buffer.close(&mut state.engine)?)
            })
            .await
            .map_err(ClientError::into_io)
    }

    /// Send the final transfer, footer included.
    pub async fn complete(&mut self) -> Result<Tracker> {
        self.finish().await
    }

    /// Abort the message. Nothing is sent if no bytes went out yet.
    pub async fn abort(&mut self) -> Result<()> {
        let buffer = &mut self.buffer;
        self.shared
            .with_state(|state| Ok(buffer.abort(&mut state.engine)?))
            .await
    }

    /// Tracker for this message's delivery.
    pub fn tracker(&self) -> Tracker {
        Tracker::new(Arc::clone(&self.shared), self.buffer.delivery())
    }

    async fn write_body(&mut self, data: &[u8]) -> Result<()> {
        let buffer = &mut self.buffer;
        let mut written = 0;
        self.shared
            .wait_for_within(self.send_timeout, "write", |state| {
                written += buffer.write(&mut state.engine, &data[written..])?;
                Ok((written == data.len()).then_some(()))
            })
            .await
    }

    async fn finish(&mut self) -> Result<Tracker> {
        let buffer = &mut self.buffer;
        self.shared
            .wait_for_within(self.send_timeout, "complete", |state| {
                flushed(buffer.complete(&mut state.engine)?)
            })
            .await?;
        Ok(self.tracker())
    }
}

fn flushed(status: FlushStatus) -> Result<Option<()>> {
    Ok((status == FlushStatus::Flushed).then_some(()))
}

/// Follows the outcome of a sent delivery.
#[derive(Clone)]
pub struct Tracker {
    shared: Arc<Shared>,
    delivery: DeliveryId,
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("delivery", &self.delivery)
            .finish()
    }
}

impl Tracker {
    fn new(shared: Arc<Shared>, delivery: DeliveryId) -> Self {
        Self { shared, delivery }
    }

    pub fn delivery(&self) -> DeliveryId {
        self.delivery
    }

    /// The peer's latest state for the delivery.
    pub async fn remote_state(&self) -> Result<Option<DeliveryState>> {
        let delivery = self.delivery;
        self.shared
            .with_state(|state| {
                Ok(state
                    .engine
                    .delivery(delivery)
                    .and_then(|delivery| delivery.remote_state().cloned()))
            })
            .await
    }

    /// Wait for the peer to settle the delivery and return its final
    /// state. Fails if the link closes first.
    pub async fn settlement(&self) -> Result<Option<DeliveryState>> {
        let delivery_id = self.delivery;
        self.shared
            .wait_for(|state| {
                let delivery = state.engine.delivery(delivery_id).ok_or_else(|| {
                    EngineError::illegal_state("delivery was already released")
                })?;
                let link_id = delivery.link();
                if delivery.is_remotely_settled() {
                    let outcome = delivery.remote_state().cloned();
                    let settled = delivery.is_settled();
                    if settled {
                        state.engine.release_delivery(delivery_id)?;
                    }
                    return Ok(Some(outcome));
                }
                let link = link_state(state, link_id)?;
                if link.remote_state() == EndpointState::Closed {
                    return Err(ClientError::Engine(EngineError::RemotelyClosed(
                        link.endpoint().remote_error().cloned(),
                    )));
                }
                Ok(None)
            })
            .await
    }

    /// Settle locally with an optional final state.
    pub async fn settle(&self, outcome: Option<DeliveryState>) -> Result<()> {
        let delivery = self.delivery;
        self.shared
            .with_state(|state| Ok(state.engine.disposition(delivery, outcome, true)?))
            .await
    }
}

pub(crate) fn link_state(state: &DriverState, link: LinkId) -> Result<&sluice_engine::Link> {
    state
        .engine
        .link(link)
        .ok_or_else(|| ClientError::ResourceClosed("link".to_string()))
}

/// Refuse work on a link either side has closed.
pub(crate) fn check_usable(state: &DriverState, link: LinkId) -> Result<()> {
    let link = link_state(state, link)?;
    if link.remote_state() == EndpointState::Closed {
        return Err(ClientError::Engine(EngineError::RemotelyClosed(
            link.endpoint().remote_error().cloned(),
        )));
    }
    if link.local_state() == EndpointState::Closed {
        return Err(ClientError::ResourceClosed(link.name().to_string()));
    }
    Ok(())
}

/// Detach a link and wait for the peer's answer.
pub(crate) async fn shut_link(
    shared: &Shared,
    link: LinkId,
    close: bool,
    error: Option<ErrorCondition>,
) -> Result<()> {
    shared
        .with_state(|state| {
            if close {
                state.engine.close_link(link, error)?;
            } else {
                state.engine.detach_link(link, error)?;
            }
            Ok(())
        })
        .await?;
    shared
        .wait_for(|state| {
            Ok(state
                .engine
                .link(link)
                .map_or(true, |link| link.remote_state() == EndpointState::Closed)
                .then_some(()))
        })
        .await
}
