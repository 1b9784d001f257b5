//! Streaming receivers.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use sluice_codec::{decode_sections, DeliveryState, ErrorCondition, Section, Source, Target};
use sluice_engine::{DeliveryId, EndpointState, EngineError, Lifecycle, LinkId, SessionId};
use tracing::{debug, trace};

use crate::connection::{link_name, remote_opened};
use crate::driver::{deadline_after, DrainState, DriverState, ReceiverState, Shared};
use crate::error::{ClientError, Result};
use crate::options::StreamReceiverOptions;
use crate::sender::{check_usable, link_state, shut_link};

/// A receiver link handing out incoming messages as streams.
///
/// With a credit window configured the receiver keeps credit topped up as
/// deliveries are received and settled; otherwise the application grants
/// credit with [`add_credit`](Self::add_credit).
pub struct StreamReceiver {
    shared: Arc<Shared>,
    link: LinkId,
    address: String,
    options: StreamReceiverOptions,
}

impl fmt::Debug for StreamReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamReceiver")
            .field("link", &self.link)
            .field("address", &self.address)
            .field("options", &self.options)
            .finish()
    }
}

impl StreamReceiver {
    pub(crate) async fn open(
        shared: Arc<Shared>,
        session: SessionId,
        address: String,
        options: StreamReceiverOptions,
    ) -> Result<Self> {
        let link = shared
            .with_state(|state| {
                let name = match &options.link_name {
                    Some(name) => name.clone(),
                    None => link_name(state, "receiver", &address),
                };
                let link = state.engine.create_receiver(session, name)?;
                state.engine.set_source(link, Source::new(address.clone()))?;
                state.engine.set_target(link, Target::default())?;
                state.receivers.insert(
                    link,
                    ReceiverState {
                        unclaimed: VecDeque::new(),
                        window: options.credit_window,
                        policy: options.credit_policy,
                        drain: DrainState::Idle,
                    },
                );
                if options.credit_window > 0 {
                    state.engine.add_credit(link, options.credit_window)?;
                }
                state.engine.open_link(link)?;
                Ok(link)
            })
            .await?;
        debug!("Opening receiver from {}", address);
        shared
            .wait_for_within(options.open_timeout_duration(), "receiver attach", |state| {
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

    /// Credit currently outstanding at the peer.
    pub async fn credit(&self) -> Result<u32> {
        let link = self.link;
        self.shared
            .with_state(|state| Ok(link_state(state, link)?.credit()))
            .await
    }

    /// Deliveries that arrived and were not yet received.
    pub async fn queued(&self) -> Result<usize> {
        let link = self.link;
        self.shared
            .with_state(|state| {
                Ok(state
                    .receivers
                    .get(&link)
                    .map_or(0, |receiver| receiver.unclaimed.len()))
            })
            .await
    }

    /// Wait for the next incoming delivery. Its payload may still be
    /// arriving.
    pub async fn receive(&self) -> Result<StreamDelivery> {
        let link = self.link;
        let delivery = self
            .shared
            .wait_for(|state| claim(state, link))
            .await?;
        Ok(self.delivery(delivery))
    }

    /// [`receive`](Self::receive) giving up after `timeout`.
    pub async fn receive_timeout(&self, timeout: Duration) -> Result<Option<StreamDelivery>> {
        match tokio::time::timeout(timeout, self.receive()).await {
            Ok(delivery) => delivery.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Receive a delivery only if one is already waiting.
    pub async fn try_receive(&self) -> Result<Option<StreamDelivery>> {
        let link = self.link;
        let delivery = self
            .shared
            .with_state(|state| claim(state, link))
            .await?;
        Ok(delivery.map(|delivery| self.delivery(delivery)))
    }

    /// Grant credit by hand.
    ///
    /// Illegal when a credit window is configured or a drain is pending.
    pub async fn add_credit(&self, credit: u32) -> Result<()> {
        let link = self.link;
        self.shared
            .with_state(|state| {
                check_usable(state, link)?;
                let receiver = receiver_state(state, link)?;
                if receiver.window != 0 {
                    return Err(EngineError::illegal_state(
                        "cannot add credit when a credit window is configured",
                    )
                    .into());
                }
                if receiver.drain == DrainState::Pending {
                    return Err(
                        EngineError::illegal_state("cannot add credit while a drain is pending")
                            .into(),
                    );
                }
                Ok(state.engine.add_credit(link, credit)?)
            })
            .await
    }

    /// Ask the peer to use or return all outstanding credit.
    ///
    /// Completes once the credit reaches zero, or immediately when there is
    /// none. Fails with `OperationTimedOut` after the configured drain
    /// timeout; the link stays usable either way.
    pub async fn drain(&self) -> Result<()> {
        let link = self.link;
        let timeout = self.options.drain_timeout_duration();
        let started = self
            .shared
            .with_state(|state| {
                check_usable(state, link)?;
                if receiver_state(state, link)?.drain == DrainState::Pending {
                    return Err(EngineError::illegal_state("receiver is already draining").into());
                }
                let started = state.engine.drain(link, Some(deadline_after(timeout)))?;
                if started {
                    receiver_state_mut(state, link)?.drain = DrainState::Pending;
                }
                Ok(started)
            })
            .await?;
        if !started {
            return Ok(());
        }
        trace!("Drain requested");

        let outcome = self
            .shared
            .wait_for(|state| {
                let receiver = receiver_state_mut(state, link)?;
                match receiver.drain {
                    DrainState::Pending => {}
                    DrainState::Done => {
                        receiver.drain = DrainState::Idle;
                        return Ok(Some(Ok(())));
                    }
                    DrainState::TimedOut => {
                        receiver.drain = DrainState::Idle;
                        return Ok(Some(Err(ClientError::Engine(
                            EngineError::OperationTimedOut(format!(
                                "peer did not answer drain within {:?}",
                                timeout
                            )),
                        ))));
                    }
                    DrainState::Idle => return Ok(Some(Ok(()))),
                }
                check_usable(state, link)?;
                Ok(None)
            })
            .await?;
        self.shared
            .with_state(|state| {
                state.replenish(link);
                Ok(())
            })
            .await?;
        outcome
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
        let link = self.link;
        shut_link(&self.shared, link, close, error).await?;
        self.shared
            .with_state(|state| {
                state.receivers.remove(&link);
                Ok(())
            })
            .await
    }

    fn delivery(&self, delivery: ClaimedDelivery) -> StreamDelivery {
        StreamDelivery {
            shared: Arc::clone(&self.shared),
            link: self.link,
            delivery: delivery.id,
            tag: delivery.tag,
            message_format: delivery.message_format,
            settled: None,
        }
    }
}

struct ClaimedDelivery {
    id: DeliveryId,
    tag: Option<Bytes>,
    message_format: u32,
}

/// Take the oldest unclaimed delivery, failing if the link has closed.
fn claim(state: &mut DriverState, link: LinkId) -> Result<Option<ClaimedDelivery>> {
    let next = receiver_state_mut(state, link)?.unclaimed.pop_front();
    let Some(id) = next else {
        check_usable(state, link)?;
        return Ok(None);
    };
    state.engine.set_delivery_resource(id, link.get())?;
    let delivery = state
        .engine
        .delivery(id)
        .ok_or_else(|| EngineError::illegal_state("delivery no longer exists"))?;
    let claimed = ClaimedDelivery {
        id,
        tag: delivery.tag().cloned(),
        message_format: delivery.message_format(),
    };
    state.replenish(link);
    Ok(Some(claimed))
}

fn receiver_state(state: &DriverState, link: LinkId) -> Result<&ReceiverState> {
    state
        .receivers
        .get(&link)
        .ok_or_else(|| ClientError::ResourceClosed("receiver".to_string()))
}

fn receiver_state_mut(state: &mut DriverState, link: LinkId) -> Result<&mut ReceiverState> {
    state
        .receivers
        .get_mut(&link)
        .ok_or_else(|| ClientError::ResourceClosed("receiver".to_string()))
}

/// An incoming delivery whose payload is read as it arrives.
pub struct StreamDelivery {
    shared: Arc<Shared>,
    link: LinkId,
    delivery: DeliveryId,
    tag: Option<Bytes>,
    message_format: u32,
    /// Local state once settled here.
    settled: Option<Option<DeliveryState>>,
}

impl fmt::Debug for StreamDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamDelivery")
            .field("delivery", &self.delivery)
            .field("tag", &self.tag)
            .field("message_format", &self.message_format)
            .field("settled", &self.settled)
            .finish()
    }
}

impl StreamDelivery {
    pub fn id(&self) -> DeliveryId {
        self.delivery
    }

    pub fn tag(&self) -> Option<&Bytes> {
        self.tag.as_ref()
    }

    pub fn message_format(&self) -> u32 {
        self.message_format
    }

    /// The next chunk of payload, or `None` once the delivery is complete
    /// and fully read. Fails if the sender aborted the delivery.
    pub async fn read(&mut self) -> Result<Option<Bytes>> {
        let delivery_id = self.delivery;
        let link = self.link;
        self.shared
            .wait_for(|state| {
                let delivery = state
                    .engine
                    .delivery(delivery_id)
                    .ok_or_else(|| ClientError::ResourceClosed("delivery".to_string()))?;
                if delivery.is_aborted() {
                    return Err(ClientError::DeliveryAborted);
                }
                if delivery.available() > 0 {
                    return Ok(Some(Some(state.engine.read_bytes(delivery_id)?)));
                }
                if delivery.is_complete() {
                    return Ok(Some(None));
                }
                let link = link_state(state, link)?;
                if link.remote_state() == EndpointState::Closed {
                    return Err(ClientError::Engine(EngineError::RemotelyClosed(
                        link.endpoint().remote_error().cloned(),
                    )));
                }
                Ok(None)
            })
            .await
    }

    /// Read the remaining payload.
    pub async fn read_to_end(&mut self) -> Result<Bytes> {
        let mut payload = BytesMut::new();
        while let Some(chunk) = self.read().await? {
            payload.extend_from_slice(&chunk);
        }
        Ok(payload.freeze())
    }

    /// Read the remaining payload and decode it into message sections.
    pub async fn read_sections(&mut self) -> Result<Vec<Section>> {
        let payload = self.read_to_end().await?;
        decode_sections(&payload).map_err(|err| ClientError::Engine(err.into()))
    }

    /// Read the message and concatenate its Data sections.
    pub async fn read_body(&mut self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        for section in self.read_sections().await? {
            if let Section::Data(data) = section {
                body.extend_from_slice(&data);
            }
        }
        Ok(body.freeze())
    }

    pub async fn is_aborted(&self) -> Result<bool> {
        let delivery = self.delivery;
        self.shared
            .with_state(|state| {
                Ok(state
                    .engine
                    .delivery(delivery)
                    .map_or(false, |delivery| delivery.is_aborted()))
            })
            .await
    }

    pub fn is_settled(&self) -> bool {
        self.settled.is_some()
    }

    pub async fn accept(&mut self) -> Result<()> {
        self.disposition(Some(DeliveryState::Accepted), true).await
    }

    pub async fn release(&mut self) -> Result<()> {
        self.disposition(Some(DeliveryState::Released), true).await
    }

    /// Apply a local state and optionally settle.
    ///
    /// Settling again with the same state does nothing; a different state
    /// after settlement is an illegal state error.
    pub async fn disposition(
        &mut self,
        outcome: Option<DeliveryState>,
        settle: bool,
    ) -> Result<()> {
        if let Some(settled) = &self.settled {
            return match outcome {
                None => Ok(()),
                Some(outcome) if settled.as_ref() == Some(&outcome) => Ok(()),
                Some(_) => Err(EngineError::illegal_state(
                    "delivery is already settled with a different state",
                )
                .into()),
            };
        }
        let delivery_id = self.delivery;
        let link = self.link;
        let local = outcome.clone();
        self.shared
            .with_state(|state| {
                state.engine.disposition(delivery_id, outcome, settle)?;
                if settle {
                    let done = state.engine.delivery(delivery_id).map_or(false, |delivery| {
                        (delivery.is_complete() || delivery.is_aborted())
                            && delivery.available() == 0
                    });
                    if done {
                        state.engine.release_delivery(delivery_id)?;
                    }
                    state.replenish(link);
                }
                Ok(())
            })
            .await?;
        if settle {
            self.settled = Some(local);
        }
        Ok(())
    }
}
