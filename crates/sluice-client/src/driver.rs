//! The task that owns a connection's engine and transport.
//!
//! Application calls lock the shared state, run engine operations and poke
//! the driver, which writes whatever output the engine produced. The driver
//! reads the transport, feeds the engine, dispatches engine events and then
//! bumps a change counter so that waiting callers re-check their condition.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use sluice_codec::{conditions, ErrorCondition};
use sluice_engine::{
    ConnectionEvent, DeliveryEvent, DeliveryId, Engine, EngineError, Lifecycle,
    LinkEvent, LinkId, SessionEvent,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex, MutexGuard, Notify};
use tracing::{debug, trace, warn};

use crate::error::{ClientError, Result};
use crate::options::CreditWindowPolicy;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Progress of a receiver's drain request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DrainState {
    Idle,
    Pending,
    Done,
    TimedOut,
}

/// Client side bookkeeping for a receiver link.
#[derive(Debug)]
pub(crate) struct ReceiverState {
    /// Deliveries whose first frame arrived but no caller has received yet.
    pub(crate) unclaimed: VecDeque<DeliveryId>,
    pub(crate) window: u32,
    pub(crate) policy: CreditWindowPolicy,
    pub(crate) drain: DrainState,
}

/// Everything guarded by the connection lock.
pub(crate) struct DriverState {
    pub(crate) engine: Engine,
    failure: Option<ClientError>,
    pub(crate) receivers: HashMap<LinkId, ReceiverState>,
    /// Sender links that settle locally once the peer settles.
    pub(crate) auto_settle: HashMap<LinkId, bool>,
    /// The application asked to close the connection.
    pub(crate) close_requested: bool,
    /// Counter for generated link names.
    pub(crate) link_names: u64,
}

impl DriverState {
    fn new(engine: Engine) -> Self {
        Self {
            engine,
            failure: None,
            receivers: HashMap::new(),
            auto_settle: HashMap::new(),
            close_requested: false,
            link_names: 0,
        }
    }

    /// The stored failure of the transport or engine, if any.
    pub(crate) fn check_failed(&self) -> Result<()> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        if let Some(cause) = self.engine.failure() {
            return Err(ClientError::Engine(EngineError::EngineFailed(Box::new(
                cause.clone(),
            ))));
        }
        Ok(())
    }

    /// Top up a receiver's credit according to its window policy.
    pub(crate) fn replenish(&mut self, link: LinkId) {
        let Some(receiver) = self.receivers.get(&link) else {
            return;
        };
        if receiver.drain == DrainState::Pending {
            return;
        }
        let Some(credit) = self.engine.link(link).map(|link| link.credit()) else {
            return;
        };
        if let Some(extra) = receiver
            .policy
            .top_up(receiver.window, credit, receiver.unclaimed.len())
        {
            trace!("Granting {} additional credit", extra);
            if let Err(err) = self.engine.add_credit(link, extra) {
                debug!("Credit top-up failed: {}", err);
            }
        }
    }

    fn dispatch_events(&mut self) {
        while let Some(event) = self.engine.poll_connection_event() {
            match event {
                ConnectionEvent::Opened => debug!("Connection opened by peer"),
                ConnectionEvent::Closed => {
                    debug!("Connection closed by peer");
                    if let Err(err) = self.engine.close_connection(None) {
                        debug!("Could not answer close: {}", err);
                    }
                }
                ConnectionEvent::SessionRemotelyOpened(session) => {
                    debug!("Refusing session begun by peer");
                    let refusal = refused("sessions are not accepted by this client");
                    if let Err(err) = self.engine.close_session(session, Some(refusal)) {
                        debug!("Could not refuse session: {}", err);
                    }
                }
                ConnectionEvent::Failed(err) => warn!("Connection failed: {}", err),
            }
        }

        while let Some(event) = self.engine.poll_session_event() {
            match event {
                SessionEvent::Opened(_) | SessionEvent::Closed(_) => {}
                SessionEvent::LinkRemotelyOpened(link) => {
                    debug!("Refusing link attached by peer");
                    let refusal = refused("links are not accepted by this client");
                    if let Err(err) = self.engine.close_link(link, Some(refusal)) {
                        debug!("Could not refuse link: {}", err);
                    }
                }
            }
        }

        while let Some(event) = self.engine.poll_link_event() {
            match event {
                LinkEvent::Opened(link) => self.replenish(link),
                LinkEvent::DrainRequested(link) => {
                    if let Err(err) = self.engine.drained(link) {
                        debug!("Could not answer drain: {}", err);
                    }
                }
                LinkEvent::Drained(link) => {
                    if let Some(receiver) = self.receivers.get_mut(&link) {
                        receiver.drain = DrainState::Done;
                    }
                }
                LinkEvent::DrainFailed(link) => {
                    if let Some(receiver) = self.receivers.get_mut(&link) {
                        receiver.drain = DrainState::TimedOut;
                    }
                }
                LinkEvent::Closed(_)
                | LinkEvent::Detached(_)
                | LinkEvent::CreditUpdated(_)
                | LinkEvent::Sendable(_) => {}
            }
        }

        while let Some(event) = self.engine.poll_delivery_event() {
            match event {
                DeliveryEvent::Read(delivery) => self.on_read(delivery),
                DeliveryEvent::Aborted(delivery) => self.on_aborted(delivery),
                DeliveryEvent::Updated(delivery) => self.on_updated(delivery),
            }
        }
    }

    fn on_read(&mut self, delivery_id: DeliveryId) {
        let Some(delivery) = self.engine.delivery(delivery_id) else {
            return;
        };
        if delivery.linked_resource().is_some() {
            return;
        }
        if let Some(receiver) = self.receivers.get_mut(&delivery.link()) {
            if !receiver.unclaimed.contains(&delivery_id) {
                receiver.unclaimed.push_back(delivery_id);
            }
        }
    }

    fn on_aborted(&mut self, delivery_id: DeliveryId) {
        let Some(delivery) = self.engine.delivery(delivery_id) else {
            return;
        };
        let link = delivery.link();
        if delivery.linked_resource().is_some() {
            // A claimed delivery reports the abort to its reader.
            return;
        }
        if let Some(receiver) = self.receivers.get_mut(&link) {
            receiver.unclaimed.retain(|&queued| queued != delivery_id);
        }
        trace!("Discarding aborted delivery");
        if let Err(err) = self.engine.release_delivery(delivery_id) {
            debug!("Could not release aborted delivery: {}", err);
        }
        self.replenish(link);
    }

    fn on_updated(&mut self, delivery_id: DeliveryId) {
        let Some(delivery) = self.engine.delivery(delivery_id) else {
            return;
        };
        let auto_settle = self
            .auto_settle
            .get(&delivery.link())
            .copied()
            .unwrap_or(false);
        if auto_settle && delivery.is_remotely_settled() && !delivery.is_settled() {
            if let Err(err) = self.engine.settle(delivery_id) {
                debug!("Could not settle delivery: {}", err);
            }
        }
    }
}

fn refused(description: &str) -> ErrorCondition {
    ErrorCondition::new(conditions::NOT_ALLOWED, description)
}

/// State shared between the driver task and client handles.
pub(crate) struct Shared {
    state: Mutex<DriverState>,
    changed: watch::Sender<u64>,
    wake: Notify,
}

impl Shared {
    pub(crate) fn new(engine: Engine) -> Arc<Self> {
        let (changed, _) = watch::channel(0);
        Arc::new(Self {
            state: Mutex::new(DriverState::new(engine)),
            changed,
            wake: Notify::new(),
        })
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, DriverState> {
        self.state.lock().await
    }

    /// Ask the driver to write pending output.
    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    fn bump(&self) {
        self.changed.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Run one operation against the engine and flush its output.
    pub(crate) async fn with_state<T>(
        &self,
        operation: impl FnOnce(&mut DriverState) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state.lock().await;
        state.check_failed()?;
        let result = operation(&mut state);
        let flush = state.engine.has_output();
        drop(state);
        if flush {
            self.wake();
        }
        result
    }

    /// Re-run `check` after every driver pass until it yields a value.
    pub(crate) async fn wait_for<T>(
        &self,
        mut check: impl FnMut(&mut DriverState) -> Result<Option<T>>,
    ) -> Result<T> {
        let mut changes = self.changed.subscribe();
        loop {
            let mut state = self.state.lock().await;
            state.check_failed()?;
            let outcome = check(&mut state);
            let flush = state.engine.has_output();
            drop(state);
            if flush {
                self.wake();
            }
            if let Some(value) = outcome? {
                return Ok(value);
            }
            if changes.changed().await.is_err() {
                return Err(ClientError::ConnectionFailed("driver stopped".to_string()));
            }
        }
    }

    /// [`wait_for`](Self::wait_for) bounded by an optional timeout.
    pub(crate) async fn wait_for_within<T>(
        &self,
        timeout: Option<Duration>,
        what: &str,
        check: impl FnMut(&mut DriverState) -> Result<Option<T>>,
    ) -> Result<T> {
        match timeout {
            None => self.wait_for(check).await,
            Some(timeout) => tokio::time::timeout(timeout, self.wait_for(check))
                .await
                .map_err(|_| {
                    ClientError::Engine(EngineError::OperationTimedOut(format!(
                        "{} did not complete within {:?}",
                        what, timeout
                    )))
                })?,
        }
    }

    /// Tick the engine, dispatch events and take output.
    async fn pass(&self) -> (Bytes, Option<Instant>, Option<ClientError>) {
        let mut state = self.state.lock().await;
        let deadline = if state.engine.is_failed() {
            None
        } else {
            match state.engine.tick(Instant::now()) {
                Ok(deadline) => deadline,
                Err(err) => {
                    debug!("Tick failed: {}", err);
                    None
                }
            }
        };
        state.dispatch_events();
        let output = state.engine.take_output();
        let connection = state.engine.connection().endpoint();
        let stop = if let Some(failure) = &state.failure {
            Some(failure.clone())
        } else if let Some(cause) = state.engine.failure() {
            Some(ClientError::Engine(cause.clone()))
        } else if connection.is_fully_closed() && connection.close_sent() {
            let remote_error = connection.remote_error().cloned();
            if state.close_requested && remote_error.is_none() {
                Some(ClientError::ResourceClosed("connection".to_string()))
            } else {
                Some(ClientError::Engine(EngineError::RemotelyClosed(remote_error)))
            }
        } else {
            None
        };
        (output, deadline, stop)
    }

    async fn fail(&self, failure: ClientError) {
        let mut state = self.state.lock().await;
        if state.failure.is_none() && state.engine.failure().is_none() {
            warn!("Connection driver stopping: {}", failure);
            state.failure = Some(failure);
        }
    }

    async fn ingest(&self, bytes: &[u8]) {
        let mut state = self.state.lock().await;
        if let Err(err) = state.engine.ingest(bytes) {
            debug!("Ingest failed: {}", err);
        }
    }
}

/// Spawn the driver for `io`.
pub(crate) fn spawn<T>(shared: Arc<Shared>, io: T) -> tokio::task::JoinHandle<()>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    tokio::spawn(async move {
        let stop = drive(&shared, io).await;
        shared.fail(stop).await;
        shared.bump();
    })
}

/// Run until the connection ends; returns what ended it.
async fn drive<T>(shared: &Shared, io: T) -> ClientError
where
    T: AsyncRead + AsyncWrite + Send,
{
    let (mut reader, mut writer) = tokio::io::split(io);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let (output, deadline, stop) = shared.pass().await;
        shared.bump();
        if !output.is_empty() {
            trace!("Writing {} bytes", output.len());
            if let Err(err) = write_all(&mut writer, &output).await {
                return ClientError::ConnectionFailed(err.to_string());
            }
        }
        if let Some(stop) = stop {
            return stop;
        }

        let timer = async {
            match deadline {
                Some(deadline) => {
                    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    return ClientError::ConnectionFailed("transport closed by peer".to_string());
                }
                Ok(n) => {
                    trace!("Read {} bytes", n);
                    shared.ingest(&buf[..n]).await;
                }
                Err(err) => return ClientError::ConnectionFailed(err.to_string()),
            },
            _ = shared.wake.notified() => {}
            _ = timer => {}
        }
    }
}

async fn write_all<W>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// The instant `timeout` from now, for engine operations taking a deadline.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    Instant::now() + timeout
}
