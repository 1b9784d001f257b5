//! Connections and sessions.

use std::fmt;
use std::sync::Arc;

use sluice_codec::ErrorCondition;
use sluice_engine::{
    Credentials, EndpointState, Engine, EngineConfiguration, EngineError, Lifecycle,
    SaslClientHandler, SessionId, TracingHandler,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::driver::{self, DriverState, Shared};
use crate::error::{ClientError, Result};
use crate::options::{StreamReceiverOptions, StreamSenderOptions};
use crate::receiver::StreamReceiver;
use crate::sender::StreamSender;

/// An AMQP connection running over a caller supplied transport.
///
/// The transport is driven by a background task until the connection
/// closes or fails. Handles created from the connection stay usable from
/// any task.
pub struct ClientConnection {
    shared: Arc<Shared>,
    driver: JoinHandle<()>,
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("driver_finished", &self.driver.is_finished())
            .finish()
    }
}

impl ClientConnection {
    /// Open a connection over `io` and wait for the peer's Open.
    pub async fn connect<T>(io: T, config: EngineConfiguration) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::start(io, config, None).await
    }

    /// Like [`connect`](Self::connect), negotiating SASL first.
    pub async fn connect_with_sasl<T>(
        io: T,
        config: EngineConfiguration,
        credentials: Credentials,
    ) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::start(io, config, Some(credentials)).await
    }

    async fn start<T>(
        io: T,
        config: EngineConfiguration,
        credentials: Option<Credentials>,
    ) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut engine = Engine::new(config);
        engine.add_handler(Box::new(TracingHandler));
        if let Some(credentials) = credentials {
            engine.add_handler(Box::new(SaslClientHandler::new(credentials)));
        }
        engine.open_connection()?;

        let shared = Shared::new(engine);
        let driver = driver::spawn(Arc::clone(&shared), io);
        let connection = Self { shared, driver };

        connection
            .shared
            .wait_for(|state| {
                let remote = state.engine.connection();
                remote_opened(remote.remote_state(), remote.endpoint().remote_error())
            })
            .await?;
        debug!(
            "Connected to {}",
            connection
                .shared
                .lock()
                .await
                .engine
                .connection()
                .remote_container_id()
                .unwrap_or("<unnamed>")
        );
        Ok(connection)
    }

    /// Begin a session and wait for the peer's Begin.
    pub async fn open_session(&self) -> Result<ClientSession> {
        let id = self
            .shared
            .with_state(|state| {
                let id = state.engine.create_session()?;
                state.engine.open_session(id)?;
                Ok(id)
            })
            .await?;
        self.shared
            .wait_for(|state| {
                let session = state
                    .engine
                    .session(id)
                    .ok_or_else(|| ClientError::ResourceClosed("session".to_string()))?;
                remote_opened(session.remote_state(), session.endpoint().remote_error())
            })
            .await?;
        Ok(ClientSession {
            shared: Arc::clone(&self.shared),
            id,
        })
    }

    /// The peer's container id once connected.
    pub async fn remote_container_id(&self) -> Option<String> {
        let state = self.shared.lock().await;
        state
            .engine
            .connection()
            .remote_container_id()
            .map(str::to_string)
    }

    /// The failure that ended the connection, if it has ended.
    pub async fn failure(&self) -> Option<ClientError> {
        self.shared.lock().await.check_failed().err()
    }

    pub async fn close(&self) -> Result<()> {
        self.close_with(None).await
    }

    /// Close the connection and wait for the peer to close its side.
    ///
    /// Closing an already closed connection succeeds; a connection that
    /// failed reports its failure.
    pub async fn close_with(&self, error: Option<ErrorCondition>) -> Result<()> {
        {
            let mut state = self.shared.lock().await;
            state.close_requested = true;
            if state.check_failed().is_ok() {
                state.engine.close_connection(error)?;
            }
        }
        self.shared.wake();
        let closed = self
            .shared
            .wait_for(|state| {
                Ok((state.engine.connection().remote_state() == EndpointState::Closed)
                    .then_some(()))
            })
            .await;
        match closed {
            Ok(())
            | Err(ClientError::ResourceClosed(_))
            | Err(ClientError::Engine(EngineError::RemotelyClosed(_))) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// A session on a [`ClientConnection`].
pub struct ClientSession {
    shared: Arc<Shared>,
    id: SessionId,
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession").field("id", &self.id).finish()
    }
}

impl ClientSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Attach a sender to `address`.
    pub async fn open_sender(
        &self,
        address: impl Into<String>,
        options: StreamSenderOptions,
    ) -> Result<StreamSender> {
        StreamSender::open(Arc::clone(&self.shared), self.id, address.into(), options).await
    }

    /// Attach a receiver to `address`.
    pub async fn open_receiver(
        &self,
        address: impl Into<String>,
        options: StreamReceiverOptions,
    ) -> Result<StreamReceiver> {
        StreamReceiver::open(Arc::clone(&self.shared), self.id, address.into(), options).await
    }

    /// End the session. Its links close with it.
    pub async fn close(&self) -> Result<()> {
        let id = self.id;
        self.shared
            .with_state(|state| Ok(state.engine.close_session(id, None)?))
            .await?;
        self.shared
            .wait_for(|state| {
                Ok(state
                    .engine
                    .session(id)
                    .map_or(true, |session| {
                        session.remote_state() == EndpointState::Closed
                    })
                    .then_some(()))
            })
            .await
    }
}

/// Shared wait condition for an endpoint the peer is expected to open.
pub(crate) fn remote_opened(
    remote: EndpointState,
    remote_error: Option<&ErrorCondition>,
) -> Result<Option<()>> {
    match remote {
        EndpointState::Idle => Ok(None),
        EndpointState::Active => Ok(Some(())),
        EndpointState::Closed => Err(ClientError::Engine(EngineError::RemotelyClosed(
            remote_error.cloned(),
        ))),
    }
}

/// Generated link name for an address.
pub(crate) fn link_name(state: &mut DriverState, role: &str, address: &str) -> String {
    state.link_names += 1;
    format!("{}:{}:{}", role, address, state.link_names)
}
