//! A single live connection to the remote service

use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{NamespaceRegistry, SessionError, SessionId};
use crate::transport::{Connector, NamespaceId, Transport};

/// One connection to the remote service and the namespaces opened on it.
///
/// Created by the pool or directly via [`RemoteSession::connect`]. Always
/// finish with [`RemoteSession::close`]; dropping an open session closes the
/// socket but leaks its server-side namespace handles.
pub struct RemoteSession {
    id: SessionId,

    /// The underlying channel, owned exclusively by this session
    transport: Box<dyn Transport>,

    /// Connect timeout
    timeout: Duration,

    /// True between a successful open and close
    active: bool,

    namespaces: NamespaceRegistry,

    created_at: Instant,

    last_used: Instant,

    /// Number of namespace calls made through this session
    use_count: u64,
}

impl RemoteSession {
    /// Wrap an unopened transport
    pub fn new(transport: Box<dyn Transport>, timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            id: SessionId::next(),
            transport,
            timeout,
            active: false,
            namespaces: NamespaceRegistry::new(),
            created_at: now,
            last_used: now,
            use_count: 0,
        }
    }

    /// Create and open a session outside any pool
    pub async fn connect(connector: &dyn Connector, timeout: Duration) -> Result<Self, SessionError> {
        let mut session = Self::new(connector.transport(), timeout);
        session.open().await?;
        Ok(session)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// True between open and close
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Active and the transport still reports itself up
    pub fn is_connected(&self) -> bool {
        self.active && self.transport.is_active()
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Establish the transport. Opening an active session is a no-op.
    pub async fn open(&mut self) -> Result<(), SessionError> {
        if self.active {
            return Ok(());
        }

        // Any failure here means the connection never came up
        self.transport
            .open(self.timeout)
            .await
            .map_err(SessionError::Connection)?;

        self.active = true;
        self.last_used = Instant::now();
        debug!(session = %self.id, "Session opened");
        Ok(())
    }

    pub fn namespaces(&self) -> &NamespaceRegistry {
        &self.namespaces
    }

    /// Handle for `name`, opened remotely on first use
    pub async fn open_namespace(&mut self, name: &str) -> Result<NamespaceId, SessionError> {
        self.ensure_active()?;
        self.mark_used();
        self.namespaces.open(self.transport.as_mut(), name).await
    }

    /// Close `name`; `Ok(None)` if it was not open
    pub async fn close_namespace(&mut self, name: &str) -> Result<Option<NamespaceId>, SessionError> {
        self.ensure_active()?;
        self.mark_used();
        self.namespaces.close(self.transport.as_mut(), name).await
    }

    /// The transport, for RPCs issued by a protocol client
    pub fn transport_mut(&mut self) -> Result<&mut (dyn Transport + 'static), SessionError> {
        self.ensure_active()?;
        self.mark_used();
        Ok(self.transport.as_mut())
    }

    /// Close namespaces, then the transport, and report the first failure.
    ///
    /// The whole teardown always runs and the session ends inactive. Closing an
    /// inactive session is a no-op.
    pub async fn try_close(&mut self) -> Result<(), SessionError> {
        if !self.active {
            return Ok(());
        }

        let namespaces = self.namespaces.close_all(self.transport.as_mut()).await;
        let transport = self.transport.close().await;
        self.active = false;
        debug!(session = %self.id, uses = self.use_count, "Session closed");

        match (namespaces, transport) {
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(SessionError::from(e)),
            (Ok(_), Ok(())) => Ok(()),
        }
    }

    /// Close the session, logging rather than returning teardown failures
    pub async fn close(&mut self) {
        if let Err(e) = self.try_close().await {
            warn!(session = %self.id, error = %e, "Error while closing session");
        }
    }

    fn ensure_active(&self) -> Result<(), SessionError> {
        if self.active {
            Ok(())
        } else {
            Err(SessionError::Inactive(self.id))
        }
    }

    fn mark_used(&mut self) {
        self.last_used = Instant::now();
        self.use_count += 1;
    }
}

impl fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSession")
            .field("id", &self.id)
            .field("active", &self.active)
            .field("namespaces", &self.namespaces.len())
            .field("use_count", &self.use_count)
            .finish_non_exhaustive()
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        if self.active && !self.namespaces.is_empty() {
            warn!(
                session = %self.id,
                namespaces = self.namespaces.len(),
                "Session dropped without close; namespace handles leaked"
            );
        }
    }
}
