//! Bounded session pool with overflow
//!
//! This module provides the pool shared by all units of work:
//! - Lazy creation up to `capacity` pooled sessions, then up to
//!   `overflow_limit` overflow sessions for bursts
//! - FIFO hand-off to blocked acquirers once the ceiling is reached
//! - Discard instead of recycle for poisoned sessions
//! - Forced close of idle sessions on shutdown
//!
//! Idle queue, counters and waiters live under one mutex that is never held
//! across an await.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::guard::PooledSession;
use super::scope::SessionScope;
use crate::session::{RemoteSession, SessionError, SessionId};
use crate::transport::Connector;

/// Error types for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to open session: {0}")]
    Connect(#[source] SessionError),

    #[error("Pool is exhausted: no session became available within {0:?}")]
    Exhausted(Duration),

    #[error("Pool is closed")]
    Closed,

    #[error("{0} was not checked out from this pool or is already closed")]
    InvalidSession(SessionId),

    #[error("Failed to close idle session during shutdown: {0}")]
    Shutdown(#[source] SessionError),
}

/// Configuration for connection pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of sessions kept for reuse
    pub capacity: usize,

    /// Extra sessions allowed beyond `capacity` under load (0 disables)
    pub overflow_limit: usize,

    /// Timeout for opening a new session
    pub connect_timeout: Duration,

    /// How long `acquire` waits on an exhausted pool (None waits forever)
    pub acquire_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            overflow_limit: 10,
            connect_timeout: Duration::from_secs(5),
            acquire_timeout: None,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.capacity == 0 && self.overflow_limit == 0 {
            return Err(PoolError::InvalidConfig(
                "capacity and overflow_limit are both 0, no session could ever be opened".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(PoolError::InvalidConfig(
                "connect_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which allowance a session was created under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Counts against `capacity`; parked in the idle queue on release
    Pooled,

    /// Counts against `overflow_limit`; closed on release unless a pooled slot is free
    Overflow,
}

/// Statistics for a connection pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,

    pub overflow_limit: usize,

    /// Sessions parked in the idle queue
    pub idle: usize,

    /// Pooled sessions alive or being opened
    pub pooled: usize,

    /// Overflow sessions alive or being opened
    pub overflow: usize,

    /// Sessions currently held by callers
    pub checked_out: usize,

    /// Acquirers blocked on an exhausted pool
    pub waiting: usize,

    /// Total sessions opened
    pub total_created: u64,

    /// Total checkouts served by an existing session
    pub total_reused: u64,

    /// Total sessions closed instead of recycled
    pub total_discarded: u64,

    /// Failed attempts to open a session
    pub failed_connects: u64,

    pub closed: bool,
}

impl PoolStats {
    /// Sessions the pool accounts for, never above `capacity + overflow_limit`
    pub fn live(&self) -> usize {
        self.pooled + self.overflow
    }
}

/// What a blocked acquirer is handed
enum Grant {
    /// A healthy session, already registered as checked out
    Session(RemoteSession),

    /// A reserved slot; the acquirer opens the session itself
    Slot(SessionKind),
}

/// A session leaving the pool. It keeps counting against its slot until its
/// close has completed.
struct Discard {
    session: RemoteSession,
    slot: Option<SessionKind>,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<RemoteSession>,
    pooled: usize,
    overflow: usize,
    checked_out: HashMap<SessionId, SessionKind>,
    waiters: VecDeque<oneshot::Sender<Grant>>,
    closed: bool,
    total_created: u64,
    total_reused: u64,
    total_discarded: u64,
    failed_connects: u64,
}

impl PoolState {
    fn reserve(&mut self, config: &PoolConfig) -> Option<SessionKind> {
        if self.pooled < config.capacity {
            self.pooled += 1;
            Some(SessionKind::Pooled)
        } else if self.overflow < config.overflow_limit {
            self.overflow += 1;
            Some(SessionKind::Overflow)
        } else {
            None
        }
    }

    fn unreserve(&mut self, kind: SessionKind) {
        match kind {
            SessionKind::Pooled => self.pooled = self.pooled.saturating_sub(1),
            SessionKind::Overflow => self.overflow = self.overflow.saturating_sub(1),
        }
    }

    /// Hand `grant` to the oldest waiter still listening; gives it back if none is
    fn offer(&mut self, mut grant: Grant) -> Option<Grant> {
        if self.closed {
            return Some(grant);
        }
        while let Some(waiter) = self.waiters.pop_front() {
            let is_session = matches!(grant, Grant::Session(_));
            match waiter.send(grant) {
                Ok(()) => {
                    if is_session {
                        self.total_reused += 1;
                    }
                    return None;
                }
                Err(unclaimed) => grant = unclaimed,
            }
        }
        Some(grant)
    }

    /// Pass a freed slot to a waiter, or give it up.
    ///
    /// A slot handed to a waiter keeps its kind: the count for `kind` is
    /// released once for the closed session and taken again by the waiter's
    /// new session in the same step, so it does not change. With nobody
    /// waiting the count drops by one.
    fn free_slot(&mut self, kind: SessionKind) {
        if self.offer(Grant::Slot(kind)).is_some() {
            self.unreserve(kind);
        }
    }

    /// Route a healthy session back: to a waiter, else the idle queue.
    /// Returns the session if it has to be closed instead.
    fn check_in(&mut self, session: RemoteSession, capacity: usize) -> Option<Discard> {
        match self.offer(Grant::Session(session)) {
            Some(Grant::Session(session)) => self.park(session, capacity),
            _ => None,
        }
    }

    fn park(&mut self, session: RemoteSession, capacity: usize) -> Option<Discard> {
        let Some(kind) = self.checked_out.remove(&session.id()) else {
            return Some(Discard { session, slot: None });
        };

        let keep = !self.closed
            && match kind {
                SessionKind::Pooled => self.idle.len() < capacity,
                SessionKind::Overflow => self.pooled < capacity,
            };
        if !keep {
            self.total_discarded += 1;
            return Some(Discard {
                session,
                slot: Some(kind),
            });
        }

        if kind == SessionKind::Overflow {
            // A pooled session was discarded earlier; this one takes its slot
            self.unreserve(SessionKind::Overflow);
            self.pooled += 1;
            debug!(session = %session.id(), "Promoting overflow session to pooled");
        }
        debug!(session = %session.id(), idle = self.idle.len() + 1, "Parking idle session");
        self.idle.push_back(session);
        None
    }

    fn settle(&mut self, grant: Grant, capacity: usize) -> Option<Discard> {
        match grant {
            Grant::Slot(kind) => {
                self.free_slot(kind);
                None
            }
            Grant::Session(session) => self.check_in(session, capacity),
        }
    }
}

/// State shared between pool handles and checked-out guards
pub(super) struct Shared {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
}

enum Step {
    Reuse(RemoteSession),
    Discard(RemoteSession),
    Open(SessionKind),
    Wait(oneshot::Receiver<Grant>),
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn acquire(self: &Arc<Self>, timeout: Option<Duration>) -> Result<RemoteSession, PoolError> {
        loop {
            let step = {
                let mut state = self.lock();
                if state.closed {
                    return Err(PoolError::Closed);
                }

                match state.idle.pop_front() {
                    Some(session) if session.is_connected() => {
                        state.checked_out.insert(session.id(), SessionKind::Pooled);
                        state.total_reused += 1;
                        Step::Reuse(session)
                    }
                    Some(session) => {
                        state.total_discarded += 1;
                        Step::Discard(session)
                    }
                    None => match state.reserve(&self.config) {
                        Some(kind) => Step::Open(kind),
                        None => {
                            let (tx, rx) = oneshot::channel();
                            state.waiters.push_back(tx);
                            Step::Wait(rx)
                        }
                    },
                }
            };

            match step {
                Step::Reuse(session) => {
                    debug!(session = %session.id(), uses = session.use_count(), "Reusing idle session");
                    return Ok(session);
                }
                Step::Discard(session) => {
                    debug!(session = %session.id(), "Discarding disconnected idle session");
                    self.close_discarded(Discard {
                        session,
                        slot: Some(SessionKind::Pooled),
                    })
                    .await;
                }
                Step::Open(kind) => return self.open_reserved(kind).await,
                Step::Wait(rx) => return self.wait(rx, timeout).await,
            }
        }
    }

    /// Open a session into a slot already counted for it
    async fn open_reserved(&self, kind: SessionKind) -> Result<RemoteSession, PoolError> {
        let reservation = SlotHold::new(self, Some(kind));

        let mut session = RemoteSession::new(self.connector.transport(), self.config.connect_timeout);
        if let Err(e) = session.open().await {
            warn!(
                target = %self.connector.target(),
                kind = ?kind,
                error = %e,
                "Failed to open session"
            );
            self.lock().failed_connects += 1;
            return Err(PoolError::Connect(e));
        }

        let registered = {
            let mut state = self.lock();
            if state.closed {
                false
            } else {
                state.checked_out.insert(session.id(), kind);
                state.total_created += 1;
                true
            }
        };
        if !registered {
            session.close().await;
            return Err(PoolError::Closed);
        }
        reservation.keep();

        info!(
            session = %session.id(),
            kind = ?kind,
            target = %self.connector.target(),
            "Opened new session"
        );
        Ok(session)
    }

    async fn wait(
        self: &Arc<Self>,
        rx: oneshot::Receiver<Grant>,
        timeout: Option<Duration>,
    ) -> Result<RemoteSession, PoolError> {
        let mut waiter = Waiter {
            shared: self,
            rx: Some(rx),
        };
        debug!(timeout = ?timeout, "Pool exhausted, waiting for a session");

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, waiter.recv()).await {
                Ok(received) => received,
                // Something may have been handed over right at the deadline
                Err(_) => waiter.cancel().ok_or(PoolError::Exhausted(limit)),
            },
            None => waiter.recv().await,
        };

        match received? {
            Grant::Session(session) => Ok(session),
            Grant::Slot(kind) => self.open_reserved(kind).await,
        }
    }

    pub(super) async fn release(&self, session: RemoteSession, poisoned: bool) -> Result<(), PoolError> {
        let id = session.id();
        let (discard, result) = {
            let mut state = self.lock();
            let kind = state.checked_out.get(&id).copied();
            match kind {
                None => (
                    Some(Discard { session, slot: None }),
                    Err(PoolError::InvalidSession(id)),
                ),
                Some(kind) if poisoned || state.closed || !session.is_connected() => {
                    state.checked_out.remove(&id);
                    state.total_discarded += 1;
                    let result = if session.is_active() {
                        Ok(())
                    } else {
                        Err(PoolError::InvalidSession(id))
                    };
                    (
                        Some(Discard {
                            session,
                            slot: Some(kind),
                        }),
                        result,
                    )
                }
                Some(_) => (state.check_in(session, self.config.capacity), Ok(())),
            }
        };

        if let Some(discard) = discard {
            match &result {
                Err(_) => warn!(session = %id, "Released a session this pool does not own"),
                Ok(()) => debug!(session = %id, poisoned, "Discarding session"),
            }
            self.close_discarded(discard).await;
        }
        result
    }

    /// Close a discarded session, then free the slot it held
    async fn close_discarded(&self, discard: Discard) {
        let Discard { mut session, slot } = discard;
        let _slot = SlotHold::new(self, slot);
        session.close().await;
    }

    /// Give up a checked-out session whose outcome is unknown
    pub(super) fn discard_detached(self: &Arc<Self>, session: RemoteSession) {
        let slot = {
            let mut state = self.lock();
            let slot = state.checked_out.remove(&session.id());
            if slot.is_some() {
                state.total_discarded += 1;
            }
            slot
        };
        self.close_detached(Discard { session, slot });
    }

    fn return_grant(self: &Arc<Self>, grant: Grant) {
        let leftover = self.lock().settle(grant, self.config.capacity);
        if let Some(discard) = leftover {
            self.close_detached(discard);
        }
    }

    /// Close a discarded session from a synchronous context on the current
    /// runtime. The slot is freed once the close completes.
    fn close_detached(self: &Arc<Self>, discard: Discard) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let shared = Arc::clone(self);
                handle.spawn(async move { shared.close_discarded(discard).await });
            }
            Err(_) => {
                let Discard { session, slot } = discard;
                warn!(session = %session.id(), "No runtime to close session on, dropping it");
                drop(session);
                drop(SlotHold::new(self, slot));
            }
        }
    }

    async fn shutdown(&self) -> Result<(), PoolError> {
        let drained: Vec<RemoteSession> = {
            let mut state = self.lock();
            if !state.closed {
                info!(
                    idle = state.idle.len(),
                    checked_out = state.checked_out.len(),
                    "Shutting down connection pool"
                );
            }
            state.closed = true;
            // Blocked acquirers see their channel drop and fail with Closed
            state.waiters.clear();
            state.idle.drain(..).collect()
        };

        // Each idle session counts against its slot until it is closed
        let pending: Vec<(RemoteSession, SlotHold<'_>)> = drained
            .into_iter()
            .map(|session| (session, SlotHold::new(self, Some(SessionKind::Pooled))))
            .collect();

        let mut first_err = None;
        for (mut session, _slot) in pending {
            if let Err(e) = session.try_close().await {
                warn!(session = %session.id(), error = %e, "Error closing idle session");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(PoolError::Shutdown(e)),
            None => Ok(()),
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.idle.is_empty() {
            return;
        }
        warn!(idle = state.idle.len(), "Connection pool dropped without shutdown");
        for mut session in state.idle.drain(..) {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { session.close().await });
                }
                Err(_) => {
                    warn!(session = %session.id(), "No runtime to close session on, dropping it");
                }
            }
        }
    }
}

/// A slot counted for a session being opened or closed; freed on drop
/// unless kept
struct SlotHold<'a> {
    shared: &'a Shared,
    kind: Option<SessionKind>,
}

impl<'a> SlotHold<'a> {
    fn new(shared: &'a Shared, kind: Option<SessionKind>) -> Self {
        Self { shared, kind }
    }

    /// The slot now belongs to a registered session
    fn keep(mut self) {
        self.kind = None;
    }
}

impl Drop for SlotHold<'_> {
    fn drop(&mut self) {
        if let Some(kind) = self.kind.take() {
            self.shared.lock().free_slot(kind);
        }
    }
}

/// A blocked acquirer; whatever it was handed goes back if it gives up
struct Waiter<'a> {
    shared: &'a Arc<Shared>,
    rx: Option<oneshot::Receiver<Grant>>,
}

impl Waiter<'_> {
    async fn recv(&mut self) -> Result<Grant, PoolError> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(PoolError::Closed);
        };
        let received = rx.await;
        self.rx = None;
        received.map_err(|_| PoolError::Closed)
    }

    fn cancel(&mut self) -> Option<Grant> {
        let mut rx = self.rx.take()?;
        rx.close();
        rx.try_recv().ok()
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if let Some(grant) = self.cancel() {
            self.shared.return_grant(grant);
        }
    }
}

/// Session pool shared by all units of work. Clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<Shared>,
}

impl ConnectionPool {
    /// Create an empty pool; sessions are opened on demand
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Result<Self, PoolError> {
        config.validate()?;

        info!(
            capacity = config.capacity,
            overflow_limit = config.overflow_limit,
            target = %connector.target(),
            "Creating connection pool"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                connector,
                state: Mutex::new(PoolState::default()),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Check out a session, waiting up to the configured acquire timeout
    pub async fn acquire(&self) -> Result<RemoteSession, PoolError> {
        self.shared.acquire(self.shared.config.acquire_timeout).await
    }

    /// Check out a session, waiting at most `timeout` on an exhausted pool
    pub async fn acquire_timeout(&self, timeout: Option<Duration>) -> Result<RemoteSession, PoolError> {
        self.shared.acquire(timeout).await
    }

    /// Return a session. A poisoned session is closed, never recycled.
    pub async fn release(&self, session: RemoteSession, poisoned: bool) -> Result<(), PoolError> {
        self.shared.release(session, poisoned).await
    }

    /// Check out a session wrapped in a guard that discards it if dropped
    pub async fn get(&self) -> Result<PooledSession, PoolError> {
        self.get_timeout(self.shared.config.acquire_timeout).await
    }

    pub async fn get_timeout(&self, timeout: Option<Duration>) -> Result<PooledSession, PoolError> {
        let session = self.shared.acquire(timeout).await?;
        Ok(PooledSession::new(Arc::clone(&self.shared), session))
    }

    /// A per-unit-of-work binding to this pool
    pub fn scope(&self) -> SessionScope {
        SessionScope::new(self.clone())
    }

    /// Kind of a checked-out session
    pub fn kind_of(&self, id: SessionId) -> Option<SessionKind> {
        self.shared.lock().checked_out.get(&id).copied()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            capacity: self.shared.config.capacity,
            overflow_limit: self.shared.config.overflow_limit,
            idle: state.idle.len(),
            pooled: state.pooled,
            overflow: state.overflow,
            checked_out: state.checked_out.len(),
            waiting: state.waiters.iter().filter(|w| !w.is_closed()).count(),
            total_created: state.total_created,
            total_reused: state.total_reused,
            total_discarded: state.total_discarded,
            failed_connects: state.failed_connects,
            closed: state.closed,
        }
    }

    /// Close every idle session and refuse new checkouts.
    ///
    /// Checked-out sessions are closed when released. Every idle session is
    /// attempted; the first close failure is returned at the end.
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        self.shared.shutdown().await
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("target", &self.shared.connector.target())
            .field("stats", &self.stats())
            .finish()
    }
}
