//! Per-unit-of-work session binding
//!
//! A host framework creates one [`SessionScope`] per unit of work (request,
//! task, job), calls [`SessionScope::acquire`] whenever the work needs the
//! remote service, and calls [`SessionScope::release`] once when it ends,
//! passing an [`Outcome`] derived from how it ended.

use std::error::Error;

use super::connection::{ConnectionPool, PoolError};
use super::guard::PooledSession;
use crate::session::SessionError;
use crate::transport::TransportError;

/// How a unit of work ended, as far as pooling is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Outcome {
    /// Recycle the session
    #[default]
    Normal,

    /// The transport is broken; discard the session
    TransportFault,
}

impl Outcome {
    pub fn is_fault(self) -> bool {
        self == Outcome::TransportFault
    }

    /// Classify an error by walking its source chain for a transport fault
    pub fn from_error(err: &(dyn Error + 'static)) -> Self {
        let mut current = Some(err);
        while let Some(err) = current {
            if let Some(e) = err.downcast_ref::<SessionError>() {
                if e.is_transport_fault() {
                    return Outcome::TransportFault;
                }
            }
            if let Some(e) = err.downcast_ref::<TransportError>() {
                if e.is_fault() {
                    return Outcome::TransportFault;
                }
            }
            current = err.source();
        }
        Outcome::Normal
    }

    /// Outcome of a unit of work that finished with `result`
    pub fn of<T, E>(result: &Result<T, E>) -> Self
    where
        E: Error + 'static,
    {
        match result {
            Ok(_) => Outcome::Normal,
            Err(e) => Outcome::from_error(e),
        }
    }
}

/// At most one checked-out session for one unit of work
#[derive(Debug)]
pub struct SessionScope {
    pool: ConnectionPool,
    slot: Option<PooledSession>,
}

impl SessionScope {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool, slot: None }
    }

    /// The session bound to this scope, checked out on first call
    pub async fn acquire(&mut self) -> Result<&mut PooledSession, PoolError> {
        let session = match self.slot.take() {
            Some(session) => session,
            None => self.pool.get().await?,
        };
        Ok(self.slot.insert(session))
    }

    pub fn is_bound(&self) -> bool {
        self.slot.is_some()
    }

    /// The bound session, without checking one out
    pub fn session(&mut self) -> Option<&mut PooledSession> {
        self.slot.as_mut()
    }

    /// End the unit of work. The scope is unbound even if the release fails;
    /// without a prior acquire this is a no-op.
    pub async fn release(&mut self, outcome: Outcome) -> Result<(), PoolError> {
        match self.slot.take() {
            Some(session) => session.release(outcome).await,
            None => Ok(()),
        }
    }
}
