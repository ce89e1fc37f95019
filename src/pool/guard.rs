//! Checked-out session guard

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::warn;

use super::connection::{PoolError, Shared};
use super::scope::Outcome;
use crate::session::RemoteSession;

/// A session checked out of a [`super::ConnectionPool`].
///
/// Finish with [`PooledSession::release`]. If the guard is dropped instead
/// (early return, panic, cancelled task) the outcome is unknown, so the
/// session is discarded rather than recycled.
pub struct PooledSession {
    shared: Arc<Shared>,
    session: Option<RemoteSession>,
}

impl PooledSession {
    pub(super) fn new(shared: Arc<Shared>, session: RemoteSession) -> Self {
        Self {
            shared,
            session: Some(session),
        }
    }

    /// Hand the session back, recycling it unless `outcome` is a transport fault
    pub async fn release(mut self, outcome: Outcome) -> Result<(), PoolError> {
        match self.session.take() {
            Some(session) => self.shared.release(session, outcome.is_fault()).await,
            None => Ok(()),
        }
    }

    fn inner(&self) -> &RemoteSession {
        self.session.as_ref().expect("pooled session is present until released")
    }

    fn inner_mut(&mut self) -> &mut RemoteSession {
        self.session.as_mut().expect("pooled session is present until released")
    }
}

impl Deref for PooledSession {
    type Target = RemoteSession;

    fn deref(&self) -> &RemoteSession {
        self.inner()
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut RemoteSession {
        self.inner_mut()
    }
}

impl fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledSession").field(&self.session).finish()
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            warn!(session = %session.id(), "Pooled session dropped without release, discarding it");
            self.shared.discard_detached(session);
        }
    }
}
