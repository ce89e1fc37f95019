//! Live sessions to the remote service
//!
//! This module provides:
//! - [`RemoteSession`]: one open transport plus its namespace handles
//! - [`NamespaceRegistry`]: lazily opened, deterministically closed namespaces
//! - [`SessionError`]: the classification the pool relies on to decide between
//!   recycling and discarding a session

pub mod namespace;
pub mod remote;

pub use namespace::NamespaceRegistry;
pub use remote::RemoteSession;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::transport::TransportError;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Error types for session operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The transport could not be opened
    #[error("Connection error: {0}")]
    Connection(#[source] TransportError),

    /// A namespace call failed on an otherwise healthy connection
    #[error("Remote error: {0}")]
    Remote(#[source] TransportError),

    /// The connection is known-bad and must be discarded
    #[error("Transport fault: {0}")]
    TransportFault(#[source] TransportError),

    #[error("{0} is closed")]
    Inactive(SessionId),
}

impl SessionError {
    /// Whether the session that produced this error must not be recycled
    pub fn is_transport_fault(&self) -> bool {
        matches!(self, SessionError::TransportFault(_) | SessionError::Inactive(_))
    }
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectFailed { .. } | TransportError::ConnectTimeout { .. } => {
                SessionError::Connection(err)
            }
            TransportError::Fault(_) | TransportError::NotConnected => {
                SessionError::TransportFault(err)
            }
            TransportError::Remote(_) | TransportError::Unsupported(_) => SessionError::Remote(err),
        }
    }
}
