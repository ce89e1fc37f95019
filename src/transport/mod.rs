//! Transport seam between sessions and the remote service
//!
//! A [`Transport`] is one framed RPC channel to the remote tabular-data
//! service. Besides open/close it carries the two namespace RPCs the session
//! layer needs; everything else the service offers is the protocol client's
//! business and goes through [`crate::session::RemoteSession::transport_mut`].
//!
//! Implementations:
//! - [`TcpTransport`] - real socket with connect timeout and keep-alive
//! - [`MemoryTransport`] - in-process service for tests and simulation

mod memory;
mod tcp;

pub use memory::{MemoryService, MemoryTransport, ServiceStats};
pub use tcp::{TcpConnector, TcpTransport};

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Identifier the remote service hands out for an opened namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespaceId(pub i64);

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ns#{}", self.0)
    }
}

/// Error type for transport operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },

    #[error("Connecting to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    /// The channel itself is broken; the connection must not be reused
    #[error("Transport fault: {0}")]
    Fault(String),

    /// The service rejected the call; the channel is still usable
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Transport is not open")]
    NotConnected,

    #[error("Operation not supported by this transport: {0}")]
    Unsupported(&'static str),
}

impl TransportError {
    /// Whether this error means the connection is known-bad
    pub fn is_fault(&self) -> bool {
        matches!(self, TransportError::Fault(_) | TransportError::NotConnected)
    }
}

/// One RPC channel to the remote service.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Establish the channel, failing if it is not up within `timeout`.
    async fn open(&mut self, timeout: Duration) -> Result<(), TransportError>;

    /// Tear the channel down. Closing a closed transport is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;

    fn is_active(&self) -> bool;

    async fn open_namespace(&mut self, name: &str) -> Result<NamespaceId, TransportError>;

    async fn close_namespace(&mut self, namespace: NamespaceId) -> Result<(), TransportError>;
}

/// Factory for unopened transports, one per new session
pub trait Connector: Send + Sync + fmt::Debug {
    fn transport(&self) -> Box<dyn Transport>;

    /// Human readable target, used in logs
    fn target(&self) -> String;
}
