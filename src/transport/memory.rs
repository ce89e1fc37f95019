//! In-process stand-in for the remote service
//!
//! [`MemoryService`] keeps the server-side view (live connections, open
//! namespaces) and counts every call so callers can assert on round trips.
//! Failures can be injected per operation.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{Connector, NamespaceId, Transport, TransportError};

const MEMORY_ADDR: &str = "memory";

/// Call counters for a [`MemoryService`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStats {
    /// Successful transport opens
    pub connects: u64,

    /// Transport closes
    pub disconnects: u64,

    /// Most connections that were open at the same time
    pub peak_connections: usize,

    /// Remote open-namespace calls that reached the service
    pub namespace_opens: u64,

    /// Remote close-namespace calls that reached the service, failed or not
    pub namespace_close_attempts: u64,

    /// Close-namespace calls that failed
    pub namespace_close_failures: u64,
}

#[derive(Debug, Default)]
struct ServiceState {
    next_connection: u64,
    next_namespace: i64,
    live_connections: HashSet<u64>,
    open_namespaces: HashMap<NamespaceId, String>,
    /// Connections numbered below this are severed
    severed_below: u64,
    refuse_connections: bool,
    connect_delay: Option<Duration>,
    close_delay: Option<Duration>,
    fail_transport_close: bool,
    fail_namespace_open: HashSet<String>,
    fail_namespace_close: HashSet<String>,
    stats: ServiceStats,
}

/// Shared handle to an in-memory remote service
#[derive(Debug, Clone, Default)]
pub struct MemoryService {
    state: Arc<Mutex<ServiceState>>,
}

impl MemoryService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reject every new connection with a connect error
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// Make each connect take `delay` before succeeding
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.lock().connect_delay = delay;
    }

    /// Make each transport close take `delay`; the connection stays live
    /// until the delay has passed
    pub fn set_close_delay(&self, delay: Option<Duration>) {
        self.lock().close_delay = delay;
    }

    /// Make transport close report a fault (the connection still goes away)
    pub fn fail_transport_close(&self, fail: bool) {
        self.lock().fail_transport_close = fail;
    }

    /// Reject opens of `name` with a remote error
    pub fn fail_namespace_open(&self, name: &str) {
        self.lock().fail_namespace_open.insert(name.to_string());
    }

    /// Reject closes of `name` with a remote error
    pub fn fail_namespace_close(&self, name: &str) {
        self.lock().fail_namespace_close.insert(name.to_string());
    }

    /// Break every connection opened so far; their next call faults
    pub fn sever_all(&self) {
        let mut state = self.lock();
        state.severed_below = state.next_connection;
    }

    pub fn stats(&self) -> ServiceStats {
        self.lock().stats.clone()
    }

    /// Connections opened and not yet closed
    pub fn live_connections(&self) -> usize {
        self.lock().live_connections.len()
    }

    /// Namespaces opened and not yet closed on the service side
    pub fn open_namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().open_namespaces.values().cloned().collect();
        names.sort();
        names
    }
}

impl Connector for MemoryService {
    fn transport(&self) -> Box<dyn Transport> {
        Box::new(MemoryTransport::new(self.clone()))
    }

    fn target(&self) -> String {
        MEMORY_ADDR.to_string()
    }
}

/// One connection to a [`MemoryService`]
#[derive(Debug)]
pub struct MemoryTransport {
    service: MemoryService,
    connection: Option<u64>,
}

impl MemoryTransport {
    pub fn new(service: MemoryService) -> Self {
        Self {
            service,
            connection: None,
        }
    }

    /// Connection number if open and not severed
    fn usable(&self, state: &ServiceState) -> Result<u64, TransportError> {
        let connection = self.connection.ok_or(TransportError::NotConnected)?;
        if connection < state.severed_below {
            return Err(TransportError::Fault("connection reset by peer".to_string()));
        }
        Ok(connection)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&mut self, timeout: Duration) -> Result<(), TransportError> {
        if self.connection.is_some() {
            return Ok(());
        }

        let delay = self.service.lock().connect_delay;
        if let Some(delay) = delay {
            if delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(TransportError::ConnectTimeout {
                    addr: MEMORY_ADDR.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(delay).await;
        }

        let mut state = self.service.lock();
        if state.refuse_connections {
            return Err(TransportError::ConnectFailed {
                addr: MEMORY_ADDR.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        let connection = state.next_connection;
        state.next_connection += 1;
        state.live_connections.insert(connection);
        state.stats.connects += 1;
        state.stats.peak_connections = state.stats.peak_connections.max(state.live_connections.len());
        self.connection = Some(connection);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let Some(connection) = self.connection else {
            return Ok(());
        };

        let delay = self.service.lock().close_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.connection = None;
        let mut state = self.service.lock();
        state.live_connections.remove(&connection);
        state.stats.disconnects += 1;
        if state.fail_transport_close {
            return Err(TransportError::Fault("error flushing frame on close".to_string()));
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.connection.is_some()
    }

    async fn open_namespace(&mut self, name: &str) -> Result<NamespaceId, TransportError> {
        let mut state = self.service.lock();
        self.usable(&state)?;
        if state.fail_namespace_open.contains(name) {
            return Err(TransportError::Remote(format!("namespace '{}' does not exist", name)));
        }
        state.next_namespace += 1;
        let id = NamespaceId(state.next_namespace);
        state.open_namespaces.insert(id, name.to_string());
        state.stats.namespace_opens += 1;
        Ok(id)
    }

    async fn close_namespace(&mut self, namespace: NamespaceId) -> Result<(), TransportError> {
        let mut state = self.service.lock();
        self.usable(&state)?;
        state.stats.namespace_close_attempts += 1;

        let name = state.open_namespaces.get(&namespace).cloned();
        match name {
            Some(name) if state.fail_namespace_close.contains(&name) => {
                state.stats.namespace_close_failures += 1;
                Err(TransportError::Remote(format!("failed to close namespace '{}'", name)))
            }
            Some(_) => {
                state.open_namespaces.remove(&namespace);
                Ok(())
            }
            None => {
                state.stats.namespace_close_failures += 1;
                Err(TransportError::Remote(format!("unknown namespace {}", namespace)))
            }
        }
    }
}
