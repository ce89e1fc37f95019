//! Namespace handle management for a single session
//!
//! Namespaces are opened on first use and cached by name, so repeated lookups
//! cost no round trip. The registry is not thread safe; its owning
//! [`super::RemoteSession`] is the only caller and passes its own transport in.

use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::SessionError;
use crate::transport::{NamespaceId, Transport};

/// Open namespaces of one session, keyed by name
#[derive(Debug, Default)]
pub struct NamespaceRegistry {
    entries: BTreeMap<String, NamespaceId>,
}

impl NamespaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached handle for `name`, if open
    pub fn get(&self, name: &str) -> Option<NamespaceId> {
        self.entries.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of the open namespaces, in order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Return the handle for `name`, opening it remotely on first use.
    ///
    /// Nothing is cached when the remote open fails.
    pub async fn open<T>(&mut self, transport: &mut T, name: &str) -> Result<NamespaceId, SessionError>
    where
        T: Transport + ?Sized,
    {
        if let Some(id) = self.entries.get(name) {
            return Ok(*id);
        }

        let id = transport.open_namespace(name).await?;
        self.entries.insert(name.to_string(), id);
        debug!(namespace = %name, id = %id, "Opened namespace");
        Ok(id)
    }

    /// Close `name` remotely and forget it.
    ///
    /// Returns `Ok(None)` if it was never opened or is already closed. A remote
    /// failure is reported but the entry stays removed.
    pub async fn close<T>(&mut self, transport: &mut T, name: &str) -> Result<Option<NamespaceId>, SessionError>
    where
        T: Transport + ?Sized,
    {
        let Some(id) = self.entries.remove(name) else {
            return Ok(None);
        };

        transport.close_namespace(id).await.map_err(|e| {
            warn!(namespace = %name, id = %id, error = %e, "Failed to close namespace");
            SessionError::from(e)
        })?;

        debug!(namespace = %name, id = %id, "Closed namespace");
        Ok(Some(id))
    }

    /// Close every open namespace, attempting each exactly once.
    ///
    /// Keeps going past failures and returns the first one once the registry
    /// is empty. On success returns how many namespaces were closed.
    pub async fn close_all<T>(&mut self, transport: &mut T) -> Result<usize, SessionError>
    where
        T: Transport + ?Sized,
    {
        let mut first_err = None;
        let mut closed = 0;

        for (name, id) in std::mem::take(&mut self.entries) {
            match transport.close_namespace(id).await {
                Ok(()) => {
                    debug!(namespace = %name, id = %id, "Closed namespace");
                    closed += 1;
                }
                Err(e) => {
                    warn!(namespace = %name, id = %id, error = %e, "Failed to close namespace");
                    if first_err.is_none() {
                        first_err = Some(SessionError::from(e));
                    }
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Connector, MemoryService};
    use std::time::Duration;

    async fn open_transport(service: &MemoryService) -> Box<dyn Transport> {
        let mut transport = service.transport();
        transport.open(Duration::from_secs(1)).await.unwrap();
        transport
    }

    #[tokio::test]
    async fn test_open_is_cached() {
        let service = MemoryService::new();
        let mut transport = open_transport(&service).await;
        let mut registry = NamespaceRegistry::new();

        let first = registry.open(transport.as_mut(), "test").await.unwrap();
        let second = registry.open(transport.as_mut(), "test").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(service.stats().namespace_opens, 1);
        assert_eq!(registry.get("test"), Some(first));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_open_is_not_cached() {
        let service = MemoryService::new();
        service.fail_namespace_open("missing");
        let mut transport = open_transport(&service).await;
        let mut registry = NamespaceRegistry::new();

        let err = registry.open(transport.as_mut(), "missing").await.unwrap_err();
        assert!(matches!(err, SessionError::Remote(_)));
        assert!(registry.is_empty());
        assert_eq!(registry.get("missing"), None);
    }

    #[tokio::test]
    async fn test_close_unknown_is_noop() {
        let service = MemoryService::new();
        let mut transport = open_transport(&service).await;
        let mut registry = NamespaceRegistry::new();

        let closed = registry.close(transport.as_mut(), "never-opened").await.unwrap();
        assert_eq!(closed, None);
        assert_eq!(service.stats().namespace_close_attempts, 0);
    }

    #[tokio::test]
    async fn test_close_returns_handle_and_reopen_goes_remote() {
        let service = MemoryService::new();
        let mut transport = open_transport(&service).await;
        let mut registry = NamespaceRegistry::new();

        let id = registry.open(transport.as_mut(), "test").await.unwrap();
        assert_eq!(registry.close(transport.as_mut(), "test").await.unwrap(), Some(id));
        assert_eq!(registry.close(transport.as_mut(), "test").await.unwrap(), None);

        let reopened = registry.open(transport.as_mut(), "test").await.unwrap();
        assert_ne!(reopened, id);
        assert_eq!(service.stats().namespace_opens, 2);
    }

    #[tokio::test]
    async fn test_failed_close_still_forgets_entry() {
        let service = MemoryService::new();
        service.fail_namespace_close("sticky");
        let mut transport = open_transport(&service).await;
        let mut registry = NamespaceRegistry::new();

        registry.open(transport.as_mut(), "sticky").await.unwrap();
        let err = registry.close(transport.as_mut(), "sticky").await.unwrap_err();
        assert!(matches!(err, SessionError::Remote(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_close_all_attempts_every_entry() {
        let service = MemoryService::new();
        service.fail_namespace_close("a");
        service.fail_namespace_close("b");
        let mut transport = open_transport(&service).await;
        let mut registry = NamespaceRegistry::new();

        for name in ["a", "b", "c", "d"] {
            registry.open(transport.as_mut(), name).await.unwrap();
        }

        let err = registry.close_all(transport.as_mut()).await.unwrap_err();
        assert!(matches!(err, SessionError::Remote(_)));
        assert!(registry.is_empty());

        let stats = service.stats();
        assert_eq!(stats.namespace_close_attempts, 4);
        assert_eq!(stats.namespace_close_failures, 2);
        assert_eq!(service.open_namespaces(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_close_all_counts() {
        let service = MemoryService::new();
        let mut transport = open_transport(&service).await;
        let mut registry = NamespaceRegistry::new();

        registry.open(transport.as_mut(), "x").await.unwrap();
        registry.open(transport.as_mut(), "y").await.unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["x", "y"]);

        assert_eq!(registry.close_all(transport.as_mut()).await.unwrap(), 2);
        assert_eq!(registry.close_all(transport.as_mut()).await.unwrap(), 0);
    }
}
