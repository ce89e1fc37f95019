//! Plain TCP transport
//!
//! Establishes and tears down the socket a protocol client frames its calls
//! over. The HQL wire encoding lives outside this crate, so the namespace RPCs
//! report [`TransportError::Unsupported`] here.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use super::{Connector, NamespaceId, Transport, TransportError};

/// Creates [`TcpTransport`]s for a fixed `host:port`
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Connector for TcpConnector {
    fn transport(&self) -> Box<dyn Transport> {
        Box::new(TcpTransport::new(self.target()))
    }

    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A TCP socket to the remote service
#[derive(Debug)]
pub struct TcpTransport {
    addr: String,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(addr: String) -> Self {
        Self { addr, stream: None }
    }

    fn connect_failed(&self, e: std::io::Error) -> TransportError {
        TransportError::ConnectFailed {
            addr: self.addr.clone(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&mut self, timeout: Duration) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Ok(());
        }

        let stream = tokio::time::timeout(timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                addr: self.addr.clone(),
                timeout,
            })?
            .map_err(|e| self.connect_failed(e))?;

        // Configure TCP keep-alive
        let std_stream = stream.into_std().map_err(|e| self.connect_failed(e))?;
        let socket = socket2::Socket::from(std_stream);
        socket.set_keepalive(true).map_err(|e| self.connect_failed(e))?;
        socket.set_nodelay(true).map_err(|e| self.connect_failed(e))?;
        let stream = TcpStream::from_std(socket.into()).map_err(|e| self.connect_failed(e))?;

        debug!(addr = %self.addr, "Transport connected");
        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            stream
                .shutdown()
                .await
                .map_err(|e| TransportError::Fault(e.to_string()))?;
            debug!(addr = %self.addr, "Transport closed");
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    async fn open_namespace(&mut self, _name: &str) -> Result<NamespaceId, TransportError> {
        if self.stream.is_none() {
            return Err(TransportError::NotConnected);
        }
        Err(TransportError::Unsupported("namespace RPCs need an HQL protocol client"))
    }

    async fn close_namespace(&mut self, _namespace: NamespaceId) -> Result<(), TransportError> {
        if self.stream.is_none() {
            return Err(TransportError::NotConnected);
        }
        Err(TransportError::Unsupported("namespace RPCs need an HQL protocol client"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_open_and_close_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let connector = TcpConnector::new("127.0.0.1", addr.port());
        let mut transport = connector.transport();
        assert!(!transport.is_active());

        transport.open(Duration::from_secs(5)).await.unwrap();
        assert!(transport.is_active());
        accept.await.unwrap().unwrap();

        transport.close().await.unwrap();
        assert!(!transport.is_active());

        // Closing twice is a no-op
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport = TcpConnector::new("127.0.0.1", port).transport();
        let err = transport.open(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectFailed { .. }));
        assert!(!transport.is_active());
    }

    #[tokio::test]
    async fn test_namespace_rpcs_unsupported() {
        let mut transport = TcpTransport::new("127.0.0.1:1".to_string());
        assert_eq!(
            transport.open_namespace("test").await.unwrap_err(),
            TransportError::NotConnected
        );
        assert_eq!(
            transport.close_namespace(NamespaceId(1)).await.unwrap_err(),
            TransportError::NotConnected
        );
    }

    #[test]
    fn test_connector_target() {
        assert_eq!(TcpConnector::new("localhost", 38080).target(), "localhost:38080");
    }
}
