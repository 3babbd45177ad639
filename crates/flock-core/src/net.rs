//! Async TCP helpers for daemon-to-daemon traffic.

use std::net::SocketAddr;
use std::time::Duration;

use flock_proto::{FlockError, FlockResult};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error};

/// Connect to a remote flock node.
pub async fn connect_to(addr: SocketAddr, timeout: Duration) -> FlockResult<TcpStream> {
    debug!("connecting to {}", addr);
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| FlockError::NetworkError)?
        .map_err(|_| FlockError::NetworkError)?;

    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Probe whether a peer is reachable. Reachable means the TCP three-way
/// handshake completed within the timeout; a connect that hangs or is
/// refused counts as unreachable.
pub async fn probe(addr: SocketAddr, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Create a TCP listener on the given address.
pub async fn create_listen_socket(addr: SocketAddr) -> FlockResult<TcpListener> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("failed to bind to {}: {}", addr, e);
        FlockError::SystemError
    })?;

    debug!("listening on {}", addr);
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_probe_reachable_listener() {
        let listener = create_listen_socket("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(probe(addr, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_probe_unreachable_port() {
        let listener = create_listen_socket("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(!probe(addr, Duration::from_secs(1)).await);
    }
}
