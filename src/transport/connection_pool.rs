//! TCP connection pool for request-response communication
//!
//! Keeps a few idle connections per peer. Peers are not registered up front;
//! a pool entry appears on first use and is dropped by `remove_peer`.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

use super::tcp_receiver::MAX_FRAME_LEN;
use crate::error::{RepliconError, Result};

const MAX_IDLE_PER_PEER: usize = 4;

#[derive(Debug, Default)]
pub struct PoolStats {
    pub requests_sent: AtomicU64,
    pub responses_received: AtomicU64,
    pub connection_errors: AtomicU64,
    pub timeout_errors: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrozenPoolStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub connection_errors: u64,
    pub timeout_errors: u64,
}

impl PoolStats {
    pub fn freeze(&self) -> FrozenPoolStats {
        FrozenPoolStats {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            timeout_errors: self.timeout_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub struct TcpConnectionPool {
    idle: DashMap<SocketAddr, Arc<Mutex<Vec<TcpStream>>>>,
    connect_timeout: Duration,
    request_timeout: Duration,
    stats: Arc<PoolStats>,
}

impl TcpConnectionPool {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            idle: DashMap::new(),
            connect_timeout,
            request_timeout,
            stats: Arc::new(PoolStats::default()),
        }
    }

    /// Send a request and wait for the reply using the default request timeout
    pub async fn request(&self, target: SocketAddr, data: &[u8]) -> Result<Vec<u8>> {
        self.request_with_timeout(target, data, self.request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        target: SocketAddr,
        data: &[u8],
        request_timeout: Duration,
    ) -> Result<Vec<u8>> {
        self.stats.requests_sent.fetch_add(1, Ordering::Relaxed);

        if let Some(stream) = self.take_idle(target).await {
            // a pooled connection may have been closed by the peer since last use
            match self.exchange(stream, data, request_timeout).await {
                Ok((stream, reply)) => {
                    self.give_back(target, stream).await;
                    return Ok(reply);
                }
                Err(e) => debug!("Pooled connection to {} failed, reconnecting: {}", target, e),
            }
        }

        let stream = self.connect(target).await?;
        let (stream, reply) = self.exchange(stream, data, request_timeout).await?;
        self.give_back(target, stream).await;
        Ok(reply)
    }

    /// Forget idle connections to a departed peer
    pub fn remove_peer(&self, target: &SocketAddr) {
        self.idle.remove(target);
    }

    pub fn get_stats(&self) -> FrozenPoolStats {
        self.stats.freeze()
    }

    async fn connect(&self, target: SocketAddr) -> Result<TcpStream> {
        match timeout(self.connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => {
                debug!("Created new TCP connection to {}", target);
                Ok(stream)
            }
            Ok(Err(e)) => {
                self.stats.connection_errors.fetch_add(1, Ordering::Relaxed);
                Err(crate::transport_error!("Failed to connect to {}: {}", target, e))
            }
            Err(_) => {
                self.stats.timeout_errors.fetch_add(1, Ordering::Relaxed);
                Err(crate::transport_error!("Connection timeout to {}", target))
            }
        }
    }

    async fn exchange(
        &self,
        mut stream: TcpStream,
        data: &[u8],
        request_timeout: Duration,
    ) -> Result<(TcpStream, Vec<u8>)> {
        let outcome = timeout(request_timeout, async {
            stream.write_all(&(data.len() as u32).to_be_bytes()).await?;
            stream.write_all(data).await?;

            let mut len_bytes = [0u8; 4];
            stream.read_exact(&mut len_bytes).await?;
            let reply_len = u32::from_be_bytes(len_bytes) as usize;
            if reply_len > MAX_FRAME_LEN {
                return Err(crate::transport_error!("Response too large: {} bytes", reply_len));
            }
            let mut reply = vec![0u8; reply_len];
            stream.read_exact(&mut reply).await?;
            Ok::<_, RepliconError>(reply)
        })
        .await;

        match outcome {
            Ok(Ok(reply)) => {
                self.stats.responses_received.fetch_add(1, Ordering::Relaxed);
                Ok((stream, reply))
            }
            Ok(Err(e)) => {
                self.stats.connection_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
            Err(_) => {
                self.stats.timeout_errors.fetch_add(1, Ordering::Relaxed);
                Err(crate::transport_error!("Request timed out after {:?}", request_timeout))
            }
        }
    }

    async fn take_idle(&self, target: SocketAddr) -> Option<TcpStream> {
        let slot = self.idle.get(&target).map(|entry| entry.value().clone())?;
        let mut streams = slot.lock().await;
        streams.pop()
    }

    async fn give_back(&self, target: SocketAddr, stream: TcpStream) {
        let slot = self
            .idle
            .entry(target)
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .value()
            .clone();
        let mut streams = slot.lock().await;
        if streams.len() < MAX_IDLE_PER_PEER {
            streams.push(stream);
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::transport::tcp_receiver::TcpReceiver;

    async fn echo_server() -> TcpReceiver {
        let (tx, mut rx) = mpsc::channel(16);
        let receiver = TcpReceiver::start("127.0.0.1:0".parse().unwrap(), tx)
            .await
            .unwrap();
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let _ = req.response_tx.send(req.data.to_vec());
            }
        });
        receiver
    }

    #[tokio::test]
    async fn test_connection_reused() {
        let server = echo_server().await;
        let pool = TcpConnectionPool::new(Duration::from_millis(500), Duration::from_secs(1));

        assert_eq!(pool.request(server.local_addr, b"one").await.unwrap(), b"one");
        assert_eq!(pool.request(server.local_addr, b"two").await.unwrap(), b"two");

        assert_eq!(server.get_stats().connections_accepted, 1);
        assert_eq!(pool.get_stats().responses_received, 2);
    }

    #[tokio::test]
    async fn test_unreachable_peer_errors() {
        let pool = TcpConnectionPool::new(Duration::from_millis(200), Duration::from_millis(200));
        // bind then drop to get a port nobody listens on
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        assert!(pool.request(addr, b"x").await.is_err());
    }
}
