//! TCP Receiver
//!
//! Accepts connections and reads 4-byte big-endian length-prefixed frames.
//! Each frame is handed to the owner together with a oneshot for the reply;
//! connections stay open so senders can pool them.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::Result;

pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// A request with a channel to send the response back
#[derive(Debug)]
pub struct TcpRequest {
    pub data: bytes::Bytes,
    pub peer_addr: SocketAddr,
    pub response_tx: oneshot::Sender<Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct ReceiverStats {
    pub connections_accepted: AtomicU64,
    pub messages_received: AtomicU64,
    pub receive_errors: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrozenReceiverStats {
    pub connections_accepted: u64,
    pub messages_received: u64,
    pub receive_errors: u64,
}

impl ReceiverStats {
    pub fn freeze(&self) -> FrozenReceiverStats {
        FrozenReceiverStats {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
        }
    }
}

/// TCP message receiver
#[derive(Debug)]
pub struct TcpReceiver {
    pub local_addr: SocketAddr,
    stats: Arc<ReceiverStats>,
    accept_task: JoinHandle<()>,
}

impl TcpReceiver {
    /// Bind and start accepting; frames are delivered on `message_tx`
    pub async fn start(bind_addr: SocketAddr, message_tx: mpsc::Sender<TcpRequest>) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| crate::transport_error!("Socket creation failed: {}", e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| crate::transport_error!("Socket creation failed: {}", e))?;

        let stats = Arc::new(ReceiverStats::default());
        let accept_task = tokio::spawn(accept_loop(listener, message_tx, stats.clone()));

        Ok(Self {
            local_addr,
            stats,
            accept_task,
        })
    }

    /// Get receiver statistics
    pub fn get_stats(&self) -> FrozenReceiverStats {
        self.stats.freeze()
    }
}

impl Drop for TcpReceiver {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    message_tx: mpsc::Sender<TcpRequest>,
    stats: Arc<ReceiverStats>,
) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("TCP accept failed: {}", e);
                continue;
            }
        };
        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(serve_connection(stream, peer_addr, message_tx.clone(), stats.clone()));
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    tx: mpsc::Sender<TcpRequest>,
    stats: Arc<ReceiverStats>,
) {
    loop {
        let mut len_bytes = [0u8; 4];
        if let Err(e) = stream.read_exact(&mut len_bytes).await {
            // clean close between frames
            if e.kind() != std::io::ErrorKind::UnexpectedEof {
                stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                debug!("Failed to read length prefix from {}: {}", peer_addr, e);
            }
            return;
        }

        let msg_len = u32::from_be_bytes(len_bytes) as usize;
        if msg_len > MAX_FRAME_LEN {
            stats.receive_errors.fetch_add(1, Ordering::Relaxed);
            warn!("Message too large from {}: {} bytes", peer_addr, msg_len);
            return;
        }

        let mut buf = vec![0u8; msg_len];
        if let Err(e) = stream.read_exact(&mut buf).await {
            stats.receive_errors.fetch_add(1, Ordering::Relaxed);
            warn!("Failed to read message data from {}: {}", peer_addr, e);
            return;
        }
        stats.messages_received.fetch_add(1, Ordering::Relaxed);
        trace!("{} byte frame from {}", msg_len, peer_addr);

        let (response_tx, response_rx) = oneshot::channel();
        let request = TcpRequest {
            data: bytes::Bytes::from(buf),
            peer_addr,
            response_tx,
        };
        if tx.send(request).await.is_err() {
            debug!("Request handler gone, closing connection from {}", peer_addr);
            return;
        }

        let response = match response_rx.await {
            Ok(data) => data,
            Err(_) => {
                debug!("Handler dropped response channel for {}", peer_addr);
                return;
            }
        };
        let len = response.len() as u32;
        let written = async {
            stream.write_all(&len.to_be_bytes()).await?;
            stream.write_all(&response).await?;
            stream.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!("Failed to write response to {}: {}", peer_addr, e);
            return;
        }
    }
}
