//! TCP transport
//!
//! The socket is connected up front (so a failed connect surfaces as one
//! error value), then split into two async tasks:
//! - RX task: reads from the socket, sends to channel
//! - TX task: receives from channel, writes to the socket

use super::{Transport, TransportChannels};
use crate::cancel::CancelToken;
use crate::config::TcpConfig;
use crate::constants::{CHANNEL_CAPACITY, IO_BUFFER_SIZE};
use crate::error::{Result, StreamError};
use bytes::Bytes;
use socket2::SockRef;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A connected TCP socket, ready to spawn
pub struct TcpTransport {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpTransport {
    /// Resolve `host:port` and connect
    ///
    /// Resolution failures, refusals and unreachable hosts all map to
    /// `UnableToConnect`, carrying the OS error code when there is one.
    pub async fn connect(host: &str, port: u16, config: &TcpConfig) -> Result<Self> {
        let connect = TcpStream::connect((host, port));
        let result = match config.connect_timeout() {
            Some(limit) => match tokio::time::timeout(limit, connect).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(StreamError::unable_to_connect(format!(
                        "{}:{}: connect timed out after {} ms",
                        host,
                        port,
                        limit.as_millis()
                    )))
                }
            },
            None => connect.await,
        };
        let stream = result.map_err(|e| StreamError::UnableToConnect {
            reason: format!("{}:{}: {}", host, port, e),
            status: e.raw_os_error(),
        })?;

        configure_socket(&stream, config);

        let peer = stream
            .peer_addr()
            .map_err(|e| StreamError::unable_to_connect(e.to_string()))?;
        debug!("TCP connected to {}", peer);

        Ok(Self { stream, peer })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

/// Apply socket options; failures are logged, not fatal
fn configure_socket(stream: &TcpStream, config: &TcpConfig) {
    let socket = SockRef::from(stream);
    if config.nodelay {
        if let Err(e) = socket.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
    }
    if let Err(e) = socket.set_keepalive(true) {
        warn!("Failed to set SO_KEEPALIVE: {}", e);
    }
}

impl Transport for TcpTransport {
    fn spawn(self, shutdown: CancelToken) -> Result<TransportChannels> {
        let (in_tx, in_rx) = mpsc::channel::<std::io::Result<Bytes>>(CHANNEL_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);

        let (mut reader, mut writer) = self.stream.into_split();

        // RX task
        let shutdown_rx = shutdown.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; IO_BUFFER_SIZE];
            loop {
                tokio::select! {
                    _ = shutdown_rx.cancelled() => break,
                    result = reader.read(&mut buf) => match result {
                        Ok(0) => {
                            debug!("TCP peer closed the connection");
                            break;
                        }
                        Ok(n) => {
                            if in_tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                                // Channel closed, receiver dropped
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = in_tx.send(Err(e)).await;
                            break;
                        }
                    }
                }
            }
            // Channel will be closed when in_tx is dropped
        });

        // TX task
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    data = out_rx.recv() => match data {
                        Some(data) => {
                            if let Err(e) = writer.write_all(&data).await {
                                debug!("TCP write failed: {}", e);
                                break;
                            }
                        }
                        // Sender dropped: the output stream was closed
                        None => break,
                    }
                }
            }
            let _ = writer.shutdown().await;
        });

        Ok(TransportChannels {
            rx: in_rx,
            tx: out_tx,
        })
    }
}
