//! Serial (TTY) transport
//!
//! Uses blocking threads for low-latency I/O:
//! - Reader thread: reads from the device, sends to channel
//! - Writer thread: receives from channel, writes to the device
//!
//! The transport stops when:
//! - `shutdown` fires
//! - The device disappears (detected via consecutive empty reads)
//! - Write error occurs

use super::{Transport, TransportChannels};
use crate::cancel::CancelToken;
use crate::config::TtyConfig;
use crate::constants::{CHANNEL_CAPACITY, IO_BUFFER_SIZE, SERIAL_DISCONNECT_THRESHOLD};
use crate::error::{Result, StreamError};
use bytes::Bytes;
use std::io::{Read, Write};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// An opened serial device
pub struct SerialTransport {
    path: String,
    port: Box<dyn serialport::SerialPort>,
}

/// Result of opening a device
pub struct SerialOpen {
    pub transport: SerialTransport,
    /// Set when the requested baud rate could not be applied
    pub warning: Option<String>,
}

impl SerialTransport {
    /// Open `path` and apply `baud` if one is requested
    ///
    /// The device is opened at the configured default rate first. Failing to
    /// switch to the requested rate leaves a working channel at the old rate
    /// and is reported as a warning rather than an error.
    pub fn open(path: &str, baud: Option<u32>, config: &TtyConfig) -> Result<SerialOpen> {
        let mut port = serialport::new(path, config.default_baud)
            .timeout(Duration::from_millis(config.read_timeout_ms))
            .open()
            .map_err(|e| map_open_error(path, e))?;

        let mut warning = None;
        if let Some(baud) = baud {
            if let Err(e) = port.set_baud_rate(baud) {
                let message = format!("{}: baud rate {} not applied: {}", path, baud, e);
                warn!("{}", message);
                warning = Some(message);
            }
        }
        debug!(
            "Opened {} at {} baud",
            path,
            port.baud_rate().unwrap_or(config.default_baud)
        );

        Ok(SerialOpen {
            transport: Self {
                path: path.to_string(),
                port,
            },
            warning,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

fn map_open_error(path: &str, e: serialport::Error) -> StreamError {
    match e.kind() {
        serialport::ErrorKind::NoDevice
        | serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => StreamError::NotFound {
            target: path.to_string(),
        },
        _ => StreamError::unable_to_connect(format!("{}: {}", path, e)),
    }
}

impl Transport for SerialTransport {
    fn spawn(self, shutdown: CancelToken) -> Result<TransportChannels> {
        let (in_tx, in_rx) = mpsc::channel::<std::io::Result<Bytes>>(CHANNEL_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);

        let port_read = self.port;
        let port_write = port_read
            .try_clone()
            .map_err(|e| StreamError::unable_to_connect(format!("{}: {}", self.path, e)))?;

        // Reader thread (blocking)
        let shutdown_reader = shutdown.clone();
        std::thread::spawn(move || {
            let mut port = port_read;
            let mut buf = [0u8; IO_BUFFER_SIZE];
            let mut consecutive_empty = 0u32;

            while !shutdown_reader.is_cancelled() {
                match port.read(&mut buf) {
                    Ok(n) if n > 0 => {
                        consecutive_empty = 0;
                        if in_tx
                            .blocking_send(Ok(Bytes::copy_from_slice(&buf[..n])))
                            .is_err()
                        {
                            // Channel closed, receiver dropped
                            break;
                        }
                    }
                    Ok(_) => {
                        // Zero bytes read - could be normal or device gone
                        consecutive_empty += 1;
                        if consecutive_empty > SERIAL_DISCONNECT_THRESHOLD {
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                        // Normal timeout, lets the loop observe shutdown
                        consecutive_empty = 0;
                    }
                    Err(e) => {
                        let _ = in_tx.blocking_send(Err(e));
                        break;
                    }
                }
            }
            // Channel will be closed when in_tx is dropped
        });

        // Writer thread (blocking)
        std::thread::spawn(move || {
            let mut port = port_write;

            while let Some(data) = out_rx.blocking_recv() {
                if shutdown.is_cancelled() {
                    break;
                }
                if let Err(e) = port.write_all(&data).and_then(|_| port.flush()) {
                    debug!("Serial write failed: {}", e);
                    break;
                }
            }
            // Channel will be closed when out_rx is dropped
        });

        Ok(TransportChannels {
            rx: in_rx,
            tx: out_tx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_error_mapping() {
        let err = map_open_error(
            "/dev/ttyS9",
            serialport::Error::new(serialport::ErrorKind::NoDevice, "gone"),
        );
        assert!(matches!(err, StreamError::NotFound { target } if target == "/dev/ttyS9"));

        let err = map_open_error(
            "/dev/ttyS9",
            serialport::Error::new(serialport::ErrorKind::InvalidInput, "bad"),
        );
        assert!(matches!(err, StreamError::UnableToConnect { .. }));
    }
}
