//! Channel bridge
//!
//! Turns any `TransportChannels` (TCP socket, TTY, L2CAP channel,
//! accessory session) into a stream pair. A pump task moves received
//! bytes into the input FIFO; writes go straight into the transport's
//! bounded channel.
//!
//! The transport stopping (its `rx` closing) or the link token firing ends
//! both streams.

use crate::cancel::{CancelToken, DropGuard};
use crate::error::{Result, StreamError};
use crate::stream::{InputDriver, OutputDriver, PendingWrite, StreamHandle, StreamPair};
use crate::transport::TransportChannels;
use bytes::Bytes;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// Objects that must stay alive as long as the bridge runs
pub type Keepalive = Box<dyn Any + Send>;

/// Build a stream pair on top of a spawned transport
///
/// `link` must be the token the transport was spawned with: closing both
/// streams fires it, which stops the transport. Must be called from within
/// a tokio runtime.
pub fn channel_pair(
    channels: TransportChannels,
    link: CancelToken,
    keepalive: Option<Keepalive>,
) -> StreamPair {
    let TransportChannels { mut rx, tx } = channels;
    let input = StreamHandle::new();
    let output = StreamHandle::new();
    let guard = Arc::new(link.clone().drop_guard());

    let pump_input = input.clone();
    let pump_output = output.clone();
    let shutdown = link.clone();
    tokio::spawn(async move {
        let _keepalive = keepalive;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                item = rx.recv() => match item {
                    Some(Ok(data)) => pump_input.append(&data),
                    Some(Err(e)) => pump_input.fail(e.to_string()),
                    None => {
                        debug!("Transport stopped");
                        break;
                    }
                }
            }
        }
        pump_input.end();
        pump_output.end();
    });

    StreamPair::new(
        (
            input,
            Box::new(ChannelInput {
                _guard: guard.clone(),
            }),
        ),
        (
            output,
            Box::new(ChannelOutput {
                tx: Some(tx),
                runtime: tokio::runtime::Handle::current(),
                _guard: guard,
            }),
        ),
        link,
    )
}

struct ChannelInput {
    _guard: Arc<DropGuard>,
}

impl InputDriver for ChannelInput {
    fn open(&mut self, handle: &StreamHandle) {
        // The transport is already running
        handle.complete_open(Ok(()));
    }
}

struct ChannelOutput {
    tx: Option<mpsc::Sender<Bytes>>,
    runtime: tokio::runtime::Handle,
    _guard: Arc<DropGuard>,
}

impl OutputDriver for ChannelOutput {
    fn open(&mut self, handle: &StreamHandle) {
        handle.complete_open(Ok(()));
        handle.signal_space();
    }

    fn write(&mut self, handle: &StreamHandle, data: &[u8]) -> Result<usize> {
        let tx = self.tx.as_ref().ok_or(StreamError::Disconnected)?;
        match tx.try_send(Bytes::copy_from_slice(data)) {
            Ok(()) => {
                handle.signal_space();
                Ok(data.len())
            }
            Err(TrySendError::Full(_)) => {
                // Hold the slot until the transport drains, then announce space
                handle.set_pending(PendingWrite::InFlight)?;
                let tx = tx.clone();
                let handle = handle.clone();
                self.runtime.spawn(async move {
                    if let Ok(permit) = tx.reserve().await {
                        drop(permit);
                        handle.clear_pending();
                        handle.signal_space();
                    }
                });
                Ok(0)
            }
            Err(TrySendError::Closed(_)) => {
                handle.end();
                Err(StreamError::Disconnected)
            }
        }
    }

    fn close(&mut self) {
        // Dropping the sender lets the transport close its write side
        self.tx = None;
    }
}
