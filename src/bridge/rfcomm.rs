//! RFCOMM channel bridge
//!
//! Writes are synchronous on this transport: each call hands at most one
//! MTU to the stack and returns the short count. Incoming chunks are
//! appended in arrival order.

use crate::cancel::{CancelToken, DropGuard};
use crate::error::{Result, StreamError};
use crate::stream::{InputDriver, OutputDriver, StreamHandle, StreamPair};
use crate::transport::rfcomm::{RfcommChannel, RfcommEvent};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Build a stream pair over an open channel
///
/// `early` holds data that arrived between the open request and its
/// completion.
pub(crate) fn rfcomm_pair(
    channel: Arc<dyn RfcommChannel>,
    mut events: mpsc::UnboundedReceiver<RfcommEvent>,
    early: Vec<Bytes>,
) -> StreamPair {
    let token = CancelToken::new();
    let guard = Arc::new(token.clone().drop_guard());
    let input = StreamHandle::new();
    let output = StreamHandle::new();
    for chunk in &early {
        input.append(chunk);
    }

    let task_input = input.clone();
    let task_output = output.clone();
    let task_channel = channel.clone();
    let shutdown = token.clone();
    tokio::spawn(async move {
        let mut remote_closed = false;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(RfcommEvent::Data(data)) => task_input.append(&data),
                    Some(RfcommEvent::OpenComplete { .. }) => {}
                    Some(RfcommEvent::Closed) | None => {
                        debug!("RFCOMM channel closed by remote");
                        remote_closed = true;
                        break;
                    }
                }
            }
        }
        if !remote_closed {
            task_channel.close();
        }
        task_input.end();
        task_output.end();
    });

    StreamPair::new(
        (
            input,
            Box::new(RfcommInput {
                _guard: guard.clone(),
            }),
        ),
        (
            output,
            Box::new(RfcommOutput {
                channel,
                _guard: guard,
            }),
        ),
        token,
    )
}

struct RfcommInput {
    _guard: Arc<DropGuard>,
}

impl InputDriver for RfcommInput {
    fn open(&mut self, handle: &StreamHandle) {
        // The channel is open by the time the pair exists
        handle.complete_open(Ok(()));
    }
}

struct RfcommOutput {
    channel: Arc<dyn RfcommChannel>,
    _guard: Arc<DropGuard>,
}

impl OutputDriver for RfcommOutput {
    fn open(&mut self, handle: &StreamHandle) {
        handle.complete_open(Ok(()));
        handle.signal_space();
    }

    fn write(&mut self, handle: &StreamHandle, data: &[u8]) -> Result<usize> {
        let n = self.channel.mtu().min(data.len());
        if n == 0 {
            return Ok(0);
        }
        self.channel
            .write_sync(&data[..n])
            .map_err(|status| StreamError::WriteFailed {
                reason: format!("RFCOMM write failed with status {}", status),
            })?;
        handle.signal_space();
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamEvent;
    use crate::transport::rfcomm::mock::MockDevice;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[tokio::test]
    async fn test_write_clamped_to_mtu() {
        let device = MockDevice::new(8);
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut pair = rfcomm_pair(device.channel.clone(), rx, Vec::new());
        pair.output.open();

        let data = b"0123456789ABCDEF!";
        assert_eq!(pair.output.write(data).unwrap(), 8);
        assert_eq!(pair.output.write(&data[8..]).unwrap(), 8);
        assert_eq!(pair.output.write(&data[16..]).unwrap(), 1);
        assert_eq!(
            device.channel.writes.lock().clone(),
            vec![b"01234567".to_vec(), b"89ABCDEF".to_vec(), b"!".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_write_failure_carries_status() {
        let device = MockDevice::new(8);
        *device.channel.write_status.lock() = Err(-536870186);
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut pair = rfcomm_pair(device.channel.clone(), rx, Vec::new());
        pair.output.open();

        let err = pair.output.write(b"x").unwrap_err();
        assert!(err.to_string().contains("-536870186"));
    }

    #[tokio::test]
    async fn test_early_and_later_data_in_arrival_order() {
        let device = MockDevice::new(8);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut pair = rfcomm_pair(
            device.channel.clone(),
            rx,
            vec![Bytes::from_static(b"ab")],
        );
        let mut events = pair.input.events();
        pair.input.open();
        tx.send(RfcommEvent::Data(Bytes::from_static(b"cd"))).unwrap();

        assert_eq!(events.recv().await, Some(StreamEvent::OpenCompleted));
        assert_eq!(events.recv().await, Some(StreamEvent::HasBytesAvailable));
        assert_eq!(events.recv().await, Some(StreamEvent::HasBytesAvailable));
        let mut buf = [0u8; 8];
        assert_eq!(pair.input.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"abcd");
    }

    #[tokio::test]
    async fn test_remote_close_ends_streams_without_closing_twice() {
        let device = MockDevice::new(8);
        let (tx, rx) = mpsc::unbounded_channel();
        let pair = rfcomm_pair(device.channel.clone(), rx, Vec::new());
        let mut events = pair.output.events();

        tx.send(RfcommEvent::Closed).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timeout");
        assert_eq!(event, Some(StreamEvent::EndEncountered));
        assert!(!device.channel.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_close_releases_channel() {
        let device = MockDevice::new(8);
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut pair = rfcomm_pair(device.channel.clone(), rx, Vec::new());

        pair.close();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !device.channel.closed.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("channel not closed");
    }
}
