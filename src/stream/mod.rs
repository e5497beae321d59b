//! Stream abstraction
//!
//! Every transport ends up as one `StreamPair`: an `InputStream` the
//! caller reads from and an `OutputStream` it writes to. Both are
//! non-blocking; readiness is signalled through `StreamEvent`s.
//!
//! The transport-specific part of each direction is a driver
//! (`InputDriver`/`OutputDriver`) supplied by a bridge. The driver is
//! told when the caller opens, writes and closes; everything else flows
//! through the shared `StreamHandle`.

mod handle;
pub mod stats;

pub use self::handle::{EventReceiver, StreamEvent, StreamHandle, StreamStatus};
pub(crate) use self::handle::PendingWrite;
pub use stats::{Stats, StatsSnapshot};

use crate::cancel::{CancelReason, CancelToken};
use crate::error::{Result, StreamError};
use crate::metadata::Metadata;
use std::sync::Arc;
use tracing::debug;

/// Transport side of an input stream
pub trait InputDriver: Send {
    /// Trigger the transport's open side effect
    ///
    /// Called once, with the stream already in `Opening`. The driver (or a
    /// task it feeds) must eventually call `complete_open` on the handle.
    fn open(&mut self, handle: &StreamHandle);

    /// Release the native resources behind this direction
    fn close(&mut self) {}
}

/// Transport side of an output stream
pub trait OutputDriver: Send {
    /// Trigger the transport's open side effect (see `InputDriver::open`)
    fn open(&mut self, handle: &StreamHandle);

    /// Hand bytes to the transport
    ///
    /// Called only while the stream is open and no write is pending.
    /// Returns how many bytes were accepted, which may be fewer than
    /// `data.len()`.
    fn write(&mut self, handle: &StreamHandle, data: &[u8]) -> Result<usize>;

    fn close(&mut self) {}
}

/// Readable half of a stream pair
pub struct InputStream {
    handle: StreamHandle,
    driver: Option<Box<dyn InputDriver>>,
    stats: Arc<Stats>,
}

impl InputStream {
    pub fn new(handle: StreamHandle, driver: Box<dyn InputDriver>, stats: Arc<Stats>) -> Self {
        Self {
            handle,
            driver: Some(driver),
            stats,
        }
    }

    /// NotOpen -> Opening, then let the transport complete the open
    pub fn open(&mut self) {
        if !self.handle.begin_open() {
            debug!("Input stream open ignored in state {:?}", self.handle.status());
            return;
        }
        if let Some(driver) = self.driver.as_mut() {
            driver.open(&self.handle);
        }
    }

    /// Read queued bytes without blocking
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.handle.read(buf)?;
        self.stats.add_rx(n);
        Ok(n)
    }

    /// Close this direction and release its part of the native link
    pub fn close(&mut self) {
        if let Some(mut driver) = self.driver.take() {
            driver.close();
        }
        self.handle.end();
    }

    pub fn status(&self) -> StreamStatus {
        self.handle.status()
    }

    pub fn has_bytes_available(&self) -> bool {
        self.handle.has_bytes_available()
    }

    /// Register this stream's event sink
    pub fn events(&self) -> EventReceiver {
        self.handle.subscribe()
    }

    pub fn handle(&self) -> &StreamHandle {
        &self.handle
    }
}

impl Drop for InputStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Writable half of a stream pair
pub struct OutputStream {
    handle: StreamHandle,
    driver: Option<Box<dyn OutputDriver>>,
    stats: Arc<Stats>,
}

impl OutputStream {
    pub fn new(handle: StreamHandle, driver: Box<dyn OutputDriver>, stats: Arc<Stats>) -> Self {
        Self {
            handle,
            driver: Some(driver),
            stats,
        }
    }

    pub fn open(&mut self) {
        if !self.handle.begin_open() {
            debug!("Output stream open ignored in state {:?}", self.handle.status());
            return;
        }
        if let Some(driver) = self.driver.as_mut() {
            driver.open(&self.handle);
        }
    }

    /// Write without blocking
    ///
    /// Fails with `NotOpen` outside `Open` and with `WritePending` while a
    /// previous write still occupies the pending slot. On success returns the
    /// number of bytes accepted; the caller re-invokes for the remainder.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.handle.status() != StreamStatus::Open {
            return Err(StreamError::NotOpen);
        }
        if self.handle.is_write_pending() {
            return Err(StreamError::WritePending);
        }
        let driver = self.driver.as_mut().ok_or(StreamError::NotOpen)?;
        let n = driver.write(&self.handle, data)?;
        self.stats.add_tx(n);
        Ok(n)
    }

    pub fn close(&mut self) {
        if let Some(mut driver) = self.driver.take() {
            driver.close();
        }
        self.handle.end();
    }

    pub fn status(&self) -> StreamStatus {
        self.handle.status()
    }

    pub fn has_space_available(&self) -> bool {
        self.handle.has_space_available()
    }

    pub fn events(&self) -> EventReceiver {
        self.handle.subscribe()
    }

    pub fn handle(&self) -> &StreamHandle {
        &self.handle
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// The result of a successful connection
pub struct StreamPair {
    pub input: InputStream,
    pub output: OutputStream,
    pub metadata: Metadata,
    stats: Arc<Stats>,
    link: CancelToken,
}

impl StreamPair {
    /// Assemble a pair around a bridge's drivers
    ///
    /// `link` is the bridge's shutdown token: it fires when the pair is
    /// closed or disconnected by the broker.
    pub fn new(
        input: (StreamHandle, Box<dyn InputDriver>),
        output: (StreamHandle, Box<dyn OutputDriver>),
        link: CancelToken,
    ) -> Self {
        let stats = Arc::new(Stats::new());
        Self {
            input: InputStream::new(input.0, input.1, stats.clone()),
            output: OutputStream::new(output.0, output.1, stats.clone()),
            metadata: Metadata::default(),
            stats,
            link,
        }
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub(crate) fn link(&self) -> &CancelToken {
        &self.link
    }

    /// Close both directions and release the native link
    pub fn close(&mut self) {
        self.input.close();
        self.output.close();
        self.link.cancel(CancelReason::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Driver that completes synchronously and records what it was given
    #[derive(Clone, Default)]
    struct Recorder {
        written: Arc<Mutex<Vec<Vec<u8>>>>,
        closed: Arc<Mutex<u32>>,
    }

    impl InputDriver for Recorder {
        fn open(&mut self, handle: &StreamHandle) {
            handle.complete_open(Ok(()));
        }

        fn close(&mut self) {
            *self.closed.lock() += 1;
        }
    }

    impl OutputDriver for Recorder {
        fn open(&mut self, handle: &StreamHandle) {
            handle.complete_open(Ok(()));
            handle.signal_space();
        }

        fn write(&mut self, _handle: &StreamHandle, data: &[u8]) -> Result<usize> {
            let n = data.len().min(3);
            self.written.lock().push(data[..n].to_vec());
            Ok(n)
        }

        fn close(&mut self) {
            *self.closed.lock() += 1;
        }
    }

    fn pair(recorder: &Recorder) -> StreamPair {
        StreamPair::new(
            (StreamHandle::new(), Box::new(recorder.clone())),
            (StreamHandle::new(), Box::new(recorder.clone())),
            CancelToken::new(),
        )
    }

    #[test]
    fn test_write_before_open_is_rejected() {
        let recorder = Recorder::default();
        let mut pair = pair(&recorder);
        assert!(matches!(pair.output.write(b"abc"), Err(StreamError::NotOpen)));
        assert!(recorder.written.lock().is_empty());
    }

    #[test]
    fn test_short_write_counts_only_accepted_bytes() {
        let recorder = Recorder::default();
        let mut pair = pair(&recorder);
        pair.output.open();

        assert_eq!(pair.output.write(b"abcdef").unwrap(), 3);
        assert_eq!(pair.stats().tx_bytes(), 3);
        assert_eq!(recorder.written.lock().as_slice(), &[b"abc".to_vec()]);
    }

    #[test]
    fn test_read_updates_stats() {
        let recorder = Recorder::default();
        let mut pair = pair(&recorder);
        pair.input.open();
        pair.input.handle().append(b"data");

        let mut buf = [0u8; 8];
        assert_eq!(pair.input.read(&mut buf).unwrap(), 4);
        assert_eq!(pair.stats().rx_bytes(), 4);
    }

    #[test]
    fn test_close_pair_fires_link_and_closes_drivers_once() {
        let recorder = Recorder::default();
        let mut pair = pair(&recorder);
        pair.input.open();
        pair.output.open();
        let link = pair.link().clone();

        pair.close();
        pair.close();
        assert_eq!(link.reason(), Some(CancelReason::Closed));
        assert_eq!(*recorder.closed.lock(), 2);
        assert_eq!(pair.input.status(), StreamStatus::Closed);
        assert_eq!(pair.output.status(), StreamStatus::Closed);
    }

    #[test]
    fn test_output_open_emits_open_then_space() {
        let recorder = Recorder::default();
        let mut pair = pair(&recorder);
        let mut events = pair.output.events();
        pair.output.open();

        assert_eq!(events.try_recv(), Some(StreamEvent::OpenCompleted));
        assert_eq!(events.try_recv(), Some(StreamEvent::HasSpaceAvailable));
        assert_eq!(events.try_recv(), None);
    }
}
