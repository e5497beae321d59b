//! Shared stream state
//!
//! A `StreamHandle` is the piece of a stream that both the caller-facing
//! `InputStream`/`OutputStream` and the bridge's background tasks touch.
//! Every state transition and the event it raises happen under one lock,
//! so a subscriber sees events in exactly the order the transitions occurred.

use crate::error::{Result, StreamError};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Lifecycle state of one stream direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    NotOpen,
    Opening,
    Open,
    Closed,
    Error,
}

/// Notification delivered to a stream's subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    OpenCompleted,
    HasBytesAvailable,
    HasSpaceAvailable,
    ErrorOccurred(String),
    /// Terminal: nothing follows it
    EndEncountered,
}

/// Single-slot write marker for transports with asynchronous write readiness
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PendingWrite {
    /// Bytes accepted from the caller but not yet handed to the native stack
    Deferred(Bytes),
    /// A native write is outstanding and awaits its acknowledgement
    InFlight,
}

struct StreamCore {
    status: StreamStatus,
    incoming: BytesMut,
    pending: Option<PendingWrite>,
    sink: Option<mpsc::UnboundedSender<StreamEvent>>,
    open_reported: bool,
    error_reported: bool,
    ended: bool,
}

impl StreamCore {
    fn emit(&mut self, event: StreamEvent) {
        if self.ended {
            return;
        }
        if let Some(sink) = &self.sink {
            // A dropped receiver just means nobody is listening any more
            let _ = sink.send(event);
        }
    }

    fn has_space(&self) -> bool {
        self.status == StreamStatus::Open && self.pending.is_none()
    }
}

/// Cloneable handle to the state of one stream direction
#[derive(Clone)]
pub struct StreamHandle {
    core: Arc<Mutex<StreamCore>>,
}

impl StreamHandle {
    pub fn new() -> Self {
        Self {
            core: Arc::new(Mutex::new(StreamCore {
                status: StreamStatus::NotOpen,
                incoming: BytesMut::new(),
                pending: None,
                sink: None,
                open_reported: false,
                error_reported: false,
                ended: false,
            })),
        }
    }

    pub fn status(&self) -> StreamStatus {
        self.core.lock().status
    }

    /// NotOpen -> Opening. Returns `false` if the stream was not in NotOpen.
    pub(crate) fn begin_open(&self) -> bool {
        let mut core = self.core.lock();
        if core.status != StreamStatus::NotOpen {
            return false;
        }
        core.status = StreamStatus::Opening;
        true
    }

    /// Resolve a pending open
    ///
    /// Bytes that arrived while opening are announced right after the
    /// open-completed event.
    pub fn complete_open(&self, result: std::result::Result<(), String>) {
        let mut core = self.core.lock();
        if core.status != StreamStatus::Opening {
            return;
        }
        match result {
            Ok(()) => {
                core.status = StreamStatus::Open;
                if !core.open_reported {
                    core.open_reported = true;
                    core.emit(StreamEvent::OpenCompleted);
                }
                if !core.incoming.is_empty() {
                    core.emit(StreamEvent::HasBytesAvailable);
                }
            }
            Err(reason) => Self::fail_locked(&mut core, reason),
        }
    }

    /// Append received bytes to the FIFO
    pub fn append(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut core = self.core.lock();
        if core.ended || matches!(core.status, StreamStatus::Closed | StreamStatus::Error) {
            return;
        }
        core.incoming.extend_from_slice(data);
        if core.status == StreamStatus::Open {
            core.emit(StreamEvent::HasBytesAvailable);
        }
    }

    /// Copy up to `buf.len()` queued bytes into `buf`, removing them
    ///
    /// Never blocks: an empty FIFO reads as 0.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut core = self.core.lock();
        if core.status != StreamStatus::Open {
            return Err(StreamError::NotOpen);
        }
        let n = buf.len().min(core.incoming.len());
        if n > 0 {
            let chunk = core.incoming.split_to(n);
            buf[..n].copy_from_slice(&chunk);
        }
        Ok(n)
    }

    /// Report a failure during an active operation (at most once)
    pub fn fail(&self, reason: impl Into<String>) {
        let mut core = self.core.lock();
        Self::fail_locked(&mut core, reason.into());
    }

    fn fail_locked(core: &mut StreamCore, reason: String) {
        if core.ended || core.error_reported {
            return;
        }
        core.status = StreamStatus::Error;
        core.error_reported = true;
        core.pending = None;
        core.emit(StreamEvent::ErrorOccurred(reason));
    }

    /// Terminal transition: drop queued bytes, raise end-encountered once
    pub fn end(&self) {
        let mut core = self.core.lock();
        if core.ended {
            return;
        }
        core.status = StreamStatus::Closed;
        core.incoming.clear();
        core.pending = None;
        core.emit(StreamEvent::EndEncountered);
        core.ended = true;
        core.sink = None;
    }

    pub fn is_ended(&self) -> bool {
        self.core.lock().ended
    }

    /// Register the event sink, replacing any previous one
    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut core = self.core.lock();
        if core.ended {
            let _ = tx.send(StreamEvent::EndEncountered);
        } else {
            if core.status == StreamStatus::Open && !core.incoming.is_empty() {
                let _ = tx.send(StreamEvent::HasBytesAvailable);
            }
            core.sink = Some(tx);
        }
        EventReceiver { rx }
    }

    pub fn has_bytes_available(&self) -> bool {
        let core = self.core.lock();
        core.status == StreamStatus::Open && !core.incoming.is_empty()
    }

    pub fn has_space_available(&self) -> bool {
        self.core.lock().has_space()
    }

    /// Raise has-space-available if the stream can accept a write right now
    pub fn signal_space(&self) {
        let mut core = self.core.lock();
        if core.has_space() {
            core.emit(StreamEvent::HasSpaceAvailable);
        }
    }

    /// Occupy the pending-write slot; fails if it is already taken
    pub(crate) fn set_pending(&self, pending: PendingWrite) -> Result<()> {
        let mut core = self.core.lock();
        if core.pending.is_some() {
            return Err(StreamError::WritePending);
        }
        core.pending = Some(pending);
        Ok(())
    }

    /// Take the deferred bytes, if any, leaving the slot marked in flight
    pub(crate) fn take_deferred(&self) -> Option<Bytes> {
        let mut core = self.core.lock();
        match core.pending.take() {
            Some(PendingWrite::Deferred(data)) => {
                core.pending = Some(PendingWrite::InFlight);
                Some(data)
            }
            other => {
                core.pending = other;
                None
            }
        }
    }

    /// Free the pending-write slot
    pub(crate) fn clear_pending(&self) {
        self.core.lock().pending = None;
    }

    pub(crate) fn is_write_pending(&self) -> bool {
        self.core.lock().pending.is_some()
    }
}

impl Default for StreamHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of a stream's event sink
///
/// Also usable as a `futures_util::Stream` of events.
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl EventReceiver {
    /// Wait for the next event; `None` once end-encountered has been consumed
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Next already-queued event, without waiting
    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.rx.try_recv().ok()
    }
}

impl futures_util::Stream for EventReceiver {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        self.rx.poll_recv(cx)
    }
}
