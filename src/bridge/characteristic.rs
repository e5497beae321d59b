//! GATT characteristic bridge
//!
//! Read side: a notify/indicate characteristic. Opening subscribes to
//! notifications and the subscription acknowledgement completes the open.
//!
//! Write side: a write/write-without-response characteristic. Each write
//! sends one chunk no larger than the smaller of the stack's two reported
//! maximum write lengths. Without-response writes need explicit readiness:
//! when the stack cannot take one, the chunk waits in the stream's single
//! pending slot and is flushed on the next readiness event.
//!
//! The peripheral disconnecting ends both streams; it is not an error.

use crate::cancel::{CancelToken, DropGuard};
use crate::error::Result;
use crate::stream::{
    InputDriver, OutputDriver, PendingWrite, StreamHandle, StreamPair, StreamStatus,
};
use crate::transport::ble::{BleCentral, CentralEvent, Characteristic, PeerId, WriteMode};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// An established peripheral connection
///
/// Dropping it asks the stack to disconnect.
pub(crate) struct BleLink {
    pub central: Arc<dyn BleCentral>,
    pub peer: PeerId,
}

impl Drop for BleLink {
    fn drop(&mut self) {
        debug!("Disconnecting {}", self.peer);
        self.central.cancel_connection(&self.peer);
    }
}

/// The two characteristics chosen for a stream pair
pub(crate) struct Endpoints {
    pub read: Characteristic,
    pub write: Characteristic,
}

impl Endpoints {
    /// First readable and first writable characteristic, in discovery order
    pub fn select(characteristics: &[Characteristic]) -> Option<Self> {
        let read = characteristics.iter().find(|c| c.properties.is_readable())?;
        let write = characteristics.iter().find(|c| c.properties.is_writable())?;
        Some(Self {
            read: read.clone(),
            write: write.clone(),
        })
    }

    fn write_mode(&self) -> WriteMode {
        if self.write.properties.write_without_response {
            WriteMode::WithoutResponse
        } else {
            WriteMode::WithResponse
        }
    }
}

/// Build a stream pair over `endpoints` and start the event task
///
/// `events` is the central session's event stream, which the bridge
/// consumes from here on.
pub(crate) fn characteristic_pair(
    link: BleLink,
    endpoints: Endpoints,
    events: mpsc::UnboundedReceiver<CentralEvent>,
) -> StreamPair {
    let token = CancelToken::new();
    let guard = Arc::new(token.clone().drop_guard());
    let input = StreamHandle::new();
    let output = StreamHandle::new();
    let mode = endpoints.write_mode();

    let input_driver = NotifyInput {
        central: link.central.clone(),
        peer: link.peer.clone(),
        characteristic: endpoints.read.id.clone(),
        _guard: guard.clone(),
    };
    let output_driver = CharacteristicOutput {
        central: link.central.clone(),
        peer: link.peer.clone(),
        characteristic: endpoints.write.id.clone(),
        mode,
        _guard: guard,
    };

    tokio::spawn(run_events(
        link,
        endpoints,
        mode,
        events,
        input.clone(),
        output.clone(),
        token.clone(),
    ));

    StreamPair::new(
        (input, Box::new(input_driver)),
        (output, Box::new(output_driver)),
        token,
    )
}

async fn run_events(
    link: BleLink,
    endpoints: Endpoints,
    mode: WriteMode,
    mut events: mpsc::UnboundedReceiver<CentralEvent>,
    input: StreamHandle,
    output: StreamHandle,
    shutdown: CancelToken,
) {
    let read_id = endpoints.read.id.as_str();
    let write_id = endpoints.write.id.as_str();
    let mut peer_gone = false;
    let mut subscribed = false;

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => {
                    peer_gone = true;
                    break;
                }
            },
        };

        match event {
            CentralEvent::Disconnected { peer, reason } if peer == link.peer => {
                debug!("Peripheral {} disconnected: {:?}", peer, reason);
                peer_gone = true;
                break;
            }
            CentralEvent::NotificationStateChanged {
                peer,
                characteristic,
                result,
            } if peer == link.peer && characteristic == read_id => match result {
                Ok(true) => {
                    subscribed = true;
                    input.complete_open(Ok(()));
                }
                Ok(false) => subscribed = false,
                Err(e) if input.status() == StreamStatus::Opening => {
                    input.complete_open(Err(e))
                }
                Err(e) => input.fail(e),
            },
            CentralEvent::ValueUpdated {
                peer,
                characteristic,
                result,
            } if peer == link.peer && characteristic == read_id => match result {
                Ok(data) => input.append(&data),
                Err(e) => input.fail(e),
            },
            CentralEvent::WriteCompleted {
                peer,
                characteristic,
                result,
            } if peer == link.peer && characteristic == write_id => match result {
                Ok(()) => {
                    output.clear_pending();
                    output.signal_space();
                }
                Err(e) => output.fail(e),
            },
            CentralEvent::ReadyToSendWithoutResponse { peer } if peer == link.peer => {
                if let Some(chunk) = output.take_deferred() {
                    link.central.write_value(&link.peer, write_id, chunk, mode);
                    output.clear_pending();
                }
                output.signal_space();
            }
            _ => {}
        }
    }

    if subscribed && !peer_gone {
        link.central.set_notify(&link.peer, read_id, false);
    }
    input.end();
    output.end();
    // Dropping `link` disconnects the peripheral
}

struct NotifyInput {
    central: Arc<dyn BleCentral>,
    peer: PeerId,
    characteristic: String,
    _guard: Arc<DropGuard>,
}

impl InputDriver for NotifyInput {
    fn open(&mut self, _handle: &StreamHandle) {
        // Completed by the NotificationStateChanged event
        self.central.set_notify(&self.peer, &self.characteristic, true);
    }
}

struct CharacteristicOutput {
    central: Arc<dyn BleCentral>,
    peer: PeerId,
    characteristic: String,
    mode: WriteMode,
    _guard: Arc<DropGuard>,
}

impl OutputDriver for CharacteristicOutput {
    fn open(&mut self, handle: &StreamHandle) {
        handle.complete_open(Ok(()));
        handle.signal_space();
    }

    fn write(&mut self, handle: &StreamHandle, data: &[u8]) -> Result<usize> {
        // Some peripherals overstate the with-response limit; trust the smaller one
        let limit = self
            .central
            .maximum_write_length(&self.peer, WriteMode::WithResponse)
            .min(
                self.central
                    .maximum_write_length(&self.peer, WriteMode::WithoutResponse),
            );
        let n = limit.min(data.len());
        if n == 0 {
            return Ok(0);
        }
        let chunk = Bytes::copy_from_slice(&data[..n]);

        match self.mode {
            WriteMode::WithoutResponse => {
                // Park the chunk first so a concurrent readiness event can flush it
                handle.set_pending(PendingWrite::Deferred(chunk))?;
                if self.central.can_send_write_without_response(&self.peer) {
                    if let Some(chunk) = handle.take_deferred() {
                        self.central.write_value(
                            &self.peer,
                            &self.characteristic,
                            chunk,
                            WriteMode::WithoutResponse,
                        );
                        handle.clear_pending();
                        handle.signal_space();
                    }
                }
            }
            WriteMode::WithResponse => {
                handle.set_pending(PendingWrite::InFlight)?;
                self.central.write_value(
                    &self.peer,
                    &self.characteristic,
                    chunk,
                    WriteMode::WithResponse,
                );
            }
        }
        Ok(n)
    }
}
