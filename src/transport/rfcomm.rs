//! Classic Bluetooth RFCOMM capability provider
//!
//! Native status codes (`i32`) are kept as-is so connection failures can
//! carry them to the caller.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Asynchronous notifications for one RFCOMM channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RfcommEvent {
    /// The open request finished; `status == 0` means success
    OpenComplete { status: i32 },
    /// A chunk of incoming data
    Data(Bytes),
    Closed,
}

/// An RFCOMM channel owned by a bridge
pub trait RfcommChannel: Send + Sync {
    /// Blocks until the stack accepts `data` (at most `mtu()` bytes)
    fn write_sync(&self, data: &[u8]) -> Result<(), i32>;
    fn mtu(&self) -> usize;
    fn close(&self);
}

/// A paired remote device
pub trait RfcommDevice: Send + Sync {
    fn name(&self) -> Option<String>;

    /// Query the device's service records for `service_class` and return its channel id
    fn service_channel(&self, service_class: u16) -> Result<u8, i32>;

    /// Start opening `channel`
    ///
    /// An `Err` is a synchronous failure to even issue the request. On `Ok`
    /// the outcome arrives as `RfcommEvent::OpenComplete` on `events`.
    fn open_channel(
        &self,
        channel: u8,
        events: mpsc::UnboundedSender<RfcommEvent>,
    ) -> Result<Arc<dyn RfcommChannel>, i32>;
}

/// Entry point supplied by the platform
pub trait RfcommStack: Send + Sync {
    /// Look up a device by canonical hardware address (`AA-BB-CC-DD-EE-FF`)
    fn device(&self, address: &str) -> Option<Arc<dyn RfcommDevice>>;
}
