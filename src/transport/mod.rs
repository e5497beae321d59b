//! Native transports
//!
//! Two kinds of things live here:
//! - **Byte transports** (`tcp`, `serial`): open an OS handle and move its
//!   bytes through a pair of channels (`Transport` + `TransportChannels`)
//! - **Capability providers** (`ble`, `rfcomm`, `accessory`): traits the
//!   host platform implements on top of its Bluetooth and accessory stacks.
//!   Bridges and connectors drive them; nothing here implements a stack.
//!
//! Each byte transport manages its own execution model internally:
//! - Serial: blocking threads for low latency
//! - TCP: async tokio tasks
//!
//! Stream-shaped native channels (L2CAP, accessory sessions) are handed
//! over as `TransportChannels` too, so one bridge serves them all.

pub mod accessory;
pub mod ble;
pub mod rfcomm;
pub mod serial;
pub mod tcp;

pub use serial::SerialTransport;
pub use tcp::TcpTransport;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::cancel::CancelToken;
use crate::error::Result;

/// Channels for bidirectional communication with a transport
///
/// The transport owns the underlying I/O (socket, serial port, native
/// channel) and communicates via these channels. When the transport stops
/// (shutdown, peer gone or error), it closes `rx`.
pub struct TransportChannels {
    /// Bytes received from the transport
    ///
    /// An `Err` item reports a read failure; `None` means the transport has
    /// stopped.
    pub rx: mpsc::Receiver<std::io::Result<Bytes>>,

    /// Bytes to write to the transport
    ///
    /// Dropping the sender closes the write side.
    pub tx: mpsc::Sender<Bytes>,
}

/// Trait for spawnable transports
///
/// # Lifecycle
///
/// 1. Create transport with configuration (this is where the handle opens)
/// 2. Call `spawn()` to start I/O in background
/// 3. Use returned channels for communication
/// 4. Transport runs until:
///    - `shutdown` fires, OR
///    - A fatal error occurs (disconnect, etc.)
/// 5. Transport closes channels when stopping
pub trait Transport: Send + 'static {
    /// Spawn the transport in background
    ///
    /// Must be called from within a tokio runtime.
    fn spawn(self, shutdown: CancelToken) -> Result<TransportChannels>;
}
