//! devstreams - uniform byte streams over device transports
//!
//! Opens a bidirectional, non-blocking byte stream pair to a device named
//! by URL:
//!
//! | URL | transport |
//! |---|---|
//! | `tcp://host:port` | TCP socket |
//! | `tty:///dev/node`, `tty://localhost:<baud>/dev/node` | serial device |
//! | `ble://<service>[:psm][/<peer>]` | BLE GATT characteristics or L2CAP channel |
//! | `rfcomm://<address>[:channel]` | classic Bluetooth RFCOMM |
//! | `ea://<protocol>` | external accessory session |
//!
//! TCP and TTY are built in. The Bluetooth and accessory transports are
//! driven through platform-supplied stacks (see [`transport`]) handed to
//! [`BrokerBuilder`].

pub mod bridge;
pub mod broker;
pub mod cancel;
pub mod config;
pub mod connector;
pub mod constants;
pub mod error;
pub mod logging;
pub mod metadata;
pub mod stream;
pub mod target;
pub mod transport;

pub use broker::{Broker, BrokerBuilder};
pub use cancel::{CancelReason, CancelToken};
pub use config::Config;
pub use connector::{Connector, ConnectorFactory};
pub use error::{Result, StreamError};
pub use metadata::Metadata;
pub use stream::{
    InputStream, OutputStream, StatsSnapshot, StreamEvent, StreamHandle, StreamPair, StreamStatus,
};

/// Connect to `url` through the process-wide broker
pub async fn connect(url: &str) -> Result<StreamPair> {
    Broker::shared().connect(url).await
}
