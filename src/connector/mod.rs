//! Connectors
//!
//! A `ConnectorFactory` is registered per URL scheme. For each connection
//! attempt the broker asks it for a `Connector`, which drives the
//! transport-specific handshake and yields a stream pair.
//!
//! Factories only validate: `create` must not touch any native stack, so
//! malformed targets fail before any side effect. Connectors must watch
//! their `CancelToken` and, once it fires, release whatever they hold
//! (stop scanning, close half-open handles) and return the reason as an
//! error.

pub mod accessory;
pub mod ble;
pub mod rfcomm;
pub mod tcp;
pub mod tty;

pub use accessory::AccessoryFactory;
pub use ble::BleFactory;
pub use rfcomm::RfcommFactory;
pub use tcp::TcpFactory;
pub use tty::TtyFactory;

use crate::cancel::CancelToken;
use crate::error::{Result, StreamError};
use crate::stream::StreamPair;
use async_trait::async_trait;
use std::future::Future;
use url::Url;

/// One connection attempt
#[async_trait]
pub trait Connector: Send {
    async fn connect(self: Box<Self>, cancel: CancelToken) -> Result<StreamPair>;
}

/// Per-scheme connector source
pub trait ConnectorFactory: Send + Sync {
    /// Validate `url` and prepare a connector for it
    fn create(&self, url: &Url) -> Result<Box<dyn Connector>>;
}

impl<F> ConnectorFactory for F
where
    F: Fn(&Url) -> Result<Box<dyn Connector>> + Send + Sync,
{
    fn create(&self, url: &Url) -> Result<Box<dyn Connector>> {
        self(url)
    }
}

/// Run `fut` unless `cancel` fires first
pub(crate) async fn or_cancelled<T>(
    cancel: &CancelToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        reason = cancel.cancelled() => Err(reason.into()),
        result = fut => result,
    }
}

/// Error for a factory handed a URL of another scheme
pub(crate) fn wrong_target(url: &Url, expected: &str) -> StreamError {
    StreamError::invalid_url(url.as_str(), format!("not a {} target", expected))
}
