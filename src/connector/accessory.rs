//! `ea://<protocol>`
//!
//! Uses an attached accessory speaking the protocol, or waits for one to
//! be connected.

use super::{wrong_target, Connector, ConnectorFactory};
use crate::bridge::channel_pair;
use crate::cancel::CancelToken;
use crate::error::{Result, StreamError};
use crate::metadata::Metadata;
use crate::stream::StreamPair;
use crate::target::Target;
use crate::transport::accessory::{AccessoryHub, AccessoryInfo};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};
use url::Url;

pub struct AccessoryFactory {
    hub: Arc<AccessoryHub>,
}

impl AccessoryFactory {
    pub fn new(hub: Arc<AccessoryHub>) -> Self {
        Self { hub }
    }
}

impl ConnectorFactory for AccessoryFactory {
    fn create(&self, url: &Url) -> Result<Box<dyn Connector>> {
        match Target::parse(url)? {
            Target::Accessory { protocol } => Ok(Box::new(AccessoryConnector {
                url: url.clone(),
                protocol,
                hub: self.hub.clone(),
            })),
            _ => Err(wrong_target(url, "ea")),
        }
    }
}

struct AccessoryConnector {
    url: Url,
    protocol: String,
    hub: Arc<AccessoryHub>,
}

impl AccessoryConnector {
    async fn wait_for_accessory(&self, cancel: &CancelToken) -> Result<AccessoryInfo> {
        // Subscribe before looking, so an accessory attached in between is not missed
        let mut connected = self.hub.subscribe();
        if let Some(accessory) = self.hub.find_connected(&self.protocol) {
            return Ok(accessory);
        }
        debug!("Waiting for an accessory speaking {}", self.protocol);

        loop {
            let notification = tokio::select! {
                reason = cancel.cancelled() => return Err(reason.into()),
                notification = connected.recv() => notification,
            };
            match notification {
                Ok(accessory) if accessory.supports(&self.protocol) => return Ok(accessory),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    debug!("Missed {} accessory notifications, rechecking", missed);
                    if let Some(accessory) = self.hub.find_connected(&self.protocol) {
                        return Ok(accessory);
                    }
                }
                Err(RecvError::Closed) => {
                    return Err(StreamError::unable_to_connect(
                        "accessory notifications stopped",
                    ));
                }
            }
        }
    }
}

fn metadata(url: &Url, accessory: &AccessoryInfo) -> Metadata {
    let mut metadata = Metadata::for_url(url).with_name(accessory.name.clone());
    metadata.manufacturer = accessory.manufacturer.clone();
    metadata.model = accessory.model_number.clone();
    metadata.serial_number = format!(
        "{} {}",
        accessory.serial_number, accessory.hardware_revision
    )
    .trim()
    .to_string();
    metadata.firmware_version = accessory.firmware_revision.clone();
    metadata
}

#[async_trait]
impl Connector for AccessoryConnector {
    async fn connect(self: Box<Self>, cancel: CancelToken) -> Result<StreamPair> {
        let accessory = self.wait_for_accessory(&cancel).await?;
        let channels = self
            .hub
            .open_session(&accessory, &self.protocol)
            .map_err(StreamError::unable_to_connect)?;
        info!("Accessory session open: {} ({})", accessory.name, self.protocol);

        let mut pair = channel_pair(channels, CancelToken::new(), None);
        pair.metadata = metadata(&self.url, &accessory);
        Ok(pair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelReason;
    use crate::transport::accessory::mock::{accessory, MockAccessoryStack};
    use bytes::Bytes;
    use std::sync::atomic::Ordering;

    fn setup() -> (Arc<MockAccessoryStack>, AccessoryFactory) {
        let stack = Arc::new(MockAccessoryStack::default());
        let hub = AccessoryHub::for_stack(stack.clone());
        (stack, AccessoryFactory::new(hub))
    }

    fn url(raw: &str) -> Url {
        crate::target::parse_url(raw).unwrap()
    }

    #[tokio::test]
    async fn test_attached_accessory_is_used() {
        let (stack, factory) = setup();
        stack.attached.lock().push(accessory("Dock", &["com.acme.dock"]));

        let pair = factory
            .create(&url("ea://com.acme.dock"))
            .unwrap()
            .connect(CancelToken::new())
            .await
            .unwrap();

        assert_eq!(stack.sessions.lock().len(), 1);
        assert_eq!(pair.metadata.name, "Dock");
        assert_eq!(pair.metadata.manufacturer, "Acme");
        assert_eq!(pair.metadata.model, "M1");
        assert_eq!(pair.metadata.serial_number, "0042 B");
        assert_eq!(pair.metadata.firmware_version, "1.2.3");
    }

    #[tokio::test]
    async fn test_waits_for_matching_accessory() {
        let (stack, factory) = setup();
        let connector = factory.create(&url("ea://com.acme.dock")).unwrap();
        let attempt = tokio::spawn(connector.connect(CancelToken::new()));

        while stack.registrations.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        stack.plug(accessory("Other", &["com.acme.other"]));
        stack.plug(accessory("Dock", &["com.acme.dock"]));

        let mut pair = attempt.await.unwrap().unwrap();
        assert_eq!(pair.metadata.name, "Dock");

        pair.input.open();
        let mut events = pair.input.events();
        let peer = stack.sessions.lock().pop().unwrap();
        peer.to_stream.send(Ok(Bytes::from_static(b"hi"))).await.unwrap();
        events.recv().await;
        let mut buf = [0u8; 8];
        let n = pair.input.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi");
    }

    #[tokio::test]
    async fn test_registers_once_for_many_attempts() {
        let (stack, factory) = setup();
        let cancel = CancelToken::new();
        let first = tokio::spawn(
            factory
                .create(&url("ea://com.acme.dock"))
                .unwrap()
                .connect(cancel.clone()),
        );
        let second = tokio::spawn(
            factory
                .create(&url("ea://com.acme.dock"))
                .unwrap()
                .connect(cancel.clone()),
        );

        while stack.registrations.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        cancel.cancel(CancelReason::Cancelled);
        assert!(matches!(first.await.unwrap(), Err(StreamError::Cancelled)));
        assert!(matches!(second.await.unwrap(), Err(StreamError::Cancelled)));
        assert_eq!(stack.registrations.load(Ordering::SeqCst), 1);
    }
}
