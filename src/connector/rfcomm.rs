//! `rfcomm://AA-BB-CC-DD-EE-FF[:channel]`
//!
//! Without an explicit channel, the device's Serial Port Profile record is
//! queried for one.

use super::{wrong_target, Connector, ConnectorFactory};
use crate::bridge::rfcomm::rfcomm_pair;
use crate::cancel::CancelToken;
use crate::constants::SPP_SERVICE_CLASS;
use crate::error::{Result, StreamError};
use crate::metadata::Metadata;
use crate::stream::StreamPair;
use crate::target::Target;
use crate::transport::rfcomm::{RfcommEvent, RfcommStack};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use url::Url;

pub struct RfcommFactory {
    stack: Arc<dyn RfcommStack>,
}

impl RfcommFactory {
    pub fn new(stack: Arc<dyn RfcommStack>) -> Self {
        Self { stack }
    }
}

impl ConnectorFactory for RfcommFactory {
    fn create(&self, url: &Url) -> Result<Box<dyn Connector>> {
        match Target::parse(url)? {
            Target::Rfcomm { address, channel } => Ok(Box::new(RfcommConnector {
                url: url.clone(),
                address,
                channel,
                stack: self.stack.clone(),
            })),
            _ => Err(wrong_target(url, "rfcomm")),
        }
    }
}

struct RfcommConnector {
    url: Url,
    address: String,
    channel: Option<u8>,
    stack: Arc<dyn RfcommStack>,
}

fn failed(what: &str, status: i32) -> StreamError {
    StreamError::UnableToConnect {
        reason: format!("{} failed with status {}", what, status),
        status: Some(status),
    }
}

#[async_trait]
impl Connector for RfcommConnector {
    async fn connect(self: Box<Self>, cancel: CancelToken) -> Result<StreamPair> {
        let device = self.stack.device(&self.address).ok_or_else(|| StreamError::NotFound {
            target: self.address.clone(),
        })?;

        let channel_id = match self.channel {
            Some(id) => id,
            None => {
                let id = device
                    .service_channel(SPP_SERVICE_CLASS)
                    .map_err(|status| failed("Service record query", status))?;
                debug!("{} offers serial port on channel {}", self.address, id);
                id
            }
        };

        let (tx, mut events) = mpsc::unbounded_channel();
        let channel = device
            .open_channel(channel_id, tx)
            .map_err(|status| failed("RFCOMM open", status))?;

        // Data can race ahead of the open acknowledgement
        let mut early = Vec::new();
        loop {
            let event = tokio::select! {
                reason = cancel.cancelled() => {
                    channel.close();
                    return Err(reason.into());
                }
                event = events.recv() => event,
            };
            match event {
                Some(RfcommEvent::OpenComplete { status: 0 }) => break,
                Some(RfcommEvent::OpenComplete { status }) => {
                    channel.close();
                    return Err(failed("RFCOMM open", status));
                }
                Some(RfcommEvent::Data(chunk)) => early.push(chunk),
                Some(RfcommEvent::Closed) | None => {
                    return Err(StreamError::unable_to_connect(
                        "RFCOMM channel closed while opening",
                    ));
                }
            }
        }

        info!("RFCOMM channel {} open to {}", channel_id, self.address);
        let name = device.name().unwrap_or_else(|| self.address.clone());
        let mut pair = rfcomm_pair(channel, events, early);
        pair.metadata = Metadata::for_url(&self.url).with_name(name);
        Ok(pair)
    }
}
