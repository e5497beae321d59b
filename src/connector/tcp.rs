//! `tcp://host:port`

use super::{or_cancelled, wrong_target, Connector, ConnectorFactory};
use crate::bridge::channel_pair;
use crate::cancel::CancelToken;
use crate::config::TcpConfig;
use crate::error::Result;
use crate::metadata::Metadata;
use crate::stream::StreamPair;
use crate::target::Target;
use crate::transport::{TcpTransport, Transport};
use async_trait::async_trait;
use url::Url;

pub struct TcpFactory {
    config: TcpConfig,
}

impl TcpFactory {
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }
}

impl ConnectorFactory for TcpFactory {
    fn create(&self, url: &Url) -> Result<Box<dyn Connector>> {
        match Target::parse(url)? {
            Target::Tcp { host, port } => Ok(Box::new(TcpConnector {
                url: url.clone(),
                host,
                port,
                config: self.config.clone(),
            })),
            _ => Err(wrong_target(url, "tcp")),
        }
    }
}

struct TcpConnector {
    url: Url,
    host: String,
    port: u16,
    config: TcpConfig,
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(self: Box<Self>, cancel: CancelToken) -> Result<StreamPair> {
        // Dropping the connect future on cancellation closes the half-open socket
        let transport = or_cancelled(
            &cancel,
            TcpTransport::connect(&self.host, self.port, &self.config),
        )
        .await?;
        let peer = transport.peer_addr();

        let link = CancelToken::new();
        let channels = transport.spawn(link.clone())?;
        let mut pair = channel_pair(channels, link, None);
        pair.metadata = Metadata::for_url(&self.url).with_name(peer.to_string());
        Ok(pair)
    }
}
