//! `tty:///dev/node` and `tty://localhost:<baud>/dev/node`

use super::{or_cancelled, wrong_target, Connector, ConnectorFactory};
use crate::bridge::channel_pair;
use crate::cancel::CancelToken;
use crate::config::TtyConfig;
use crate::error::{Result, StreamError};
use crate::metadata::Metadata;
use crate::stream::StreamPair;
use crate::target::Target;
use crate::transport::serial::{SerialOpen, SerialTransport};
use crate::transport::Transport;
use async_trait::async_trait;
use std::path::PathBuf;
use url::Url;

pub struct TtyFactory {
    config: TtyConfig,
}

impl TtyFactory {
    pub fn new(config: TtyConfig) -> Self {
        Self { config }
    }
}

impl ConnectorFactory for TtyFactory {
    fn create(&self, url: &Url) -> Result<Box<dyn Connector>> {
        match Target::parse(url)? {
            Target::Tty { path, baud } => Ok(Box::new(TtyConnector {
                url: url.clone(),
                path,
                baud,
                config: self.config.clone(),
            })),
            _ => Err(wrong_target(url, "tty")),
        }
    }
}

struct TtyConnector {
    url: Url,
    path: PathBuf,
    baud: Option<u32>,
    config: TtyConfig,
}

#[async_trait]
impl Connector for TtyConnector {
    async fn connect(self: Box<Self>, cancel: CancelToken) -> Result<StreamPair> {
        if !self.path.exists() {
            return Err(StreamError::NotFound {
                target: self.path.display().to_string(),
            });
        }
        let path = self.path.to_string_lossy().into_owned();

        // Opening a device node can block on some drivers
        let open_path = path.clone();
        let baud = self.baud;
        let config = self.config.clone();
        let SerialOpen { transport, warning } = or_cancelled(&cancel, async move {
            tokio::task::spawn_blocking(move || SerialTransport::open(&open_path, baud, &config))
                .await
                .map_err(|e| StreamError::unable_to_connect(e.to_string()))?
        })
        .await?;

        let link = CancelToken::new();
        let channels = transport.spawn(link.clone())?;
        let mut pair = channel_pair(channels, link, None);
        pair.metadata = Metadata::for_url(&self.url).with_name(path);
        if let Some(warning) = warning {
            pair.metadata.warn(warning);
        }
        Ok(pair)
    }
}
