//! Connection broker
//!
//! Maps URL schemes to connector factories and runs connection attempts.
//! Two registries are kept, both keyed by the canonical URL string:
//! - pending: one entry per in-flight attempt (its cancel token)
//! - active: one entry per established connection
//!
//! A target can have at most one pending attempt. Every attempt leaves the
//! pending registry when it resolves, whatever the outcome.

use crate::cancel::{CancelReason, CancelToken};
use crate::config::{BrokerConfig, Config};
use crate::connector::{
    AccessoryFactory, BleFactory, ConnectorFactory, RfcommFactory, TcpFactory, TtyFactory,
};
use crate::error::{Result, StreamError};
use crate::metadata::Metadata;
use crate::stream::{Stats, StatsSnapshot, StreamHandle, StreamPair};
use crate::target::{self, SCHEME_ACCESSORY, SCHEME_BLE, SCHEME_RFCOMM, SCHEME_TCP, SCHEME_TTY};
use crate::transport::accessory::{AccessoryHub, AccessoryStack};
use crate::transport::ble::BleStack;
use crate::transport::rfcomm::RfcommStack;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

type Attempt = Pin<Box<dyn Future<Output = Result<StreamPair>> + Send>>;

static SHARED: OnceLock<Broker> = OnceLock::new();

/// Registry record of an established connection
struct Connection {
    metadata: Metadata,
    stats: Arc<Stats>,
    link: CancelToken,
    input: StreamHandle,
    output: StreamHandle,
}

impl Connection {
    fn new(pair: &StreamPair) -> Self {
        Self {
            metadata: pair.metadata.clone(),
            stats: pair.stats().clone(),
            link: pair.link().clone(),
            input: pair.input.handle().clone(),
            output: pair.output.handle().clone(),
        }
    }

    /// Both streams ended or the native link released
    fn is_gone(&self) -> bool {
        self.link.is_cancelled() || (self.input.is_ended() && self.output.is_ended())
    }

    fn close(&self) {
        self.input.end();
        self.output.end();
        self.link.cancel(CancelReason::Closed);
    }
}

struct Inner {
    config: BrokerConfig,
    factories: RwLock<HashMap<String, Arc<dyn ConnectorFactory>>>,
    pending: Mutex<HashMap<String, CancelToken>>,
    active: Mutex<HashMap<String, Connection>>,
}

/// Removes the pending entry when the attempt resolves or is abandoned
struct PendingGuard<'a> {
    inner: &'a Inner,
    key: Option<String>,
}

impl PendingGuard<'_> {
    /// Remove the entry under a pending lock the caller already holds
    fn release(mut self, pending: &mut HashMap<String, CancelToken>) {
        if let Some(key) = self.key.take() {
            pending.remove(&key);
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.inner.pending.lock().remove(&key);
        }
    }
}

/// Cloneable handle to a connection broker
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker").finish_non_exhaustive()
    }
}

impl Broker {
    /// Broker with default configuration and the TCP and TTY connectors
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::default()
    }

    /// Process-wide broker
    ///
    /// Created on first use with defaults unless [`BrokerBuilder::install`]
    /// got there first.
    pub fn shared() -> Broker {
        SHARED.get_or_init(Broker::new).clone()
    }

    fn with_config(config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                factories: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Install the connector factory for `scheme`, replacing any previous one
    pub fn register(&self, scheme: &str, factory: impl ConnectorFactory + 'static) {
        let scheme = scheme.to_ascii_lowercase();
        let replaced = self
            .inner
            .factories
            .write()
            .insert(scheme.clone(), Arc::new(factory))
            .is_some();
        if replaced {
            info!("Connector for {}:// replaced", scheme);
        } else {
            debug!("Connector for {}:// registered", scheme);
        }
    }

    /// Registered schemes, sorted
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.inner.factories.read().keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// Connect to `url` with the configured timeout
    pub async fn connect(&self, url: &str) -> Result<StreamPair> {
        self.connect_with_timeout(url, self.inner.config.connect_timeout())
            .await
    }

    /// Connect to `url`, giving up after `timeout` if one is set
    pub async fn connect_with_timeout(
        &self,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<StreamPair> {
        let url = target::parse_url(url)?;
        let key = registry_key(&url);
        let factory = self
            .inner
            .factories
            .read()
            .get(url.scheme())
            .cloned()
            .ok_or_else(|| StreamError::UnsupportedScheme {
                scheme: url.scheme().to_string(),
            })?;

        let token = CancelToken::new();
        let pending = self.begin(&key, token.clone())?;
        let connector = factory.create(&url)?;
        debug!("Connecting to {}", key);

        let mut attempt: Attempt = connector.connect(token.clone());
        let deadline = async move {
            match timeout {
                Some(after) => {
                    tokio::time::sleep(after).await;
                    after
                }
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        // Completion wins over a deadline or cancel observed in the same poll.
        // Leaving the select drops the deadline, so it can never fire late.
        let finished = tokio::select! {
            biased;
            result = &mut attempt => Some(result),
            after = &mut deadline => {
                info!("Connection to {} timed out after {:?}", key, after);
                token.cancel(CancelReason::TimedOut(after));
                None
            }
            _ = token.cancelled() => None,
        };
        let result = match finished {
            Some(result) => result,
            None => self.wind_down(&key, attempt, &token).await,
        };

        let pair = result.map_err(|e| {
            debug!("Connection to {} failed: {}", key, e);
            e
        })?;
        self.promote(&key, pending, &token, pair)
    }

    /// Move a finished attempt from the pending to the active registry
    ///
    /// Both registries are locked, so a concurrent `cancel` either fires the
    /// token before the pending entry goes (seen here) or finds the active
    /// entry and closes it.
    fn promote(
        &self,
        key: &str,
        pending: PendingGuard<'_>,
        token: &CancelToken,
        mut pair: StreamPair,
    ) -> Result<StreamPair> {
        let mut active = self.inner.active.lock();
        {
            let mut registry = self.inner.pending.lock();
            pending.release(&mut registry);
            if let Some(reason) = token.reason() {
                drop(registry);
                drop(active);
                debug!("Connection to {} cancelled as it completed", key);
                pair.close();
                return Err(reason.into());
            }
        }
        info!("Connected to {}", key);
        if active
            .insert(key.to_string(), Connection::new(&pair))
            .is_some()
        {
            debug!("Replaced stale active entry for {}", key);
        }
        Ok(pair)
    }

    fn begin(&self, key: &str, token: CancelToken) -> Result<PendingGuard<'_>> {
        let mut pending = self.inner.pending.lock();
        if pending.contains_key(key) {
            return Err(StreamError::ConnectionInProgress {
                url: key.to_string(),
            });
        }
        pending.insert(key.to_string(), token);
        Ok(PendingGuard {
            inner: &self.inner,
            key: Some(key.to_string()),
        })
    }

    /// Give a cancelled connector time to release its resources
    ///
    /// A pair that still arrives is closed; the caller gets the cancel reason.
    async fn wind_down(
        &self,
        key: &str,
        attempt: Attempt,
        token: &CancelToken,
    ) -> Result<StreamPair> {
        let reason = token.reason().unwrap_or(CancelReason::Cancelled);
        match tokio::time::timeout(self.inner.config.cancel_grace(), attempt).await {
            Ok(Ok(mut pair)) => {
                debug!("Discarding late connection to {}", key);
                pair.close();
            }
            Ok(Err(_)) => {}
            Err(_) => warn!("Connector for {} did not stop within the grace period", key),
        }
        Err(reason.into())
    }

    /// Cancel the pending attempt for `url`, or close its active connection
    ///
    /// Returns `false` when there is nothing to cancel.
    pub fn cancel(&self, url: &str) -> bool {
        let Some(key) = canonical_key(url) else {
            return false;
        };
        {
            // Fired under the lock so that `promote` cannot miss it
            let pending = self.inner.pending.lock();
            if let Some(token) = pending.get(&key) {
                debug!("Cancelling connection to {}", key);
                return token.cancel(CancelReason::Cancelled);
            }
        }
        self.close_active(&key)
    }

    /// Close the active connection for `url`
    pub fn disconnect(&self, url: &str) -> bool {
        canonical_key(url).is_some_and(|key| self.close_active(&key))
    }

    fn close_active(&self, key: &str) -> bool {
        let removed = self.inner.active.lock().remove(key);
        match removed {
            Some(connection) => {
                info!("Disconnecting {}", key);
                connection.close();
                true
            }
            None => false,
        }
    }

    fn prune(&self) -> parking_lot::MutexGuard<'_, HashMap<String, Connection>> {
        let mut active = self.inner.active.lock();
        active.retain(|_, connection| !connection.is_gone());
        active
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn active_count(&self) -> usize {
        self.prune().len()
    }

    pub fn is_pending(&self, url: &str) -> bool {
        canonical_key(url).is_some_and(|key| self.inner.pending.lock().contains_key(&key))
    }

    pub fn is_active(&self, url: &str) -> bool {
        canonical_key(url).is_some_and(|key| self.prune().contains_key(&key))
    }

    /// Metadata recorded when `url` connected
    pub fn metadata(&self, url: &str) -> Option<Metadata> {
        let key = canonical_key(url)?;
        self.prune().get(&key).map(|c| c.metadata.clone())
    }

    /// Traffic counters of the active connection for `url`
    pub fn stats(&self, url: &str) -> Option<StatsSnapshot> {
        let key = canonical_key(url)?;
        self.prune().get(&key).map(|c| c.stats.snapshot())
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

fn canonical_key(url: &str) -> Option<String> {
    target::parse_url(url).ok().map(|u| registry_key(&u))
}

/// Registry key for a parsed target
///
/// Only special schemes get their host lowercased by the URL parser, so
/// hosts of `tcp`, `ble` and friends are folded here.
fn registry_key(url: &Url) -> String {
    match url.host_str() {
        Some(host) if host.bytes().any(|b| b.is_ascii_uppercase()) => {
            let mut folded = url.clone();
            match folded.set_host(Some(&host.to_ascii_lowercase())) {
                Ok(()) => folded.to_string(),
                Err(_) => url.to_string(),
            }
        }
        _ => url.to_string(),
    }
}

/// Assembles a broker from configuration and the native stacks available
#[derive(Default)]
pub struct BrokerBuilder {
    config: Config,
    ble: Option<Arc<dyn BleStack>>,
    rfcomm: Option<Arc<dyn RfcommStack>>,
    accessory: Option<Arc<dyn AccessoryStack>>,
}

impl BrokerBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn ble(mut self, stack: Arc<dyn BleStack>) -> Self {
        self.ble = Some(stack);
        self
    }

    pub fn rfcomm(mut self, stack: Arc<dyn RfcommStack>) -> Self {
        self.rfcomm = Some(stack);
        self
    }

    pub fn accessory(mut self, stack: Arc<dyn AccessoryStack>) -> Self {
        self.accessory = Some(stack);
        self
    }

    pub fn build(self) -> Broker {
        let broker = Broker::with_config(self.config.broker);
        broker.register(SCHEME_TCP, TcpFactory::new(self.config.tcp));
        broker.register(SCHEME_TTY, TtyFactory::new(self.config.tty));
        if let Some(stack) = self.ble {
            broker.register(SCHEME_BLE, BleFactory::new(stack));
        }
        if let Some(stack) = self.rfcomm {
            broker.register(SCHEME_RFCOMM, RfcommFactory::new(stack));
        }
        if let Some(stack) = self.accessory {
            broker.register(
                SCHEME_ACCESSORY,
                AccessoryFactory::new(AccessoryHub::for_stack(stack)),
            );
        }
        broker
    }

    /// Build and install as the process-wide [`Broker::shared`] instance
    ///
    /// Fails with the existing instance if the shared broker was already
    /// created.
    pub fn install(self) -> std::result::Result<Broker, Broker> {
        let mut installed = false;
        let shared = SHARED.get_or_init(|| {
            installed = true;
            self.build()
        });
        if installed {
            Ok(shared.clone())
        } else {
            warn!("Shared broker already exists, configuration ignored");
            Err(shared.clone())
        }
    }
}
