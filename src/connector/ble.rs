//! `ble://<service>[:psm][/<peer>]`
//!
//! Discovery state machine, driven by the central session's events:
//!
//! 1. Wait for the adapter to power on
//! 2. Treat peripherals already connected with the service as discovered,
//!    then scan for advertisers of the service
//! 3. Connect to every matching candidate (only the pinned one if a peer
//!    id is given), several in parallel
//! 4. Per candidate: discover services, then either open the L2CAP channel
//!    (PSM given) or discover characteristics and pick the endpoints
//! 5. The first candidate to get there wins; scanning stops and all other
//!    candidates are disconnected
//!
//! Each attempt uses its own central session, so concurrent BLE attempts
//! scan independently.

use super::{wrong_target, Connector, ConnectorFactory};
use crate::bridge::characteristic::{characteristic_pair, BleLink, Endpoints};
use crate::bridge::l2cap::l2cap_pair;
use crate::cancel::CancelToken;
use crate::error::{Result, StreamError};
use crate::metadata::Metadata;
use crate::stream::StreamPair;
use crate::target::Target;
use crate::transport::ble::{AdapterState, BleCentral, BleStack, CentralEvent, PeerId, Peripheral};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

pub struct BleFactory {
    stack: Arc<dyn BleStack>,
}

impl BleFactory {
    pub fn new(stack: Arc<dyn BleStack>) -> Self {
        Self { stack }
    }
}

impl ConnectorFactory for BleFactory {
    fn create(&self, url: &Url) -> Result<Box<dyn Connector>> {
        match Target::parse(url)? {
            Target::Ble { service, peer, psm } => Ok(Box::new(BleConnector {
                url: url.clone(),
                service,
                peer,
                psm,
                stack: self.stack.clone(),
            })),
            _ => Err(wrong_target(url, "ble")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
    OpeningChannel,
}

struct Candidate {
    peripheral: Peripheral,
    stage: Stage,
}

/// Scan and candidate bookkeeping
///
/// Dropping it stops the scan and disconnects every remaining candidate,
/// which is all the cleanup a cancelled or failed attempt needs.
struct Discovery {
    central: Arc<dyn BleCentral>,
    service: String,
    pinned: Option<PeerId>,
    candidates: HashMap<PeerId, Candidate>,
    scanning: bool,
}

impl Discovery {
    fn start_scan(&mut self) {
        if !self.scanning {
            debug!("Scanning for service {}", self.service);
            self.central.scan(std::slice::from_ref(&self.service));
            self.scanning = true;
        }
    }

    fn stop_scan(&mut self) {
        if self.scanning {
            self.central.stop_scan();
            self.scanning = false;
        }
    }

    fn consider(&mut self, peripheral: Peripheral) {
        if let Some(pinned) = &self.pinned {
            if !pinned.eq_ignore_ascii_case(&peripheral.id) {
                return;
            }
        }
        if let Some(existing) = self.candidates.get_mut(&peripheral.id) {
            existing.peripheral.rssi = peripheral.rssi;
            return;
        }
        debug!("Connecting to candidate {}", peripheral.id);
        self.central.connect(&peripheral.id);
        self.candidates.insert(
            peripheral.id.clone(),
            Candidate {
                peripheral,
                stage: Stage::Connecting,
            },
        );
    }

    fn advance(&mut self, peer: &str, from: Stage, to: Stage) -> bool {
        match self.candidates.get_mut(peer) {
            Some(candidate) if candidate.stage == from => {
                candidate.stage = to;
                true
            }
            _ => false,
        }
    }

    /// Abandon a candidate after a failed step
    ///
    /// With a pinned peer there is nobody else to wait for, so the failure
    /// ends the attempt.
    fn reject(&mut self, peer: &str, reason: String, disconnect: bool) -> Result<()> {
        if self.candidates.remove(peer).is_some() && disconnect {
            self.central.cancel_connection(peer);
        }
        debug!("Candidate {} rejected: {}", peer, reason);
        if self.pinned.is_some() {
            return Err(StreamError::unable_to_connect(reason));
        }
        Ok(())
    }

    /// The adapter went down and took pending connections and the scan with it
    ///
    /// Candidates are forgotten so that rediscovery after power-on connects
    /// them again.
    fn power_lost(&mut self) {
        self.scanning = false;
        if !self.candidates.is_empty() {
            debug!("Dropping {} candidates after adapter loss", self.candidates.len());
            self.candidates.clear();
        }
    }

    /// Take the winner out so it stays connected when the rest are dropped
    fn win(&mut self, peer: &str) -> Option<Peripheral> {
        self.stop_scan();
        self.candidates.remove(peer).map(|c| c.peripheral)
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop_scan();
        for peer in self.candidates.keys() {
            self.central.cancel_connection(peer);
        }
    }
}

struct BleConnector {
    url: Url,
    service: String,
    peer: Option<PeerId>,
    psm: Option<u16>,
    stack: Arc<dyn BleStack>,
}

impl BleConnector {
    fn metadata(&self, peripheral: &Peripheral) -> Metadata {
        let mut metadata = Metadata::for_url(&self.url)
            .with_name(peripheral.name.clone().unwrap_or_else(|| peripheral.id.clone()));
        metadata.rssi = peripheral.rssi;
        metadata
    }
}

#[async_trait]
impl Connector for BleConnector {
    async fn connect(self: Box<Self>, cancel: CancelToken) -> Result<StreamPair> {
        let (central, mut events) = self.stack.central();
        let mut discovery = Discovery {
            central: central.clone(),
            service: self.service.clone(),
            pinned: self.peer.clone(),
            candidates: HashMap::new(),
            scanning: false,
        };

        loop {
            let event = tokio::select! {
                reason = cancel.cancelled() => {
                    debug!("BLE attempt for {} stopped: {:?}", self.service, reason);
                    return Err(reason.into());
                }
                event = events.recv() => event.ok_or_else(|| {
                    StreamError::unable_to_connect("Bluetooth stack closed the session")
                })?,
            };

            match event {
                CentralEvent::StateChanged(AdapterState::PoweredOn) => {
                    for peripheral in central.connected_peripherals(&self.service) {
                        discovery.consider(peripheral);
                    }
                    discovery.start_scan();
                }
                CentralEvent::StateChanged(AdapterState::Unsupported) => {
                    return Err(StreamError::unable_to_connect(
                        "Bluetooth LE is not supported on this host",
                    ));
                }
                CentralEvent::StateChanged(AdapterState::Unauthorized) => {
                    return Err(StreamError::unable_to_connect(
                        "Bluetooth access is not authorized",
                    ));
                }
                CentralEvent::StateChanged(state) => {
                    debug!("Adapter state {:?}, waiting", state);
                    discovery.power_lost();
                }
                CentralEvent::Discovered(peripheral) => discovery.consider(peripheral),
                CentralEvent::Connected(peer) => {
                    if discovery.advance(&peer, Stage::Connecting, Stage::DiscoveringServices) {
                        central.discover_services(&peer, std::slice::from_ref(&self.service));
                    }
                }
                CentralEvent::FailedToConnect { peer, reason } => {
                    discovery.reject(&peer, reason, false)?;
                }
                CentralEvent::Disconnected { peer, reason } => {
                    if discovery.candidates.contains_key(&peer) {
                        let reason = reason.unwrap_or_else(|| "disconnected".into());
                        discovery.reject(&peer, reason, false)?;
                    }
                }
                CentralEvent::ServicesDiscovered { peer, result } => {
                    if !discovery.candidates.contains_key(&peer) {
                        continue;
                    }
                    let has_service = match result {
                        Ok(services) => services
                            .iter()
                            .any(|s| s.eq_ignore_ascii_case(&self.service)),
                        Err(e) => {
                            discovery.reject(&peer, e, true)?;
                            continue;
                        }
                    };
                    if !has_service {
                        let reason = format!("service {} not offered", self.service);
                        discovery.reject(&peer, reason, true)?;
                    } else if let Some(psm) = self.psm {
                        discovery.advance(&peer, Stage::DiscoveringServices, Stage::OpeningChannel);
                        central.open_l2cap_channel(&peer, psm);
                    } else {
                        discovery.advance(
                            &peer,
                            Stage::DiscoveringServices,
                            Stage::DiscoveringCharacteristics,
                        );
                        central.discover_characteristics(&peer, &self.service);
                    }
                }
                CentralEvent::CharacteristicsDiscovered { peer, result, .. } => {
                    if !discovery.candidates.contains_key(&peer) {
                        continue;
                    }
                    let endpoints = match result {
                        Ok(characteristics) => Endpoints::select(&characteristics),
                        Err(e) => {
                            discovery.reject(&peer, e, true)?;
                            continue;
                        }
                    };
                    let Some(endpoints) = endpoints else {
                        let reason = "no usable notify/write characteristics".to_string();
                        discovery.reject(&peer, reason, true)?;
                        continue;
                    };
                    let Some(peripheral) = discovery.win(&peer) else {
                        continue;
                    };
                    info!("BLE stream bound to {}", peer);
                    let link = BleLink {
                        central: central.clone(),
                        peer,
                    };
                    let metadata = self.metadata(&peripheral);
                    let mut pair = characteristic_pair(link, endpoints, events);
                    pair.metadata = metadata;
                    return Ok(pair);
                }
                CentralEvent::L2capChannelOpened { peer, result } => {
                    if !discovery.candidates.contains_key(&peer) {
                        continue;
                    }
                    let channels = match result {
                        Ok(channels) => channels,
                        Err(e) => {
                            discovery.reject(&peer, e, true)?;
                            continue;
                        }
                    };
                    let Some(peripheral) = discovery.win(&peer) else {
                        continue;
                    };
                    info!("L2CAP channel open to {}", peer);
                    let link = BleLink {
                        central: central.clone(),
                        peer,
                    };
                    let metadata = self.metadata(&peripheral);
                    let mut pair = l2cap_pair(link, channels, events);
                    pair.metadata = metadata;
                    return Ok(pair);
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ble::mock::{Call, FakeDevice, MockStack};
    use crate::transport::TransportChannels;
    use bytes::Bytes;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const PEER_A: &str = "AAAAAAAA-0000-0000-0000-000000000001";
    const PEER_B: &str = "BBBBBBBB-0000-0000-0000-000000000002";

    fn connector(stack: &Arc<MockStack>, raw: &str) -> Box<dyn Connector> {
        let url = crate::target::parse_url(raw).unwrap();
        BleFactory::new(stack.clone()).create(&url).unwrap()
    }

    #[tokio::test]
    async fn test_first_bound_candidate_wins() {
        let stack = MockStack::new(vec![
            FakeDevice::serial(PEER_A, "FFE0"),
            FakeDevice::serial(PEER_B, "FFE0"),
        ]);

        let pair = connector(&stack, "ble://FFE0")
            .connect(CancelToken::new())
            .await
            .unwrap();

        let calls = stack.central.calls();
        assert!(calls.contains(&Call::Connect(PEER_A.into())));
        assert!(calls.contains(&Call::Connect(PEER_B.into())));
        assert!(calls.contains(&Call::StopScan));
        assert!(calls.contains(&Call::CancelConnection(PEER_B.into())));
        assert!(!calls.contains(&Call::CancelConnection(PEER_A.into())));
        assert_eq!(pair.metadata.name, "dev-AAAA");
        assert_eq!(pair.metadata.rssi, -60);
    }

    #[tokio::test]
    async fn test_pinned_peer_only() {
        let stack = MockStack::new(vec![
            FakeDevice::serial(PEER_A, "FFE0"),
            FakeDevice::serial(PEER_B, "FFE0"),
        ]);

        let _pair = connector(&stack, &format!("ble://FFE0/{}", PEER_B))
            .connect(CancelToken::new())
            .await
            .unwrap();

        assert_eq!(stack.central.count(|c| matches!(c, Call::Connect(_))), 1);
        assert!(stack.central.calls().contains(&Call::Connect(PEER_B.into())));
    }

    #[tokio::test]
    async fn test_already_connected_peripheral_is_used() {
        let mut device = FakeDevice::serial(PEER_A, "FFE0");
        device.already_connected = true;
        let stack = MockStack::new(vec![device]);

        let pair = connector(&stack, "ble://FFE0")
            .connect(CancelToken::new())
            .await
            .unwrap();

        let calls = stack.central.calls();
        assert_eq!(calls[0], Call::ConnectedPeripherals("FFE0".into()));
        assert_eq!(calls[1], Call::Connect(PEER_A.into()));
        assert_eq!(pair.metadata.name, "dev-AAAA");
    }

    #[tokio::test]
    async fn test_unsupported_adapter_fails() {
        let stack = MockStack::new(vec![]);
        *stack.state.lock() = AdapterState::Unsupported;

        let result = connector(&stack, "ble://FFE0")
            .connect(CancelToken::new())
            .await;
        assert!(matches!(result, Err(StreamError::UnableToConnect { .. })));
        assert!(stack.central.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_scan_and_disconnects_candidates() {
        let stack = MockStack::new(vec![FakeDevice::serial(PEER_A, "FFE0")]);
        stack.central.auto_respond.store(false, Ordering::SeqCst);
        let cancel = CancelToken::new();
        let attempt = tokio::spawn(connector(&stack, "ble://FFE0").connect(cancel.clone()));

        // Let it scan, then report an advertiser that never finishes connecting
        while !stack.central.calls().contains(&Call::Scan(vec!["FFE0".into()])) {
            tokio::task::yield_now().await;
        }
        stack.central.emit(CentralEvent::Discovered(Peripheral {
            id: PEER_A.into(),
            name: None,
            rssi: -70,
        }));
        while !stack.central.calls().contains(&Call::Connect(PEER_A.into())) {
            tokio::task::yield_now().await;
        }

        cancel.cancel(crate::cancel::CancelReason::Cancelled);
        let result = attempt.await.unwrap();
        assert!(matches!(result, Err(StreamError::Cancelled)));

        let calls = stack.central.calls();
        assert!(calls.contains(&Call::StopScan));
        assert!(calls.contains(&Call::CancelConnection(PEER_A.into())));
    }

    #[tokio::test]
    async fn test_adapter_reset_reconnects_candidate() {
        let stack = MockStack::new(vec![FakeDevice::serial(PEER_A, "FFE0")]);
        stack.central.auto_respond.store(false, Ordering::SeqCst);
        let cancel = CancelToken::new();
        let attempt = tokio::spawn(
            connector(&stack, &format!("ble://FFE0/{}", PEER_A)).connect(cancel.clone()),
        );
        let advertise = || {
            stack.central.emit(CentralEvent::Discovered(Peripheral {
                id: PEER_A.into(),
                name: None,
                rssi: -70,
            }))
        };
        let connects = || stack.central.count(|c| *c == Call::Connect(PEER_A.into()));

        while !stack.central.calls().iter().any(|c| matches!(c, Call::Scan(_))) {
            tokio::task::yield_now().await;
        }
        advertise();
        while connects() < 1 {
            tokio::task::yield_now().await;
        }

        stack
            .central
            .emit(CentralEvent::StateChanged(AdapterState::PoweredOff));
        stack
            .central
            .emit(CentralEvent::StateChanged(AdapterState::PoweredOn));
        advertise();
        tokio::time::timeout(Duration::from_secs(2), async {
            while connects() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("candidate not reconnected");
        assert_eq!(
            stack.central.count(|c| matches!(c, Call::Scan(_))),
            2
        );

        cancel.cancel(crate::cancel::CancelReason::Cancelled);
        assert!(matches!(
            attempt.await.unwrap(),
            Err(StreamError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_missing_service_rejects_candidate() {
        let mut device = FakeDevice::serial(PEER_A, "FFE0");
        device.services = vec!["180A".into()];
        // Still advertised for the scan, but the GATT table lacks the service
        let stack = MockStack::new(vec![device]);
        stack.central.auto_respond.store(false, Ordering::SeqCst);
        let cancel = CancelToken::new();
        let attempt = tokio::spawn(
            connector(&stack, &format!("ble://FFE0/{}", PEER_A)).connect(cancel.clone()),
        );

        while !stack.central.calls().iter().any(|c| matches!(c, Call::Scan(_))) {
            tokio::task::yield_now().await;
        }
        stack.central.emit(CentralEvent::Discovered(Peripheral {
            id: PEER_A.into(),
            name: None,
            rssi: -70,
        }));
        stack.central.emit(CentralEvent::Connected(PEER_A.into()));
        stack.central.emit(CentralEvent::ServicesDiscovered {
            peer: PEER_A.into(),
            result: Ok(vec!["180A".into()]),
        });

        let result = tokio::time::timeout(Duration::from_secs(2), attempt)
            .await
            .expect("timeout")
            .unwrap();
        assert!(matches!(result, Err(StreamError::UnableToConnect { .. })));
        assert!(stack
            .central
            .calls()
            .contains(&Call::CancelConnection(PEER_A.into())));
    }

    #[tokio::test]
    async fn test_l2cap_channel_with_psm() {
        let stack = MockStack::new(vec![FakeDevice::serial(PEER_A, "FFE0")]);
        let attempt =
            tokio::spawn(connector(&stack, "ble://FFE0:129").connect(CancelToken::new()));

        while !stack
            .central
            .calls()
            .contains(&Call::OpenL2cap(PEER_A.into(), 129))
        {
            tokio::task::yield_now().await;
        }
        let (to_stream, rx) = mpsc::channel::<std::io::Result<Bytes>>(4);
        let (tx, mut from_stream) = mpsc::channel::<Bytes>(4);
        stack.central.emit(CentralEvent::L2capChannelOpened {
            peer: PEER_A.into(),
            result: Ok(TransportChannels { rx, tx }),
        });

        let mut pair = tokio::time::timeout(Duration::from_secs(2), attempt)
            .await
            .expect("timeout")
            .unwrap()
            .unwrap();
        assert_eq!(
            stack
                .central
                .count(|c| matches!(c, Call::DiscoverCharacteristics(..))),
            0
        );

        pair.output.open();
        assert_eq!(pair.output.write(b"hello").unwrap(), 5);
        assert_eq!(from_stream.recv().await.unwrap().as_ref(), b"hello");
        drop(to_stream);
    }
}
