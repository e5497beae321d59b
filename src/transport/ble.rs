//! Bluetooth Low Energy capability provider
//!
//! The platform supplies a `BleStack`. Each connection attempt opens its
//! own central session: a `BleCentral` command surface plus a stream of
//! `CentralEvent`s. Commands never block; their outcome arrives later as
//! an event, the way native BLE stacks report through delegate callbacks.

use super::TransportChannels;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Platform peripheral identifier (a 36-char UUID string)
pub type PeerId = String;

/// Power/authorization state of the local adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub notify: bool,
    pub indicate: bool,
    pub write: bool,
    pub write_without_response: bool,
}

impl CharacteristicProperties {
    /// Usable as the read side of a stream
    pub fn is_readable(&self) -> bool {
        self.notify || self.indicate
    }

    /// Usable as the write side of a stream
    pub fn is_writable(&self) -> bool {
        self.write || self.write_without_response
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub id: String,
    pub properties: CharacteristicProperties,
}

/// An advertiser or already-connected device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peripheral {
    pub id: PeerId,
    pub name: Option<String>,
    /// Last known signal strength in dBm
    pub rssi: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// Native outcomes, delivered in the order the stack produced them
pub enum CentralEvent {
    StateChanged(AdapterState),
    Discovered(Peripheral),
    Connected(PeerId),
    FailedToConnect {
        peer: PeerId,
        reason: String,
    },
    Disconnected {
        peer: PeerId,
        reason: Option<String>,
    },
    /// Services found on `peer` (ids as reported by the stack)
    ServicesDiscovered {
        peer: PeerId,
        result: Result<Vec<String>, String>,
    },
    CharacteristicsDiscovered {
        peer: PeerId,
        service: String,
        result: Result<Vec<Characteristic>, String>,
    },
    L2capChannelOpened {
        peer: PeerId,
        result: Result<TransportChannels, String>,
    },
    NotificationStateChanged {
        peer: PeerId,
        characteristic: String,
        result: Result<bool, String>,
    },
    ValueUpdated {
        peer: PeerId,
        characteristic: String,
        result: Result<Bytes, String>,
    },
    WriteCompleted {
        peer: PeerId,
        characteristic: String,
        result: Result<(), String>,
    },
    /// The stack can accept another write-without-response
    ReadyToSendWithoutResponse {
        peer: PeerId,
    },
}

/// Command surface of one central session
pub trait BleCentral: Send + Sync {
    /// Peripherals already connected to this host that expose `service`
    fn connected_peripherals(&self, service: &str) -> Vec<Peripheral>;
    fn scan(&self, services: &[String]);
    fn stop_scan(&self);
    fn connect(&self, peer: &str);
    fn cancel_connection(&self, peer: &str);
    fn discover_services(&self, peer: &str, services: &[String]);
    fn discover_characteristics(&self, peer: &str, service: &str);
    fn open_l2cap_channel(&self, peer: &str, psm: u16);
    fn set_notify(&self, peer: &str, characteristic: &str, enabled: bool);
    fn write_value(&self, peer: &str, characteristic: &str, data: Bytes, mode: WriteMode);
    /// Largest single write the stack reports for `mode`
    fn maximum_write_length(&self, peer: &str, mode: WriteMode) -> usize;
    fn can_send_write_without_response(&self, peer: &str) -> bool;
}

/// Entry point supplied by the platform
pub trait BleStack: Send + Sync {
    /// Open a central session
    ///
    /// The stack reports the adapter state as the first event.
    fn central(&self) -> (Arc<dyn BleCentral>, mpsc::UnboundedReceiver<CentralEvent>);
}
