//! Transport bridges
//!
//! A bridge owns one native transport handle for the lifetime of a stream
//! pair and adapts its callbacks to the stream contract:
//! - `channel`: byte-channel transports (TCP, TTY, accessory sessions)
//! - `l2cap`: BLE L2CAP channels (channel bridge + peripheral ownership)
//! - `characteristic`: BLE GATT characteristic pairs
//! - `rfcomm`: classic Bluetooth RFCOMM channels
//!
//! Every bridge ends both streams when its native link goes away and
//! releases the native handle once both streams are closed.

pub mod channel;
pub(crate) mod characteristic;
pub(crate) mod l2cap;
pub(crate) mod rfcomm;

pub use channel::channel_pair;
