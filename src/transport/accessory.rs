//! External accessory capability provider
//!
//! Accessories are paired by the platform and expose one or more protocol
//! strings. A session on a protocol is a plain duplex byte channel.
//!
//! The platform announces newly connected accessories through a single
//! notification stream. `AccessoryHub` registers for it lazily, exactly
//! once per process, and fans it out to every waiting connector.

use super::TransportChannels;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Once, OnceLock};
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the connected-accessory fan-out
const NOTIFICATION_CAPACITY: usize = 16;

/// Hubs keyed by stack identity. Entries are never removed, so a stack
/// address cannot be reused while its hub is registered.
static HUBS: OnceLock<Mutex<HashMap<usize, Arc<AccessoryHub>>>> = OnceLock::new();

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessoryInfo {
    pub name: String,
    pub manufacturer: String,
    pub model_number: String,
    pub serial_number: String,
    pub hardware_revision: String,
    pub firmware_revision: String,
    pub protocols: Vec<String>,
}

impl AccessoryInfo {
    pub fn supports(&self, protocol: &str) -> bool {
        self.protocols.iter().any(|p| p == protocol)
    }
}

/// Entry point supplied by the platform
pub trait AccessoryStack: Send + Sync {
    /// Accessories currently attached
    fn connected_accessories(&self) -> Vec<AccessoryInfo>;

    /// Open a session for `protocol` on `accessory`
    fn open_session(
        &self,
        accessory: &AccessoryInfo,
        protocol: &str,
    ) -> Result<TransportChannels, String>;

    /// Start publishing "accessory connected" notifications into `sink`
    fn register_for_notifications(&self, sink: broadcast::Sender<AccessoryInfo>);
}

/// Shared access point to an `AccessoryStack`
pub struct AccessoryHub {
    stack: Arc<dyn AccessoryStack>,
    connected: broadcast::Sender<AccessoryInfo>,
    registered: Once,
}

impl AccessoryHub {
    /// The process-wide hub for `stack`
    ///
    /// Every broker built on the same stack shares one hub, and with it a
    /// single notification registration.
    pub fn for_stack(stack: Arc<dyn AccessoryStack>) -> Arc<AccessoryHub> {
        let key = Arc::as_ptr(&stack) as *const () as usize;
        HUBS.get_or_init(|| Mutex::new(HashMap::new()))
            .lock()
            .entry(key)
            .or_insert_with(|| Arc::new(AccessoryHub::new(stack)))
            .clone()
    }

    fn new(stack: Arc<dyn AccessoryStack>) -> Self {
        let (connected, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            stack,
            connected,
            registered: Once::new(),
        }
    }

    /// Subscribe to connected-accessory notifications
    ///
    /// The first subscriber triggers the one-time registration with the stack.
    pub fn subscribe(&self) -> broadcast::Receiver<AccessoryInfo> {
        let receiver = self.connected.subscribe();
        self.registered.call_once(|| {
            debug!("Registering for accessory notifications");
            self.stack.register_for_notifications(self.connected.clone());
        });
        receiver
    }

    /// An attached accessory speaking `protocol`, if any
    pub fn find_connected(&self, protocol: &str) -> Option<AccessoryInfo> {
        self.stack
            .connected_accessories()
            .into_iter()
            .find(|a| a.supports(protocol))
    }

    pub fn open_session(
        &self,
        accessory: &AccessoryInfo,
        protocol: &str,
    ) -> Result<TransportChannels, String> {
        self.stack.open_session(accessory, protocol)
    }
}


#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_registration_happens_once() {
        let stack = Arc::new(MockAccessoryStack::default());
        let hub = AccessoryHub::new(stack.clone());

        let _a = hub.subscribe();
        let _b = hub.subscribe();
        let _c = hub.subscribe();
        assert_eq!(stack.registrations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_one_hub_per_stack() {
        let stack = Arc::new(MockAccessoryStack::default());
        let other = Arc::new(MockAccessoryStack::default());

        let a = AccessoryHub::for_stack(stack.clone());
        let b = AccessoryHub::for_stack(stack.clone());
        let c = AccessoryHub::for_stack(other.clone());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        let _a = a.subscribe();
        let _b = b.subscribe();
        let _c = c.subscribe();
        assert_eq!(stack.registrations.load(Ordering::SeqCst), 1);
        assert_eq!(other.registrations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_every_subscriber_sees_notifications() {
        let stack = Arc::new(MockAccessoryStack::default());
        let hub = AccessoryHub::new(stack.clone());
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        stack.plug(accessory("Dongle", &["com.example.obd"]));

        assert_eq!(a.try_recv().unwrap().name, "Dongle");
        assert_eq!(b.try_recv().unwrap().name, "Dongle");
    }

    #[test]
    fn test_find_connected_by_protocol() {
        let stack = Arc::new(MockAccessoryStack::default());
        stack
            .attached
            .lock()
            .push(accessory("Scanner", &["com.example.a", "com.example.b"]));
        let hub = AccessoryHub::new(stack);

        assert!(hub.find_connected("com.example.b").is_some());
        assert!(hub.find_connected("com.example.c").is_none());
    }
}
