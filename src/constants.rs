//! Application-wide constants
//!
//! Centralized constants to avoid duplication and ensure consistency.

// =============================================================================
// Buffers
// =============================================================================

/// Read buffer size for socket and serial reader loops
pub const IO_BUFFER_SIZE: usize = 4096;

/// Channel capacity for transport byte channels
pub const CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Serial
// =============================================================================

/// Rate used to open a TTY when the target does not request one
pub const DEFAULT_TTY_BAUD: u32 = 115_200;

/// Serial read timeout; bounds how quickly reader threads notice shutdown
pub const SERIAL_READ_TIMEOUT_MS: u64 = 10;

/// Consecutive zero-byte reads before assuming port disconnected
pub const SERIAL_DISCONNECT_THRESHOLD: u32 = 10;

// =============================================================================
// Targets
// =============================================================================

/// Length of a BLE peer identifier (canonical UUID string)
pub const BLE_PEER_ID_LEN: usize = 36;

/// Length of a Bluetooth hardware address (`AA-BB-CC-DD-EE-FF`)
pub const HARDWARE_ADDRESS_LEN: usize = 17;

/// Serial Port Profile service class, looked up when no RFCOMM channel is given
pub const SPP_SERVICE_CLASS: u16 = 0x1101;

// =============================================================================
// Timing
// =============================================================================

/// How long the broker waits for a connector to clean up after cancellation
pub const DEFAULT_CANCEL_GRACE_MS: u64 = 500;
