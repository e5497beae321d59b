//! Traffic statistics for a stream pair
//!
//! Lock-free counters updated on every successful `read`/`write`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Byte and call counters shared by both streams of a pair
pub struct Stats {
    /// Total bytes accepted by `write`
    tx_total: AtomicU64,
    /// Total bytes returned by `read`
    rx_total: AtomicU64,
    /// Number of `write` calls that accepted at least one byte
    writes: AtomicU64,
    /// Number of `read` calls that returned at least one byte
    reads: AtomicU64,
    start_time: Instant,
}

/// Point-in-time copy of `Stats`
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub writes: u64,
    pub reads: u64,
    pub uptime_secs: f64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            tx_total: AtomicU64::new(0),
            rx_total: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Add bytes accepted by the output stream
    #[inline]
    pub fn add_tx(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        self.tx_total.fetch_add(bytes as u64, Ordering::Relaxed);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Add bytes consumed from the input stream
    #[inline]
    pub fn add_rx(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        self.rx_total.fetch_add(bytes as u64, Ordering::Relaxed);
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn tx_bytes(&self) -> u64 {
        self.tx_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn rx_bytes(&self) -> u64 {
        self.rx_total.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx_bytes: self.tx_bytes(),
            rx_bytes: self.rx_bytes(),
            writes: self.writes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}
