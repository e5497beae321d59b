//! Cooperative, at-most-once cancellation
//!
//! A `CancelToken` is shared between the broker (which cancels), the
//! deadline timer (which times out) and a connector or bridge (which
//! observes). The first reason recorded wins; later calls are no-ops.

use crate::error::StreamError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Why a token fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Explicit cancellation by the caller
    Cancelled,
    /// The connection deadline elapsed
    TimedOut(Duration),
    /// The owning stream pair was closed
    Closed,
}

impl From<CancelReason> for StreamError {
    fn from(reason: CancelReason) -> Self {
        match reason {
            CancelReason::Cancelled => StreamError::Cancelled,
            CancelReason::TimedOut(after) => StreamError::Timeout { after },
            CancelReason::Closed => StreamError::Disconnected,
        }
    }
}

/// Cloneable cancellation handle
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<Option<CancelReason>>>,
    rx: watch::Receiver<Option<CancelReason>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Fire the token. Returns `true` if this call recorded the reason.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The recorded reason, if the token has fired
    pub fn reason(&self) -> Option<CancelReason> {
        *self.rx.borrow()
    }

    /// Wait until the token fires
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.rx.clone();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            // The sender lives as long as `self`, so this cannot fail
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Wrap the token so that it fires with `Closed` when the guard is dropped
    pub fn drop_guard(self) -> DropGuard {
        DropGuard(self)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Fires its token with `CancelReason::Closed` on drop
pub struct DropGuard(CancelToken);

impl Drop for DropGuard {
    fn drop(&mut self) {
        self.0.cancel(CancelReason::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        assert!(token.cancel(CancelReason::Cancelled));
        assert!(!token.cancel(CancelReason::TimedOut(Duration::from_secs(1))));
        assert_eq!(token.reason(), Some(CancelReason::Cancelled));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::task::yield_now().await;
        token.cancel(CancelReason::TimedOut(Duration::from_millis(5)));

        let reason = handle.await.unwrap();
        assert_eq!(reason, CancelReason::TimedOut(Duration::from_millis(5)));
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_fired() {
        let token = CancelToken::new();
        token.cancel(CancelReason::Closed);
        assert_eq!(token.cancelled().await, CancelReason::Closed);
    }

    #[test]
    fn test_drop_guard_fires_closed() {
        let token = CancelToken::new();
        let guard = token.clone().drop_guard();
        assert!(!token.is_cancelled());
        drop(guard);
        assert_eq!(token.reason(), Some(CancelReason::Closed));
    }

    #[test]
    fn test_reason_maps_to_error() {
        assert!(matches!(
            StreamError::from(CancelReason::Cancelled),
            StreamError::Cancelled
        ));
        assert!(matches!(
            StreamError::from(CancelReason::TimedOut(Duration::from_secs(2))),
            StreamError::Timeout { after } if after == Duration::from_secs(2)
        ));
    }
}
