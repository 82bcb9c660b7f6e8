//! Cooperative cancellation of in-flight client calls.
//!
//! A call waiting for its reply checks its token at every I/O wait; once the
//! paired handle fires, the wait returns `Cancelled` and no further
//! retransmission happens.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Why a call was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelReason {
    /// The caller gave up.
    #[default]
    UserRequested,
    /// The process is shutting down.
    Shutdown,
    /// A newer call replaced this one.
    Superseded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::UserRequested => write!(f, "UserRequested"),
            CancelReason::Shutdown => write!(f, "Shutdown"),
            CancelReason::Superseded => write!(f, "Superseded"),
        }
    }
}

struct CancelState {
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    notify: Notify,
}

/// Observer side of a cancellation pair, passed to calls.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        new_cancel_pair().0
    }

    /// Whether the paired handle has fired.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// The reason given by the handle, once fired.
    pub fn cancelled_reason(&self) -> Option<CancelReason> {
        *self
            .state
            .reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Completes once the paired handle fires.
    pub async fn cancelled(&self) -> CancelReason {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(reason) = self.cancelled_reason() {
                return reason;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Trigger side of a cancellation pair.
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    /// Fires the pair. Later calls keep the first reason.
    pub fn cancel(&self, reason: CancelReason) {
        {
            let mut r = self
                .state
                .reason
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if r.is_none() {
                *r = Some(reason);
            }
        }
        self.state.cancelled.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }
}

/// Creates a connected token and handle.
pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let state = Arc::new(CancelState {
        cancelled: AtomicBool::new(false),
        reason: Mutex::new(None),
        notify: Notify::new(),
    });
    (
        CancelToken {
            state: state.clone(),
        },
        CancelHandle { state },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_token_new() {
        let (token, _handle) = new_cancel_pair();
        assert!(!token.is_cancelled());
        assert_eq!(token.cancelled_reason(), None);
    }

    #[test]
    fn test_cancel_handle_cancels_token() {
        let (token, handle) = new_cancel_pair();
        handle.cancel(CancelReason::UserRequested);
        assert!(token.is_cancelled());
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_first_reason_wins() {
        let (token, handle) = new_cancel_pair();
        handle.cancel(CancelReason::Shutdown);
        handle.cancel(CancelReason::Superseded);
        assert_eq!(token.cancelled_reason(), Some(CancelReason::Shutdown));
    }

    #[test]
    fn test_cancel_token_clone() {
        let (token, handle) = new_cancel_pair();
        let token_clone = token.clone();
        handle.cancel(CancelReason::Shutdown);
        assert!(token.is_cancelled());
        assert!(token_clone.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let (token, handle) = new_cancel_pair();
        let waiter = tokio::spawn(async move { token.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel(CancelReason::Superseded);
        assert_eq!(waiter.await.unwrap(), CancelReason::Superseded);
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_fired() {
        let (token, handle) = new_cancel_pair();
        handle.cancel(CancelReason::UserRequested);
        assert_eq!(token.cancelled().await, CancelReason::UserRequested);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_token_stays_pending() {
        let token = CancelToken::never();
        let res = tokio::time::timeout(Duration::from_secs(60), token.cancelled()).await;
        assert!(res.is_err());
    }
}
