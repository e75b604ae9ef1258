//! Run-wide abort signalling.
//!
//! One [`AbortSignal`] is shared by every task of a single run. It is
//! checked synchronously at the top of each stage attempt and awaited
//! inside backoff sleeps so a pending retry is discarded the moment the
//! signal fires.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Shared abort flag for one pipeline run.
///
/// Firing is idempotent: only the first reason is kept.
pub struct AbortSignal {
    aborted: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: Notify,
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.aborted.load(Ordering::SeqCst))
            .field("reason", &self.reason.lock())
            .finish()
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self {
            aborted: AtomicBool::new(false),
            reason: Mutex::new(None),
            notify: Notify::new(),
        }
    }
}

impl AbortSignal {
    /// Creates a new, unfired abort signal.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns true once the signal has fired.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Returns the abort reason, if fired.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Fires the signal. Only the first reason is stored.
    pub fn abort(&self, reason: impl Into<String>) {
        if !self.aborted.swap(true, Ordering::SeqCst) {
            *self.reason.lock() = Some(reason.into());
        }
        self.notify.notify_waiters();
    }

    /// Resolves once the signal fires. Returns immediately if it
    /// already has.
    pub async fn fired(&self) {
        while !self.is_aborted() {
            let notified = self.notify.notified();
            // Re-check after registering so an abort between the check
            // and the await is not missed.
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}
