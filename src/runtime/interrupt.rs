//! Cooperative cancellation flag, checked at action and branch boundaries by
//! the runtime loop rather than by aborting an in-flight task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// A cheaply cloneable cancellation signal. `trigger()` is idempotent and
/// wakes anyone parked in `notified()`; `check()` is a non-blocking poll used
/// at action/branch boundaries.
#[derive(Clone, Debug)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Interrupt {
    pub fn new() -> Self {
        Interrupt {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn check(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Resolves once `trigger()` has been called, or immediately if it
    /// already has been.
    pub async fn cancelled(&self) {
        if self.check() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}
