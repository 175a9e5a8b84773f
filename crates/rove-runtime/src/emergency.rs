//! [`EmergencyStop`] – the cancellation token shared by one behavior run.
//!
//! Cloning yields another handle to the same flag. Once triggered it stays
//! triggered; start a new run with a fresh token.
//!
//! # Example
//!
//! ```rust
//! use rove_runtime::emergency::EmergencyStop;
//!
//! let stop = EmergencyStop::new();
//! let handle = stop.clone();
//! assert!(!stop.is_triggered());
//! handle.trigger();
//! assert!(stop.is_triggered());
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    triggered: AtomicBool,
    notify: Notify,
}

#[derive(Clone, Default)]
pub struct EmergencyStop {
    inner: Arc<Inner>,
}

impl EmergencyStop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake every task waiting in [`triggered`][Self::triggered].
    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Resolve once the flag is raised.
    pub async fn triggered(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for EmergencyStop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmergencyStop")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}
