//! Single-fire result slot.
//!
//! Timers, hardware callbacks and explicit stops may all try to finish the
//! same operation. The slot is emptied atomically on first use, so exactly
//! one of them delivers a value and the rest become no-ops.

use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;

/// Pending caller result, completed at most once
#[derive(Debug)]
pub struct PendingResult<T> {
    slot: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> PendingResult<T> {
    /// Creates a slot together with the receiver the caller awaits
    pub fn channel() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                slot: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    fn take(&self) -> Option<oneshot::Sender<T>> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Delivers `value` if nothing has been delivered yet.
    ///
    /// Returns `true` only for the call that consumed the slot and reached a
    /// still-listening caller.
    pub fn complete(&self, value: T) -> bool {
        match self.take() {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Consumes the slot without delivering a value
    pub fn release(&self) -> bool {
        self.take().is_some()
    }
}
