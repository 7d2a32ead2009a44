// SPDX-License-Identifier: MPL-2.0

use std::sync::{Condvar, Mutex, PoisonError};

/// A queue of threads waiting for a condition to become true.
///
/// Completion paths call `wake_all` after publishing their state change;
/// `wait_until` re-checks the condition under the internal lock, so a wakeup
/// between the check and the sleep cannot be lost.
#[derive(Debug, Default)]
pub struct WaitQueue {
    guard: Mutex<()>,
    cond: Condvar,
}

impl WaitQueue {
    /// Creates a new, empty wait queue.
    pub const fn new() -> Self {
        Self {
            guard: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Blocks the current thread until `cond` returns `Some`.
    pub fn wait_until<F, R>(&self, mut cond: F) -> R
    where
        F: FnMut() -> Option<R>,
    {
        if let Some(res) = cond() {
            return res;
        }

        let mut guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(res) = cond() {
                return res;
            }
            guard = self
                .cond
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wakes every thread blocked in `wait_until`.
    pub fn wake_all(&self) {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        self.cond.notify_all();
    }
}
