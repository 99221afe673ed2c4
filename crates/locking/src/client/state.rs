//! Lifecycle of a lock client
//!
//! The stopped flag and the number of operations in progress share one atomic
//! word, so "not stopped" and "register as active" happen in a single step
//! and `stop` can never miss an operation that entered before it.

use std::sync::atomic::{AtomicU32, Ordering};

const STOPPED: u32 = 1 << 31;
const ACTIVE_MASK: u32 = STOPPED - 1;

#[derive(Debug, Default)]
pub(crate) struct ClientState {
    word: AtomicU32,
}

impl ClientState {
    /// Register an operation, unless the client is stopped
    pub(crate) fn enter(&self) -> Option<ActiveGuard<'_>> {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            if current & STOPPED != 0 {
                return None;
            }
            match self.word.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(ActiveGuard { state: self }),
                Err(actual) => current = actual,
            }
        }
    }

    /// Set the stopped flag. Returns false if it was already set.
    pub(crate) fn stop(&self) -> bool {
        self.word.fetch_or(STOPPED, Ordering::AcqRel) & STOPPED == 0
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.word.load(Ordering::Acquire) & STOPPED != 0
    }

    pub(crate) fn active_count(&self) -> u32 {
        self.word.load(Ordering::Acquire) & ACTIVE_MASK
    }
}

/// Marks one operation as in progress until dropped
pub(crate) struct ActiveGuard<'a> {
    state: &'a ClientState,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.state.word.fetch_sub(1, Ordering::AcqRel);
    }
}
