//! Shared interrupt signal for cooperative cancellation.
//!
//! The controller and the engine thread hold clones of the same buffer. The
//! controller writes [`SIGINT`]; the engine polls between evaluation steps and
//! resets the slot when it acts on it.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Sentinel written into the buffer to request an interrupt.
pub const SIGINT: i32 = 2;

#[derive(Debug, Clone, Default)]
pub struct InterruptBuffer {
    slot: Arc<AtomicI32>,
}

impl InterruptBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an interrupt at the engine's next checkpoint.
    pub fn trigger(&self) {
        self.slot.store(SIGINT, Ordering::SeqCst);
    }

    /// Forget any pending request. Called before each new run.
    pub fn clear(&self) {
        self.slot.store(0, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.slot.load(Ordering::SeqCst) == SIGINT
    }

    /// Consume a pending request, returning whether one was set.
    pub fn take(&self) -> bool {
        self.slot
            .compare_exchange(SIGINT, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}
