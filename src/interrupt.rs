//! Opt-in cancellation handle for blocking waits.
//!
//! The spec this crate implements assumes a kernel-style "thread-directed
//! signal" can interrupt a blocking wait at any time. A user-space Rust
//! library has no equivalent ambient mechanism, so cancellation here is an
//! explicit collaborator the caller constructs and threads through
//! [`Fence::wait`](crate::fence::Fence::wait) /
//! [`Fence::wait_timeout`](crate::fence::Fence::wait_timeout) and the
//! analogous [`ReservationBatch::wait`](crate::reservation::ReservationBatch::wait).
//! Callers that never need cancellation simply pass `None`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A handle that can cancel an in-progress blocking wait from any thread.
///
/// Cloning an `Interrupt` shares the same underlying flag: triggering any
/// clone interrupts every wait currently holding (or later given) a clone
/// of the same handle.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    /// Create a fresh, untriggered interrupt handle.
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Trigger the interrupt. Any wait currently blocked on this handle (or
    /// one of its clones) will wake and return
    /// [`Error::Interrupted`](crate::Error::Interrupted).
    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns whether the interrupt has been triggered.
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Reset the interrupt to its untriggered state so the handle can be
    /// reused for a subsequent wait.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}
