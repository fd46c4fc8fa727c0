//! Exposes the charon error type.

use std::sync::PoisonError;

use thiserror::Error;

/// Error type that charon operations can return.
///
/// Most variants are reported back to the caller for policy, per the
/// spec's error handling design: only ticket contention inside
/// [`reserve`](crate::reservation::ReservationBatch::reserve) is retried
/// silently by the core.
#[derive(Error, Debug)]
pub enum Error {
    /// `signal` was called on a fence that had already transitioned to
    /// signaled. Not fatal: the fence's state is unchanged.
    #[error("fence was already signaled")]
    AlreadySignaled,
    /// A blocking wait was woken by its [`Interrupt`](crate::Interrupt)
    /// before the fence signaled.
    #[error("wait was interrupted")]
    Interrupted,
    /// A blocking wait exhausted its timeout budget before the fence (or,
    /// for a reservation batch, every collected fence) signaled.
    #[error("wait timed out")]
    Timeout,
    /// A shared-intent reservation entry named a buffer that already holds
    /// `MAX_SHARED_FENCE` shared fences; the batch was rolled back.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// An internal lock was poisoned by a panicking thread. charon never
    /// panics while holding a lock itself, so this should only surface if
    /// a caller's own code (a fence's `enable_signaling` hook, a callback)
    /// panicked while holding one.
    #[error("internal lock poisoned")]
    PoisonError,
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::PoisonError
    }
}
