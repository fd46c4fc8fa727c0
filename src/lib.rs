//! Cross-device asynchronous synchronization substrate.
//!
//! `charon` provides two tightly coupled primitives for coordinating the
//! handoff of shared buffers between independent execution engines that run
//! concurrently and cannot block each other's command streams:
//!
//! - [`fence`] — a single-shot, one-way software synchronization object that
//!   transitions exactly once from unsignaled to signaled, with a protocol
//!   that lets its creator defer enabling the (potentially expensive)
//!   signaling mechanism until some other party actually needs a
//!   notification.
//! - [`reservation`] — a protocol for atomically acquiring exclusive access
//!   to an ordered set of shared buffers in an arbitrary, caller-chosen
//!   order, with guaranteed deadlock freedom among concurrent multi-buffer
//!   reservations, followed by attaching a new fence that represents the
//!   work about to be submitted.
//!
//! Neither layer knows anything about the representation of the shared
//! buffers themselves, how work is submitted to an execution engine, or any
//! particular device driver: those are external collaborators. The core
//! consumes from a buffer object only the small per-object state block
//! described by [`reservation::BufferObject`].
//!
//! # Example
//!
//! ```
//! use std::thread;
//!
//! use charon::fence::Fence;
//!
//! let fence = Fence::new_software();
//! let waiter = fence.clone();
//! thread::spawn(move || {
//!     waiter.wait(None).unwrap();
//! });
//! fence.signal().unwrap();
//! ```

#[macro_use]
extern crate derivative;
#[macro_use]
extern crate log;

pub mod error;
pub mod fence;
pub mod interrupt;
pub mod prelude;
pub mod reservation;

pub use crate::error::Error;
pub use crate::fence::Fence;
pub use crate::interrupt::Interrupt;
pub use crate::reservation::{Intent, ReservationBatch, Ticket, ValidationEntry};
