//! Re-exports of the types most callers need.
//!
//! Mirrors the teacher crate's `prelude` shape: `use charon::prelude::*;`
//! pulls in the fence and reservation surface without requiring callers to
//! name every submodule.

pub use crate::error::Error;
pub use crate::fence::seqno::{SeqnoFence, SeqnoFenceBuilder, SeqnoMemory};
pub use crate::fence::{AddCallbackOutcome, CallbackId, Fence, FenceOps};
pub use crate::interrupt::Interrupt;
pub use crate::reservation::{
    BufferObject, Intent, Reservation, ReservationBatch, Ticket, ValidationEntry,
};
