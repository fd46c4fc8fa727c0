//! Wound-wait multi-buffer reservation batches.
//!
//! Given a caller-chosen, ordered list of `{buffer, intent}` pairs, a
//! [`ReservationBatch`] atomically acquires exclusive access to every
//! buffer, snapshots the fences already guarding each one, and — once the
//! caller's own work is ready to submit — installs a new fence so future
//! reservers can see the work in flight. Two batches that pick up
//! overlapping buffer sets in different orders never deadlock: each batch
//! is stamped with a monotonically increasing ticket when it starts, and
//! contention is broken by ticket age (wound-wait), never by which batch
//! got there first.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::fence::Fence;
use crate::interrupt::Interrupt;

/// Fixed bound on the number of shared fences a single buffer may carry at
/// once. A shared-intent reservation against a buffer already at this
/// bound fails with [`Error::InvalidArgument`] rather than growing the set
/// further.
pub const MAX_SHARED_FENCE: usize = 8;

/// Single process-wide lock serializing every buffer's `reserved` flag and
/// fence-array mutations. Held only long enough to update state; always
/// released before a batch parks on a buffer's `event_queue`, and never
/// held across a fence's `enable_signaling` hook or a blocking wait.
static RESERVE_LOCK: Mutex<()> = Mutex::new(());

/// Monotonically increasing ticket counter, stamped on each [`reserve`]
/// attempt. Wraps at `u32::MAX`; comparisons use wrapping, signed
/// arithmetic so an older ticket is still recognized as older after wrap.
///
/// [`reserve`]: ReservationBatch::reserve
static BATCH_SEQ: AtomicU32 = AtomicU32::new(0);

/// Monotonically increasing identifier drawn at the start of a
/// [`ReservationBatch::reserve`] attempt, used to break deadlocks between
/// batches contending for overlapping buffer sets: the batch with the
/// older (smaller, wraparound-aware) ticket is never forced to back off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u32);

impl Ticket {
    fn next() -> Self {
        Ticket(BATCH_SEQ.fetch_add(1, Ordering::Relaxed))
    }

    /// True iff `self` was drawn strictly before `other`, tolerant of
    /// `BATCH_SEQ` wrapping past `u32::MAX`.
    fn is_older_than(self, other: Ticket) -> bool {
        (self.0.wrapping_sub(other.0) as i32) < 0
    }
}

/// Whether a [`ValidationEntry`] wants shared or exclusive access to its
/// buffer. Shared entries coexist with other shared entries on the same
/// buffer; an exclusive entry requires that all of a buffer's prior
/// fences complete before the exclusive entry's own new fence takes
/// effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Coexists with other shared-intent reservations on the same buffer.
    Shared,
    /// Requires exclusive access; on commit, replaces every fence
    /// currently attached to the buffer.
    Exclusive,
}

#[derive(Debug, Default)]
struct ReservationFields {
    reserved: bool,
    ticket: Option<Ticket>,
    fence_excl: Option<Fence>,
    fence_shared: Vec<Fence>,
}

/// The per-object state block the reservation core needs from a shared
/// buffer: whether it is currently exclusively held, by which ticket, and
/// the fences attached to it. Buffer object types embed a `Reservation`
/// and expose it through [`BufferObject::reservation`]; the core never
/// looks at anything else about the buffer.
///
/// All fields are mutated only while [`RESERVE_LOCK`] is held by whichever
/// batch operation (`reserve`, `back_off`, `commit`) is touching them, so
/// the per-object [`Mutex`] here is never contended in practice — it
/// exists to give Rust safe interior mutability for state that is,
/// logically, guarded by one process-wide lock.
#[derive(Debug)]
pub struct Reservation {
    fields: Mutex<ReservationFields>,
    event_queue: Condvar,
}

impl Reservation {
    /// Create a fresh, unreserved reservation block with no attached
    /// fences.
    pub fn new() -> Self {
        Reservation {
            fields: Mutex::new(ReservationFields::default()),
            event_queue: Condvar::new(),
        }
    }

    /// Whether some batch currently holds this buffer reserved.
    pub fn is_reserved(&self) -> bool {
        self.fields.lock().map(|f| f.reserved).unwrap_or(true)
    }

    /// The buffer's current exclusive fence, if any.
    pub fn exclusive_fence(&self) -> Option<Fence> {
        self.fields.lock().ok().and_then(|f| f.fence_excl.clone())
    }

    /// The buffer's current shared fences.
    pub fn shared_fences(&self) -> Vec<Fence> {
        self.fields
            .lock()
            .map(|f| f.fence_shared.clone())
            .unwrap_or_default()
    }
}

impl Default for Reservation {
    fn default() -> Self {
        Self::new()
    }
}

/// A buffer object external to this crate: the representation of the
/// shared buffer itself, and the mechanism work is submitted through for
/// it, are both out of scope here (see `spec.md` §1). All the core needs
/// is access to the buffer's [`Reservation`] block.
pub trait BufferObject: Send + Sync + fmt::Debug {
    /// Borrow this buffer's reservation state block.
    fn reservation(&self) -> &Reservation;
}

#[derive(Derivative)]
#[derivative(Debug)]
struct EntryState {
    reserved: bool,
    collected: Vec<Fence>,
}

/// A buffer object plus the caller's intent (shared or exclusive) for it,
/// and a slot for the fences collected during [`ReservationBatch::reserve`].
///
/// `collected_fences` is only meaningful between a successful `reserve`
/// and the following `commit` or `back_off`. The entry's own refcount
/// (standard `Arc` cloning via [`ValidationEntry::validate_get`] /
/// [`ValidationEntry::validate_put`]) can double as a join counter for the
/// deferred-completion pattern: clone once per collected fence, register a
/// callback on each that drops its clone, and a custom destructor (see
/// [`ValidationEntry::set_destructor`]) fires once every prerequisite has
/// signaled.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct ValidationEntry {
    buffer: Arc<dyn BufferObject>,
    intent: Intent,
    state: Mutex<EntryState>,
    #[derivative(Debug = "ignore")]
    on_drop: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ValidationEntry {
    /// Create a new, not-yet-reserved validation entry for `buffer` with
    /// the given `intent`.
    pub fn new(buffer: Arc<dyn BufferObject>, intent: Intent) -> Arc<Self> {
        Arc::new(ValidationEntry {
            buffer,
            intent,
            state: Mutex::new(EntryState {
                reserved: false,
                collected: Vec::new(),
            }),
            on_drop: Mutex::new(None),
        })
    }

    /// The buffer this entry names.
    pub fn buffer(&self) -> &Arc<dyn BufferObject> {
        &self.buffer
    }

    /// The access intent this entry was created with.
    pub fn intent(&self) -> Intent {
        self.intent
    }

    /// Whether this entry's buffer is currently reserved by the batch that
    /// owns this entry.
    pub fn is_reserved(&self) -> bool {
        self.state.lock().map(|s| s.reserved).unwrap_or(false)
    }

    /// The fences collected for this entry by the most recent successful
    /// `reserve`.
    pub fn collected_fences(&self) -> Vec<Fence> {
        self.state
            .lock()
            .map(|s| s.collected.clone())
            .unwrap_or_default()
    }

    /// `validate_get`: take another reference to this entry.
    pub fn validate_get(self: &Arc<Self>) -> Arc<Self> {
        Arc::clone(self)
    }

    /// `validate_put`: release a reference taken with `validate_get`.
    pub fn validate_put(entry: Arc<Self>) {
        drop(entry);
    }

    /// Install a destructor to run once the last reference to this entry
    /// is dropped, replacing the default (simply freeing the entry) — for
    /// example to remove it from an external tracking list.
    pub fn set_destructor(&self, f: impl FnOnce() + Send + 'static) {
        if let Ok(mut slot) = self.on_drop.lock() {
            *slot = Some(Box::new(f));
        }
    }

    fn reset_for_attempt(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.reserved = false;
            state.collected.clear();
        }
    }

    fn mark_reserved(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.reserved = true;
        }
    }

    fn take_reserved(&self) -> bool {
        self.state
            .lock()
            .map(|mut s| std::mem::replace(&mut s.reserved, false))
            .unwrap_or(false)
    }

    fn set_collected(&self, fences: Vec<Fence>) {
        if let Ok(mut state) = self.state.lock() {
            state.collected = fences;
        }
    }

    fn clear_collected(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.collected.clear();
        }
    }
}

impl Drop for ValidationEntry {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.on_drop.lock() {
            if let Some(f) = slot.take() {
                f();
            }
        }
    }
}

/// An ordered, caller-chosen sequence of [`ValidationEntry`] values driven
/// through `reserve` → (optionally `wait`) → `commit`, or abandoned with
/// `back_off`.
#[derive(Debug)]
pub struct ReservationBatch {
    entries: Vec<Arc<ValidationEntry>>,
}

impl ReservationBatch {
    /// Build a batch over `entries`, in the order the caller wants them
    /// locked. The manager tolerates any ordering across concurrent
    /// batches but never reorders a single batch's own list.
    pub fn new(entries: Vec<Arc<ValidationEntry>>) -> Self {
        ReservationBatch { entries }
    }

    /// The entries making up this batch.
    pub fn entries(&self) -> &[Arc<ValidationEntry>] {
        &self.entries
    }

    /// `reserve`: atomically acquire every buffer in the list and snapshot
    /// their currently attached fences.
    ///
    /// Implements wound-wait deadlock breaking: each attempt draws a fresh
    /// [`Ticket`]; losing a contested buffer to an older ticket backs off
    /// everything already acquired this attempt and restarts from scratch,
    /// while winning against a younger ticket just waits for it to free
    /// up. The older ticket is never forced to back off, so the batch with
    /// the globally oldest ticket always makes progress.
    pub fn reserve(&mut self) -> Result<(), Error> {
        if self.entries.is_empty() {
            return Err(Error::InvalidArgument("reservation batch must not be empty"));
        }

        'restart: loop {
            for entry in &self.entries {
                entry.reset_for_attempt();
            }

            let mut guard = RESERVE_LOCK.lock()?;
            let ticket = Ticket::next();
            trace!("reserve: drew ticket {:?}", ticket);

            let mut acquired: Vec<usize> = Vec::new();
            let mut index = 0;
            while index < self.entries.len() {
                let reservation = self.entries[index].buffer.reservation();
                let mut fields = reservation.fields.lock()?;

                if !fields.reserved {
                    fields.reserved = true;
                    fields.ticket = Some(ticket);
                    drop(fields);
                    acquired.push(index);
                    index += 1;
                    continue;
                }

                if fields.ticket == Some(ticket) {
                    // Same buffer named twice in this batch: re-entrant.
                    index += 1;
                    continue;
                }

                let holder = fields
                    .ticket
                    .expect("a reserved buffer always carries its holder's ticket");
                if ticket.is_older_than(holder) {
                    trace!(
                        "reserve: ticket {:?} outranks holder {:?}, waiting for buffer to free",
                        ticket,
                        holder
                    );
                    drop(fields);
                    drop(guard);
                    Self::wait_for_buffer_free(reservation)?;
                    guard = RESERVE_LOCK.lock()?;
                    // Retry the same buffer without advancing `index`.
                } else {
                    debug!(
                        "reserve: ticket {:?} backs off to older holder {:?}",
                        ticket, holder
                    );
                    drop(fields);
                    for &acquired_index in acquired.iter().rev() {
                        let other = self.entries[acquired_index].buffer.reservation();
                        let mut other_fields = other.fields.lock()?;
                        other_fields.reserved = false;
                        other_fields.ticket = None;
                        drop(other_fields);
                        other.event_queue.notify_all();
                    }
                    drop(guard);
                    Self::wait_for_buffer_free(reservation)?;
                    continue 'restart;
                }
            }
            drop(guard);

            for entry in &self.entries {
                entry.mark_reserved();
            }

            if let Err(e) = self.collect_fences() {
                self.back_off()?;
                return Err(e);
            }

            return Ok(());
        }
    }

    fn wait_for_buffer_free(reservation: &Reservation) -> Result<(), Error> {
        let mut fields = reservation.fields.lock()?;
        while fields.reserved {
            fields = reservation.event_queue.wait(fields)?;
        }
        Ok(())
    }

    /// Snapshot each entry's buffer's currently attached fences per the
    /// shared/exclusive collection rule, and enforce the shared-fence
    /// capacity bound.
    fn collect_fences(&self) -> Result<(), Error> {
        for entry in &self.entries {
            let reservation = entry.buffer.reservation();
            let fields = reservation.fields.lock()?;

            if entry.intent == Intent::Shared && fields.fence_shared.len() >= MAX_SHARED_FENCE {
                warn!("reserve: buffer already holds MAX_SHARED_FENCE shared fences");
                return Err(Error::InvalidArgument(
                    "buffer already holds MAX_SHARED_FENCE shared fences",
                ));
            }

            let collected = match entry.intent {
                Intent::Exclusive => fields
                    .fence_shared
                    .iter()
                    .cloned()
                    .chain(fields.fence_excl.clone())
                    .collect(),
                Intent::Shared => fields.fence_excl.clone().into_iter().collect(),
            };
            drop(fields);
            entry.set_collected(collected);
        }
        Ok(())
    }

    /// `back_off`: explicit cancellation between `reserve` and `commit`.
    /// Releases every entry this batch holds reserved and wakes the
    /// corresponding buffers' waiters. A no-op for entries that were never
    /// successfully reserved.
    pub fn back_off(&mut self) -> Result<(), Error> {
        let _guard = RESERVE_LOCK.lock()?;
        for entry in &self.entries {
            if entry.take_reserved() {
                let reservation = entry.buffer.reservation();
                let mut fields = reservation.fields.lock()?;
                fields.reserved = false;
                fields.ticket = None;
                drop(fields);
                reservation.event_queue.notify_all();
            }
            entry.clear_collected();
        }
        Ok(())
    }

    /// `wait`: sequentially wait on every entry's collected fences,
    /// sharing one remaining-time budget across all of them. Returns on
    /// the first failure, timeout, or interruption. `timeout == None`
    /// waits with no deadline; on success, returns the remaining budget
    /// (`None` if there was none to begin with).
    pub fn wait(
        &self,
        intr: Option<&Interrupt>,
        timeout: Option<Duration>,
    ) -> Result<Option<Duration>, Error> {
        let deadline = timeout.map(|t| Instant::now() + t);
        for entry in &self.entries {
            for fence in entry.collected_fences() {
                match deadline {
                    Some(d) => {
                        let remaining = d.saturating_duration_since(Instant::now());
                        fence.wait_timeout(intr, remaining)?;
                    }
                    None => fence.wait(intr)?,
                }
            }
        }
        Ok(deadline.map(|d| d.saturating_duration_since(Instant::now())))
    }

    /// `commit`: precondition is that `reserve` succeeded on this batch
    /// with no intervening `back_off`. For exclusive entries, drops the
    /// buffer's existing fences (the new fence replaces them); for every
    /// entry, attaches `new_fence` (appended for shared, installed for
    /// exclusive) and releases the buffer.
    pub fn commit(&mut self, new_fence: Fence) -> Result<(), Error> {
        debug_assert!(
            self.entries.iter().all(|e| e.is_reserved()),
            "commit called on a batch that did not successfully reserve"
        );

        {
            let _guard = RESERVE_LOCK.lock()?;
            for entry in &self.entries {
                let reservation = entry.buffer.reservation();
                let mut fields = reservation.fields.lock()?;
                if entry.intent == Intent::Exclusive {
                    fields.fence_shared.clear();
                    fields.fence_excl = None;
                }
                match entry.intent {
                    Intent::Shared => fields.fence_shared.push(new_fence.clone()),
                    Intent::Exclusive => fields.fence_excl = Some(new_fence.clone()),
                }
                fields.reserved = false;
                fields.ticket = None;
                drop(fields);
                reservation.event_queue.notify_all();
            }
        }

        for entry in &self.entries {
            entry.take_reserved();
            entry.clear_collected();
        }
        Ok(())
    }
}
