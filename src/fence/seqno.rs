//! Hardware-sequence-number fence variant.
//!
//! A sequence-number fence's completion condition is the monotonic advance
//! of a value in a shared memory cell past a target: equivalent to
//! `signed32(buffer[offset] - target_seqno) >= 0`. This lets two execution
//! engines observe the same counter without CPU involvement; software
//! signaling (polling the cell from a background thread and calling
//! [`Fence::signal`]) is the fallback this crate provides for callers that
//! register a blocking wait or a callback instead of watching the memory
//! themselves.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::fence::{Fence, FenceOps};

/// The shared per-object state block a sequence-number fence reads.
///
/// Implemented by whatever owns the backing memory — a mapped GPU buffer,
/// a shared-memory ring, or (for tests) a plain atomic cell.
pub trait SeqnoMemory: Send + Sync + fmt::Debug {
    /// Read the current value of the monotonic counter at `offset`.
    fn load(&self, offset: usize) -> i32;
}

/// `signed32(current - target) >= 0`, tolerant of wraparound per the
/// spec's signed-arithmetic requirement.
fn seqno_reached(current: i32, target: i32) -> bool {
    current.wrapping_sub(target) >= 0
}

/// [`FenceOps`] implementation backing a sequence-number fence.
#[derive(Debug)]
pub struct SeqnoFenceOps {
    memory: Arc<dyn SeqnoMemory>,
    offset: usize,
    target: i32,
    poll_interval: Duration,
}

impl SeqnoFenceOps {
    /// The memory cell this fence's completion condition reads.
    pub fn memory(&self) -> &Arc<dyn SeqnoMemory> {
        &self.memory
    }

    /// The byte (or element) offset within [`SeqnoFenceOps::memory`] the
    /// counter lives at.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The target value this fence waits for the counter to reach or pass.
    pub fn target(&self) -> i32 {
        self.target
    }

    fn is_reached(&self) -> bool {
        seqno_reached(self.memory.load(self.offset), self.target)
    }
}

impl FenceOps for SeqnoFenceOps {
    fn enable_signaling(&self, fence: &Fence) -> bool {
        if self.is_reached() {
            // Already past target: tell the core to signal immediately
            // rather than spawning a poller for nothing.
            return false;
        }
        let fence = fence.clone();
        let memory = Arc::clone(&self.memory);
        let offset = self.offset;
        let target = self.target;
        let poll_interval = self.poll_interval;
        std::thread::spawn(move || loop {
            if seqno_reached(memory.load(offset), target) {
                // Another party may have signaled this fence directly
                // (e.g. hardware-to-hardware waiting bypassing this
                // poller entirely); ignore `AlreadySignaled`.
                let _ = fence.signal();
                return;
            }
            std::thread::sleep(poll_interval);
        });
        true
    }
}

/// A [`Fence`] whose completion condition is a sequence-number crossing,
/// per [`SeqnoFenceOps`]. This is a plain type alias rather than a
/// distinct struct: a sequence-number fence is a `Fence` like any other,
/// distinguished only by the ops table installed at construction (see
/// `Fence::ops` to downcast back to [`SeqnoFenceOps`]).
pub type SeqnoFence = Fence;

/// Builder for a [`SeqnoFence`], mirroring the teacher crate's builder
/// pattern for constructing objects with a handful of optional knobs.
#[derive(Debug)]
pub struct SeqnoFenceBuilder {
    memory: Arc<dyn SeqnoMemory>,
    offset: usize,
    target: i32,
    poll_interval: Duration,
}

impl SeqnoFenceBuilder {
    /// Start building a sequence-number fence waiting for `memory[offset]`
    /// to reach `target`.
    pub fn new(memory: Arc<dyn SeqnoMemory>, offset: usize, target: i32) -> Self {
        SeqnoFenceBuilder {
            memory,
            offset,
            target,
            poll_interval: Duration::from_millis(1),
        }
    }

    /// Override how often the software fallback polls the memory cell.
    /// Defaults to one millisecond.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Construct the fence. It starts unsignaled; software polling only
    /// begins once a waiter or callback calls
    /// [`Fence::enable_sw_signaling`] (directly, or via `wait`/
    /// `add_callback`).
    pub fn build(self) -> SeqnoFence {
        let ops = SeqnoFenceOps {
            memory: self.memory,
            offset: self.offset,
            target: self.target,
            poll_interval: self.poll_interval,
        };
        Fence::new(Arc::new(ops), Box::new(()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::thread;

    use super::*;

    #[derive(Debug)]
    struct TestMemory(AtomicI32);

    impl SeqnoMemory for TestMemory {
        fn load(&self, _offset: usize) -> i32 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn seqno_reached_tolerates_wraparound() {
        assert!(seqno_reached(5, 5));
        assert!(seqno_reached(6, 5));
        assert!(!seqno_reached(4, 5));
        // target wrapped around past i32::MAX; current has also wrapped
        // and is "ahead" of it in wrapping-subtraction terms.
        assert!(seqno_reached(i32::MIN, i32::MAX));
    }

    #[test]
    fn fence_signals_when_already_reached() {
        let memory: Arc<dyn SeqnoMemory> = Arc::new(TestMemory(AtomicI32::new(10)));
        let fence = SeqnoFenceBuilder::new(memory, 0, 5).build();
        fence.wait(None).unwrap();
        assert!(fence.is_signaled());
    }

    #[test]
    fn fence_signals_once_counter_advances() {
        let memory = Arc::new(TestMemory(AtomicI32::new(0)));
        let fence = SeqnoFenceBuilder::new(
            Arc::clone(&memory) as Arc<dyn SeqnoMemory>,
            0,
            3,
        )
        .poll_interval(Duration::from_millis(2))
        .build();

        let waiter = fence.clone();
        let handle = thread::spawn(move || waiter.wait(None));

        thread::sleep(Duration::from_millis(10));
        assert!(!fence.is_signaled());
        memory.0.store(3, Ordering::SeqCst);

        handle.join().unwrap().unwrap();
        assert!(fence.is_signaled());
    }

    #[test]
    fn downcasts_back_to_seqno_ops() {
        let memory: Arc<dyn SeqnoMemory> = Arc::new(TestMemory(AtomicI32::new(0)));
        let fence = SeqnoFenceBuilder::new(memory, 4, 7).build();
        let ops = fence.ops().clone();
        let seqno_ops = ops.downcast_ref::<SeqnoFenceOps>().unwrap();
        assert_eq!(seqno_ops.offset(), 4);
        assert_eq!(seqno_ops.target(), 7);
    }
}
