//! Single-shot software fences.
//!
//! A [`Fence`] transitions exactly once from unsignaled to signaled. Its
//! signaling mechanism is pluggable through [`FenceOps`], which lets the
//! creator defer enabling a (potentially expensive) notification path until
//! some other party actually registers a wait or a callback. See
//! [`Fence::wait`] and [`Fence::add_callback`] for the two ways to observe
//! completion, and [`seqno`] for the hardware-sequence-number variant.

pub mod seqno;

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use downcast_rs::{impl_downcast, Downcast};

use crate::error::Error;
use crate::interrupt::Interrupt;

/// How often a wait loop rechecks an [`Interrupt`] handle while otherwise
/// parked on the fence's condition variable. Interruptibility is emulated
/// by polling rather than by a real signal-delivery mechanism (see
/// `SPEC_FULL.md` §5), so this bounds the latency between `trigger()` and
/// the waiter noticing it.
const INTERRUPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Variant-specific signaling behavior attached to a [`Fence`] at
/// construction.
///
/// Implementors back the "enable-signaling protocol" described in the
/// spec: [`enable_signaling`](FenceOps::enable_signaling) arranges for
/// `signal` to eventually be called on the fence (for example by spawning
/// a thread that polls hardware state, or by arming an interrupt), and is
/// invoked at most once per fence, with the fence's own lock dropped, to
/// avoid lock inversion against whatever the hook needs to acquire.
pub trait FenceOps: Downcast + Send + Sync + fmt::Debug {
    /// Arrange for the fence to eventually be signaled through a software
    /// path. Returns `false` if the fence is already effectively signaled
    /// (or enabling failed outright), in which case the core immediately
    /// transitions the fence to signaled itself. A hook that returns `true`
    /// is responsible for ensuring `signal` is eventually called on the
    /// fence it was given.
    fn enable_signaling(&self, fence: &Fence) -> bool;

    /// Invoked once, when the fence's last reference is dropped. Unlike
    /// `enable_signaling` this cannot observe the owning [`Fence`] — by
    /// the time it runs the refcount has already reached zero — so it
    /// exists only for variants with external, non-owned state to clean
    /// up. Most variants don't need it: anything the ops type itself owns
    /// (an `Arc`, a handle) is already dropped by ordinary Rust ownership.
    fn release(&self) {}
}
impl_downcast!(FenceOps);

/// Identifies a callback previously registered with
/// [`Fence::add_callback`], for later removal via
/// [`Fence::remove_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Outcome of [`Fence::add_callback`].
#[derive(Debug)]
pub enum AddCallbackOutcome {
    /// The callback was enqueued and will run (on whichever thread calls
    /// `signal`) when the fence transitions to signaled.
    Enqueued(CallbackId),
    /// The fence was already signaled; the callback was not enqueued and
    /// was not invoked. The caller may invoke its own logic synchronously
    /// if it still needs to.
    AlreadySignaled,
}

struct CallbackEntry {
    id: CallbackId,
    func: Option<Box<dyn FnOnce(&Fence) + Send>>,
}

#[derive(Derivative)]
#[derivative(Debug)]
struct FenceState {
    signaled: bool,
    need_sw_signal: bool,
    #[derivative(Debug = "ignore")]
    callbacks: Vec<CallbackEntry>,
    next_callback_id: u64,
}

impl FenceState {
    fn new() -> Self {
        FenceState {
            signaled: false,
            need_sw_signal: false,
            callbacks: Vec::new(),
            next_callback_id: 0,
        }
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
struct FenceInner {
    ops: Arc<dyn FenceOps>,
    #[derivative(Debug = "ignore")]
    payload: Box<dyn Any + Send + Sync>,
    state: Mutex<FenceState>,
    condvar: Condvar,
}

impl Drop for FenceInner {
    fn drop(&mut self) {
        debug_assert!(
            !self.state.get_mut().map(|s| s.signaled).unwrap_or(true)
                || self
                    .state
                    .get_mut()
                    .map(|s| s.callbacks.is_empty())
                    .unwrap_or(true),
            "fence was signaled but destroyed with callbacks still queued"
        );
        self.ops.release();
    }
}

/// A single-shot, reference-counted synchronization object.
///
/// Cloning a `Fence` is cheap (it bumps an `Arc` refcount) and is the
/// spec's `get` operation; letting the last clone drop is `put`. The fence
/// created by `signal`'s caller must be kept alive until that call; any
/// party that registers a callback or blocks in `wait`/`wait_timeout` must
/// hold its own clone for the duration.
#[derive(Clone, Debug)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

impl Fence {
    /// `init(ops, priv)`: create a new, unsignaled fence backed by the
    /// given variant operation table, with an opaque caller payload
    /// retrievable via [`Fence::payload`].
    pub fn new(ops: Arc<dyn FenceOps>, payload: Box<dyn Any + Send + Sync>) -> Self {
        Fence {
            inner: Arc::new(FenceInner {
                ops,
                payload,
                state: Mutex::new(FenceState::new()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Create a new unsignaled fence with no variant-specific signaling:
    /// it becomes signaled only when something calls [`Fence::signal`]
    /// directly.
    pub fn new_software() -> Self {
        Self::new(Arc::new(SoftwareFenceOps), Box::new(()))
    }

    /// `get`: take another reference to this fence. Equivalent to
    /// `Clone::clone`, exposed under the spec's name.
    pub fn get(&self) -> Fence {
        self.clone()
    }

    /// `put`: release a reference to this fence. Equivalent to dropping
    /// it, exposed under the spec's name.
    pub fn put(self) {
        drop(self)
    }

    /// Borrow this fence's opaque payload, if it was constructed as `T`.
    pub fn payload<T: 'static>(&self) -> Option<&T> {
        self.inner.payload.downcast_ref::<T>()
    }

    /// Borrow this fence's variant operation table, for downcasting to a
    /// concrete variant (e.g. [`seqno::SeqnoFenceOps`]).
    pub fn ops(&self) -> &Arc<dyn FenceOps> {
        &self.inner.ops
    }

    /// `is_signaled`: read the current state with acquire ordering
    /// (implemented here via the fence's mutex, which provides the same
    /// guarantee).
    pub fn is_signaled(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|s| s.signaled)
            .unwrap_or(true)
    }

    /// `signal`: idempotent transition to signaled. The first call wakes
    /// every blocked waiter and runs every registered callback; every
    /// subsequent call returns [`Error::AlreadySignaled`] without altering
    /// state.
    pub fn signal(&self) -> Result<(), Error> {
        let callbacks = {
            let mut state = self.inner.state.lock()?;
            if state.signaled {
                return Err(Error::AlreadySignaled);
            }
            state.signaled = true;
            std::mem::take(&mut state.callbacks)
        };
        self.inner.condvar.notify_all();
        for mut entry in callbacks {
            if let Some(func) = entry.func.take() {
                func(self);
            }
        }
        Ok(())
    }

    /// `enable_sw_signaling`: ensure the variant's `enable_signaling` hook
    /// has run at most once. Implements the protocol from §4.1: set
    /// `NEED_SW_SIGNAL` under the fence lock, drop the lock before calling
    /// into the hook (to avoid lock inversion against anything the hook
    /// acquires), then re-acquire it and signal immediately if the hook
    /// reports there is nothing left to wait for.
    pub fn enable_sw_signaling(&self) -> Result<(), Error> {
        let should_call_hook = {
            let mut state = self.inner.state.lock()?;
            if state.signaled || state.need_sw_signal {
                false
            } else {
                state.need_sw_signal = true;
                true
            }
        };
        if !should_call_hook {
            return Ok(());
        }
        let enabled = self.inner.ops.enable_signaling(self);
        if !enabled {
            match self.signal() {
                Ok(()) | Err(Error::AlreadySignaled) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// `add_callback`: atomically enqueue `func` to run when this fence
    /// signals, ensuring signaling is enabled first. If the fence is
    /// already signaled, returns [`AddCallbackOutcome::AlreadySignaled`]
    /// without invoking `func` — the caller may invoke it synchronously if
    /// it still wants to.
    pub fn add_callback(
        &self,
        func: impl FnOnce(&Fence) + Send + 'static,
    ) -> AddCallbackOutcome {
        if self.is_signaled() {
            return AddCallbackOutcome::AlreadySignaled;
        }
        // Dropped before this call per the enable-signaling protocol; may
        // itself call back into `signal` on another thread.
        let _ = self.enable_sw_signaling();

        let mut state = match self.inner.state.lock() {
            Ok(s) => s,
            Err(_) => return AddCallbackOutcome::AlreadySignaled,
        };
        if state.signaled {
            return AddCallbackOutcome::AlreadySignaled;
        }
        let id = CallbackId(state.next_callback_id);
        state.next_callback_id += 1;
        state.callbacks.push(CallbackEntry {
            id,
            func: Some(Box::new(func)),
        });
        AddCallbackOutcome::Enqueued(id)
    }

    /// `remove_callback`: cancel a previously registered callback. Returns
    /// `true` iff it was still queued (the fence had not yet signaled); in
    /// that case the callback is guaranteed not to fire. Returns `false`
    /// if the fence already signaled — the callback may already be
    /// running or have finished, and this does not wait for it.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        let mut state = match self.inner.state.lock() {
            Ok(s) => s,
            Err(_) => return false,
        };
        if let Some(pos) = state.callbacks.iter().position(|c| c.id == id) {
            state.callbacks.remove(pos);
            true
        } else {
            false
        }
    }

    /// `wait`: block until signaled, or until `intr` (if given) is
    /// triggered.
    pub fn wait(&self, intr: Option<&Interrupt>) -> Result<(), Error> {
        self.enable_sw_signaling()?;
        let mut state = self.inner.state.lock()?;
        while !state.signaled {
            if let Some(intr) = intr {
                if intr.is_triggered() {
                    return Err(Error::Interrupted);
                }
                let (guard, _timeout) = self
                    .inner
                    .condvar
                    .wait_timeout(state, INTERRUPT_POLL_INTERVAL)?;
                state = guard;
            } else {
                state = self.inner.condvar.wait(state)?;
            }
        }
        Ok(())
    }

    /// `wait_timeout`: block up to `timeout`. Returns the remaining budget
    /// on success, [`Error::Timeout`] if the budget is exhausted first, or
    /// [`Error::Interrupted`] if `intr` is triggered first — in which case
    /// the caller can tell cancellation from expiry by construction (the
    /// two are distinct error variants, rather than both collapsing to a
    /// zero remaining duration).
    pub fn wait_timeout(
        &self,
        intr: Option<&Interrupt>,
        timeout: Duration,
    ) -> Result<Duration, Error> {
        self.enable_sw_signaling()?;
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock()?;
        loop {
            if state.signaled {
                return Ok(deadline.saturating_duration_since(Instant::now()));
            }
            if let Some(intr) = intr {
                if intr.is_triggered() {
                    return Err(Error::Interrupted);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let slice = match intr {
                Some(_) => INTERRUPT_POLL_INTERVAL.min(deadline - now),
                None => deadline - now,
            };
            let (guard, _timeout) = self.inner.condvar.wait_timeout(state, slice)?;
            state = guard;
        }
    }
}

/// The signaling behavior of a fence with no hardware or external
/// backing: it becomes signaled only when something calls
/// [`Fence::signal`] on it directly. This is what [`Fence::new_software`]
/// installs.
#[derive(Debug, Default)]
struct SoftwareFenceOps;

impl FenceOps for SoftwareFenceOps {
    fn enable_signaling(&self, _fence: &Fence) -> bool {
        // Nothing to arm: the only path to completion is an explicit
        // `signal`, which some other party already holds a reference in
        // order to call. Returning `true` tells the core that path is
        // live rather than that the fence is already done.
        true
    }
}

static_assertions::assert_impl_all!(Fence: Send, Sync, Clone);

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    fn init_logger() {
        let _ = pretty_env_logger::try_init();
    }

    /// S1: simple signal-then-wait.
    #[test]
    fn signal_then_wait() {
        init_logger();
        let fence = Fence::new_software();
        let waiter = fence.clone();
        let handle = thread::spawn(move || waiter.wait(None));
        thread::sleep(Duration::from_millis(10));
        fence.signal().unwrap();
        handle.join().unwrap().unwrap();
        assert!(matches!(fence.signal(), Err(Error::AlreadySignaled)));
    }

    #[test]
    fn double_signal_is_an_error_and_does_not_panic() {
        let fence = Fence::new_software();
        fence.signal().unwrap();
        assert!(matches!(fence.signal(), Err(Error::AlreadySignaled)));
        assert!(fence.is_signaled());
    }

    /// S2: callback fires exactly once; a callback added afterwards finds
    /// the fence already signaled.
    #[test]
    fn callbacks_fire_exactly_once() {
        let fence = Fence::new_software();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            match fence.add_callback(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            }) {
                AddCallbackOutcome::Enqueued(_) => {}
                AddCallbackOutcome::AlreadySignaled => panic!("should not be signaled yet"),
            }
        }

        fence.signal().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        match fence.add_callback(|_| panic!("must not run")) {
            AddCallbackOutcome::AlreadySignaled => {}
            AddCallbackOutcome::Enqueued(_) => panic!("fence is already signaled"),
        }
    }

    #[test]
    fn remove_callback_before_signal_prevents_it_firing() {
        let fence = Fence::new_software();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let id = match fence.add_callback(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }) {
            AddCallbackOutcome::Enqueued(id) => id,
            AddCallbackOutcome::AlreadySignaled => unreachable!(),
        };
        assert!(fence.remove_callback(id));
        fence.signal().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn remove_callback_after_signal_returns_false() {
        let fence = Fence::new_software();
        let id = match fence.add_callback(|_| {}) {
            AddCallbackOutcome::Enqueued(id) => id,
            AddCallbackOutcome::AlreadySignaled => unreachable!(),
        };
        fence.signal().unwrap();
        assert!(!fence.remove_callback(id));
    }

    #[test]
    fn wait_timeout_returns_timeout_error_when_never_signaled() {
        let fence = Fence::new_software();
        let err = fence
            .wait_timeout(None, Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    /// S6: an interrupted timed wait reports `Interrupted`, and the caller
    /// can tell it apart from expiry.
    #[test]
    fn wait_timeout_interrupted_is_distinct_from_timeout() {
        let fence = Fence::new_software();
        let intr = Interrupt::new();
        let intr_clone = intr.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            intr_clone.trigger();
        });
        let err = fence
            .wait_timeout(Some(&intr), Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, Error::Interrupted));
    }

    #[test]
    fn enable_signaling_hook_runs_at_most_once() {
        #[derive(Debug)]
        struct CountingOps(Arc<AtomicUsize>);
        impl FenceOps for CountingOps {
            fn enable_signaling(&self, _fence: &Fence) -> bool {
                self.0.fetch_add(1, Ordering::SeqCst);
                true
            }
        }
        let calls = Arc::new(AtomicUsize::new(0));
        let fence = Fence::new(Arc::new(CountingOps(Arc::clone(&calls))), Box::new(()));
        fence.enable_sw_signaling().unwrap();
        fence.enable_sw_signaling().unwrap();
        let _ = fence.add_callback(|_| {});
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hook_returning_false_signals_immediately() {
        #[derive(Debug)]
        struct AlreadyDoneOps;
        impl FenceOps for AlreadyDoneOps {
            fn enable_signaling(&self, _fence: &Fence) -> bool {
                false
            }
        }
        let fence = Fence::new(Arc::new(AlreadyDoneOps), Box::new(()));
        assert!(!fence.is_signaled());
        fence.enable_sw_signaling().unwrap();
        assert!(fence.is_signaled());
    }

    #[test]
    fn payload_round_trips() {
        let fence = Fence::new(Arc::new(SoftwareFenceOps), Box::new(42u32));
        assert_eq!(fence.payload::<u32>(), Some(&42));
        assert_eq!(fence.payload::<u64>(), None);
    }
}
