//! Consumer wake-up.
//!
//! Producers never block. When a batch overflows the active sub-buffer, or
//! when a committed slot lands on the periodic wake interval, the producer
//! checks whether anyone is parked and, only then, signals the
//! [`Notifier`]. Rare wakes keep the enqueue path cheap; frequent wakes
//! lower the latency the consumer sees.

use std::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Longest a waiter sleeps between cancellation checks.
const CANCEL_POLL: Duration = Duration::from_millis(5);

/// Something a blocked consumer waits on and producers can signal.
pub trait Notifier: Send + Sync {
    /// Cheap check run by producers before paying for a wake.
    fn has_waiters(&self) -> bool;

    fn wake(&self);
}

/// When a committed slot triggers a periodic wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakePolicy {
    mask: u32,
}

impl WakePolicy {
    /// `interval` is rounded up to a power of two.
    pub fn new(interval: u32) -> Self {
        Self {
            mask: interval.max(1).next_power_of_two() - 1,
        }
    }

    /// Wake after every committed slot.
    pub fn eager() -> Self {
        Self::new(1)
    }

    #[inline]
    pub fn interval(&self) -> u32 {
        self.mask + 1
    }

    /// Whether committing slot `offset` should wake the consumer.
    #[inline]
    pub fn is_due(&self, offset: u32) -> bool {
        offset & self.mask == 0
    }
}

/// Flag a blocked consumer checks to abandon its wait.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Why a wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The readiness check passed.
    Ready,
    /// A producer signalled.
    Woken,
    TimedOut,
    Cancelled,
}

/// In-process wait queue for a consumer thread.
#[derive(Debug, Default)]
pub struct WaitQueue {
    waiters: AtomicUsize,
    generation: Mutex<u64>,
    cond: Condvar,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park until `ready` holds, a producer wakes us, `timeout` elapses or
    /// `cancel` fires.
    ///
    /// The waiter registers before checking `ready`, so a producer that
    /// publishes after the check sees it and wakes it.
    pub fn wait_until(
        &self,
        timeout: Duration,
        cancel: Option<&CancelToken>,
        mut ready: impl FnMut() -> bool,
    ) -> WaitResult {
        let deadline = Instant::now() + timeout;

        // Registered under the lock, so a wake cannot slip in between the
        // count going up and `start` being read.
        let mut generation = self.generation.lock();
        let start = *generation;
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let result = loop {
            if ready() {
                break WaitResult::Ready;
            }
            if cancel.is_some_and(CancelToken::is_cancelled) {
                break WaitResult::Cancelled;
            }
            if *generation != start {
                break WaitResult::Woken;
            }
            let now = Instant::now();
            if now >= deadline {
                break WaitResult::TimedOut;
            }
            let slice = (deadline - now).min(CANCEL_POLL);
            self.cond.wait_for(&mut generation, slice);
        };
        drop(generation);

        self.waiters.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Number of parked consumers.
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }
}

impl Notifier for WaitQueue {
    fn has_waiters(&self) -> bool {
        // Orders the caller's commit store before the waiter count load.
        fence(Ordering::SeqCst);
        self.waiters.load(Ordering::SeqCst) != 0
    }

    fn wake(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }
}

/// Per-batch wake decisions for one queue.
pub struct WakeCoordinator<'a> {
    policy: WakePolicy,
    notifier: &'a dyn Notifier,
    wakes: &'a AtomicU64,
}

impl<'a> WakeCoordinator<'a> {
    pub fn new(policy: WakePolicy, notifier: &'a dyn Notifier, wakes: &'a AtomicU64) -> Self {
        Self {
            policy,
            notifier,
            wakes,
        }
    }

    #[inline]
    pub fn policy(&self) -> WakePolicy {
        self.policy
    }

    /// Slot `offset` was just committed.
    #[inline]
    pub fn on_commit(&self, offset: u32) {
        if self.policy.is_due(offset) {
            self.wake_if_waiting();
        }
    }

    /// The active sub-buffer filled up mid-batch.
    #[inline]
    pub fn on_overflow(&self) {
        self.wake_if_waiting();
    }

    fn wake_if_waiting(&self) {
        if self.notifier.has_waiters() {
            self.wakes.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("waking consumer");
            self.notifier.wake();
        }
    }
}
