//! # Condition Variable
//!
//! A generation-counter condition variable paired with one [`Mutex`].
//!
//! ## Wait / Signal
//!
//! ```text
//!   waiter (holds M)                       signaller
//!   ────────────────                       ─────────
//!   waiters += 1
//!   g = generation
//!   M.unlock() ───────────────────────────> M.lock()
//!   wait(&generation, g)                   generation += 1
//!        │                                 holds M?  requeue generation ──> M word
//!        │                                           M.requeued += moved
//!        │                                 else      wake generation
//!        │                                 M.unlock() ── wake(M word, 1)
//!        └─ woken ─> M.lock(), waiters -= 1
//! ```
//!
//! Requeueing onto the mutex word avoids the thundering herd where every
//! woken waiter immediately blocks again on the mutex the signaller still
//! holds. The signaller records how many threads it moved, so the mutex's
//! unlock issues the wake that releases them. A waiter still asleep on the
//! generation word leaves the mutex word alone: unlocks meanwhile stay
//! free of wake calls.
//!
//! ## Binding
//!
//! The first `wait` binds the condition variable to its mutex for good. Any
//! later wait with a different mutex is a protocol violation, which is
//! stricter than POSIX. The borrow of the bound mutex lives as long as the
//! condition variable, so the mutex cannot go away underneath a signal.
//!
//! That borrow is also the cost: a condition variable cannot live in the
//! same struct as the mutex it binds. Keep the mutex in a `static`, an
//! `Arc`, or an enclosing scope that outlives the condition variable.

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use keystone_core::{
    Deadline, NativePlatform, Platform, ProtocolViolation, TerminationPolicy, WaitOutcome, WaitQueue,
};

use crate::mutex::Mutex;

/// Condition variable bound on first use to one [`Mutex`].
///
/// The binding borrows the mutex for `'m`, so the pair cannot be fields of
/// one struct. Place the mutex where it outlives the condition variable:
///
/// ```rust,ignore
/// static QUEUE_LOCK: Mutex = Mutex::new();
/// static QUEUE_READY: ConditionVariable<'static> = ConditionVariable::new();
///
/// // Or, scoped:
/// let lock = Mutex::new();
/// let ready = ConditionVariable::new();
/// thread::scope(|s| { /* both borrowed by the workers */ });
/// ```
pub struct ConditionVariable<'m, P: Platform = NativePlatform> {
    bound_mutex: OnceLock<&'m Mutex<P>>,
    /// Bumped by every signal; waiters sleep keyed to a snapshot of it.
    generation: AtomicU32,
    /// Threads between registering and leaving `wait`.
    waiters: AtomicU32,
    platform: P,
}

impl ConditionVariable<'_, NativePlatform> {
    /// Creates an unbound condition variable on the process runtime.
    #[must_use]
    pub const fn new() -> Self {
        Self::build(NativePlatform)
    }
}

impl Default for ConditionVariable<'_, NativePlatform> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'m, P: Platform> ConditionVariable<'m, P> {
    /// Creates an unbound condition variable on `platform`.
    ///
    /// All queue traffic goes through the bound mutex's platform, so a
    /// requeue always lands in the queue the mutex sleeps on.
    #[must_use]
    pub fn with_platform(platform: P) -> Self {
        Self::build(platform)
    }

    const fn build(platform: P) -> Self {
        Self {
            bound_mutex: OnceLock::new(),
            generation: AtomicU32::new(0),
            waiters: AtomicU32::new(0),
            platform,
        }
    }

    /// Releases `mutex`, sleeps until signalled, then re-acquires it.
    ///
    /// May return spuriously; callers re-check their predicate in a loop.
    pub fn wait(&self, mutex: &'m Mutex<P>) {
        let _ = self.wait_internal(mutex, None);
    }

    /// Like [`ConditionVariable::wait`], but gives up at `deadline`.
    /// Returns `true` if the wait timed out.
    ///
    /// The mutex is held again on return either way.
    #[must_use]
    pub fn timed_wait(&self, mutex: &'m Mutex<P>, deadline: Deadline) -> bool {
        self.wait_internal(mutex, Some(deadline))
    }

    fn wait_internal(&self, mutex: &'m Mutex<P>, deadline: Option<Deadline>) -> bool {
        let caller = self.platform.current_thread();
        if !mutex.is_held_by(caller) {
            self.platform
                .termination()
                .report(ProtocolViolation::WaitWithoutMutex { caller });
            return false;
        }
        if !self.bind(mutex) {
            return false;
        }

        self.waiters.fetch_add(1, Ordering::Relaxed);
        let depth = mutex.recursive_count();
        mutex.set_recursive_count(1);
        let generation = self.generation.load(Ordering::Acquire);
        mutex.unlock();

        let outcome = mutex
            .platform()
            .wait_queue()
            .wait(&self.generation, generation, deadline);

        mutex.lock();
        mutex.set_recursive_count(depth);
        self.waiters.fetch_sub(1, Ordering::Relaxed);
        outcome == WaitOutcome::TimedOut
    }

    fn bind(&self, mutex: &'m Mutex<P>) -> bool {
        let bound = *self.bound_mutex.get_or_init(|| mutex);
        if ptr::eq(bound, mutex) {
            return true;
        }
        self.platform.termination().report(ProtocolViolation::CondvarRebound {
            bound: bound as *const Mutex<P> as usize,
            other: mutex as *const Mutex<P> as usize,
        });
        false
    }

    /// Wakes one waiter.
    pub fn signal(&self) {
        self.notify(1);
    }

    /// Wakes every waiter.
    pub fn broadcast(&self) {
        self.notify(u32::MAX);
    }

    fn notify(&self, count: u32) {
        if self.waiters.load(Ordering::Relaxed) == 0 {
            return;
        }
        // Waiters exist only after a bind.
        let Some(mutex) = self.bound_mutex.get().copied() else {
            return;
        };
        self.generation.fetch_add(1, Ordering::Release);

        let queue = mutex.platform().wait_queue();
        if mutex.is_held() {
            let moved = queue.requeue(&self.generation, count, mutex.state_word());
            mutex.record_requeued(moved);
            tracing::trace!(moved, "condition variable requeued waiters onto mutex");
        } else {
            queue.wake(&self.generation, count);
        }
    }

    /// Threads currently inside a wait. Diagnostic only.
    #[inline]
    #[must_use]
    pub fn waiter_count(&self) -> u32 {
        self.waiters.load(Ordering::Relaxed)
    }

    /// Number of signals and broadcasts that found waiters.
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Relaxed)
    }

    /// The mutex bound by the first wait, if any.
    #[must_use]
    pub fn bound_mutex(&self) -> Option<&'m Mutex<P>> {
        self.bound_mutex.get().copied()
    }

    /// Tears the condition variable down, checking no thread waits on it.
    pub fn destroy(self, policy: &TerminationPolicy) {
        self.check_idle(policy);
        self.waiters.store(0, Ordering::Relaxed);
    }

    fn check_idle(&self, policy: &TerminationPolicy) {
        let waiters = self.waiters.load(Ordering::Relaxed);
        if waiters != 0 {
            policy.report(ProtocolViolation::CondvarDestroyedWithWaiters { waiters });
        }
    }
}

impl<P: Platform> Drop for ConditionVariable<'_, P> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        self.check_idle(self.platform.termination());
    }
}

impl<P: Platform> fmt::Debug for ConditionVariable<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionVariable")
            .field("bound", &self.bound_mutex.get().is_some())
            .field("generation", &self.generation())
            .field("waiters", &self.waiter_count())
            .finish()
    }
}
