//! # Mutex
//!
//! A futex-style mutex whose entire arbitration state is one 32-bit word.
//!
//! ## Lock Word
//!
//! ```text
//!  31                                   1   0
//! ┌──────────────────────────────────────┬───┐
//! │        waiter count (× 2)            │ H │
//! └──────────────────────────────────────┴───┘
//!   H = held bit. Waiters are counted in steps of WAITER_INCREMENT so that
//!   adding or removing a waiter can never flip H.
//! ```
//!
//! ## States
//!
//! ```text
//!   Unlocked ──CAS H=1──> Locked(no waiters) ──contender──> Locked(n waiters)
//!      ^                          │                                │
//!      └────── unlock ────────────┘<──── unlock + wake(1) ─────────┘
//! ```
//!
//! Mutual exclusion rests on the CAS of the held bit alone. The waiter count
//! only decides whether an unlock pays for a wake call.
//!
//! Threads a [`ConditionVariable`](crate::ConditionVariable) requeues onto
//! the word never pass through [`Mutex::lock`]'s registration, so they are
//! tracked beside it in a tagged count (epoch high, threads low). An unlock
//! wakes while that count is non-zero, and clears it once a wake finds the
//! word empty and no requeue happened in between.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use keystone_core::{NativePlatform, Platform, ProtocolViolation, TerminationPolicy, ThreadId, WaitQueue};

/// Held bit of the lock word.
pub(crate) const HELD_MASK: u32 = 1;
/// Waiter count starts above the held bit.
pub(crate) const WAITER_SHIFT: u32 = 1;
/// One waiter, pre-shifted.
pub(crate) const WAITER_INCREMENT: u32 = 1 << WAITER_SHIFT;

/// Low half of the requeue tally: threads believed parked on the word.
const REQUEUED_COUNT_MASK: u64 = 0xFFFF_FFFF;
/// Bumped with every requeue so a stale snapshot never clears fresh ones.
const REQUEUED_EPOCH: u64 = 1 << 32;

/// Mutual-exclusion lock, optionally recursive.
///
/// Unlike `std::sync::Mutex` this guards no data of its own: it is a raw
/// lock embedded in runtime structures whose fields it is documented to
/// protect. Use [`Mutex::guard`] for scoped locking.
///
/// # Example
///
/// ```rust,ignore
/// static LOCK: Mutex = Mutex::new();
///
/// LOCK.lock();
/// // ... critical section ...
/// LOCK.unlock();
/// ```
pub struct Mutex<P: Platform = NativePlatform> {
    /// Held bit + pre-shifted waiter count.
    state_and_waiters: AtomicU32,
    /// Raw id of the owning thread, 0 when unowned.
    exclusive_owner: AtomicU32,
    /// Hold depth. Written only by the owner, so relaxed is enough.
    recursive_count: AtomicU32,
    /// Threads moved here by a condition variable, tagged with an epoch.
    requeued: AtomicU64,
    /// Fixed at construction.
    recursive: bool,
    platform: P,
}

impl Mutex<NativePlatform> {
    /// Creates an unlocked, non-recursive mutex on the process runtime.
    #[must_use]
    pub const fn new() -> Self {
        Self::build(NativePlatform, false)
    }
}

impl Default for Mutex<NativePlatform> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Platform> Mutex<P> {
    /// Creates an unlocked, non-recursive mutex on `platform`.
    #[must_use]
    pub fn with_platform(platform: P) -> Self {
        Self::build(platform, false)
    }

    pub(crate) const fn build(platform: P, recursive: bool) -> Self {
        Self {
            state_and_waiters: AtomicU32::new(0),
            exclusive_owner: AtomicU32::new(0),
            recursive_count: AtomicU32::new(0),
            requeued: AtomicU64::new(0),
            recursive,
            platform,
        }
    }

    fn kind(&self) -> &'static str {
        if self.recursive {
            "recursive mutex"
        } else {
            "mutex"
        }
    }

    /// Acquires the lock, blocking as long as necessary.
    ///
    /// Re-locking a non-recursive mutex from its owner is a protocol
    /// violation; if the violation is downgraded this returns without the
    /// lock being acquired a second time.
    #[inline]
    pub fn lock(&self) {
        let _ = self.lock_with(false);
    }

    /// Attempts the lock without blocking. Never spins.
    #[inline]
    #[must_use]
    pub fn try_lock(&self) -> bool {
        self.lock_with(true)
    }

    /// Acquires the lock. With `try_lock`, gives up as soon as it is found
    /// held and returns `false`; otherwise blocks and returns `true`.
    pub fn lock_with(&self, try_lock: bool) -> bool {
        let current = self.platform.current_thread();
        if self.exclusive_owner.load(Ordering::Relaxed) == current.as_raw() {
            if self.recursive {
                let depth = self.recursive_count.load(Ordering::Relaxed);
                self.recursive_count.store(depth + 1, Ordering::Relaxed);
                return true;
            }
            if !try_lock {
                self.platform.termination().report(ProtocolViolation::Reentrant {
                    lock: self.kind(),
                    owner: current,
                });
            }
            return false;
        }

        loop {
            let state = self.state_and_waiters.load(Ordering::Relaxed);
            if state & HELD_MASK == 0 {
                if self
                    .state_and_waiters
                    .compare_exchange_weak(state, state | HELD_MASK, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    self.exclusive_owner.store(current.as_raw(), Ordering::Relaxed);
                    self.recursive_count.store(1, Ordering::Relaxed);
                    return true;
                }
                continue;
            }
            if try_lock {
                return false;
            }

            let released = self
                .platform
                .adaptive_wait()
                .spin_until(|| self.state_and_waiters.load(Ordering::Relaxed) & HELD_MASK == 0);
            if released {
                continue;
            }

            let observed = self
                .state_and_waiters
                .fetch_add(WAITER_INCREMENT, Ordering::Relaxed)
                .wrapping_add(WAITER_INCREMENT);
            // Released between the spin and registering: retry without sleeping.
            if observed & HELD_MASK != 0 {
                tracing::trace!(waiters = observed >> WAITER_SHIFT, "mutex contended, blocking");
                let _ = self
                    .platform
                    .wait_queue()
                    .wait(&self.state_and_waiters, observed, None);
            }
            self.state_and_waiters.fetch_sub(WAITER_INCREMENT, Ordering::Relaxed);
        }
    }

    /// Tries the lock, then keeps retrying for one bounded spin window.
    /// Never blocks in the wait queue.
    #[must_use]
    pub fn try_lock_with_spinning(&self) -> bool {
        if self.try_lock() {
            return true;
        }
        self.platform.adaptive_wait().spin_until(|| self.try_lock())
    }

    /// Releases one hold. The lock is freed when the last hold goes.
    pub fn unlock(&self) {
        let current = self.platform.current_thread();
        let owner = self.owner();
        if owner != current {
            self.platform.termination().report(ProtocolViolation::UnlockNotOwner {
                lock: self.kind(),
                owner,
                caller: current,
            });
            return;
        }

        let depth = self.recursive_count.load(Ordering::Relaxed).saturating_sub(1);
        if self.recursive && depth > 0 {
            self.recursive_count.store(depth, Ordering::Relaxed);
            return;
        }
        self.recursive_count.store(0, Ordering::Relaxed);
        self.release();
    }

    /// Clears the owner, then the held bit, then wakes one waiter if any.
    fn release(&self) {
        // Owner first: nobody may see the lock free with a stale owner.
        self.exclusive_owner.store(0, Ordering::Relaxed);
        let mut state = self.state_and_waiters.load(Ordering::Relaxed);
        loop {
            match self.state_and_waiters.compare_exchange_weak(
                state,
                state & !HELD_MASK,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => state = actual,
            }
        }
        self.wake_after_release(state);
    }

    /// Wakes one thread parked on the word, if any may be.
    fn wake_after_release(&self, state: u32) {
        let requeued = self.requeued.load(Ordering::SeqCst);
        if state >> WAITER_SHIFT == 0 && requeued & REQUEUED_COUNT_MASK == 0 {
            return;
        }
        let woken = self.platform.wait_queue().wake(&self.state_and_waiters, 1);
        if woken == 0 && requeued & REQUEUED_COUNT_MASK != 0 {
            // Everyone counted in the snapshot has left the word. A requeue
            // since then changed the epoch and keeps its count.
            let _ = self.requeued.compare_exchange(
                requeued,
                requeued & !REQUEUED_COUNT_MASK,
                Ordering::SeqCst,
                Ordering::Relaxed,
            );
        }
    }

    /// Marks the lock held by `thread` without arbitration.
    ///
    /// Only for handing a freshly created, uncontended lock to a designated
    /// owner (monitor bootstrap). A busy lock is a protocol violation.
    pub fn lock_for_other(&self, thread: ThreadId) {
        let state = self.state_and_waiters.load(Ordering::Relaxed);
        if state != 0 || !self.owner().is_none() {
            self.platform.termination().report(ProtocolViolation::HandoffContended {
                lock: self.kind(),
                target: thread,
                state,
            });
            return;
        }
        self.state_and_waiters.store(HELD_MASK, Ordering::Relaxed);
        self.recursive_count.store(1, Ordering::Relaxed);
        self.exclusive_owner.store(thread.as_raw(), Ordering::Relaxed);
    }

    /// Releases every hold of `thread` without arbitration. Counterpart of
    /// [`Mutex::lock_for_other`].
    pub fn unlock_for_other(&self, thread: ThreadId) {
        if !self.is_held_by(thread) {
            self.platform.termination().report(ProtocolViolation::UnlockNotOwner {
                lock: self.kind(),
                owner: self.owner(),
                caller: thread,
            });
            return;
        }
        self.recursive_count.store(0, Ordering::Relaxed);
        self.exclusive_owner.store(0, Ordering::Relaxed);
        let state = self.state_and_waiters.fetch_and(!HELD_MASK, Ordering::Release);
        self.wake_after_release(state);
    }

    /// Whether `thread` is the recorded owner.
    #[inline]
    #[must_use]
    pub fn is_held_by(&self, thread: ThreadId) -> bool {
        !thread.is_none() && self.exclusive_owner.load(Ordering::Relaxed) == thread.as_raw()
    }

    /// Whether the calling thread owns the lock.
    #[inline]
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.is_held_by(self.platform.current_thread())
    }

    /// Recorded owner, [`ThreadId::NONE`] when free.
    #[inline]
    #[must_use]
    pub fn owner(&self) -> ThreadId {
        ThreadId::from_raw(self.exclusive_owner.load(Ordering::Relaxed))
    }

    /// Threads registered as waiting in [`Mutex::lock`]. Diagnostic only,
    /// racy by nature.
    #[inline]
    #[must_use]
    pub fn waiter_count(&self) -> u32 {
        self.state_and_waiters.load(Ordering::Relaxed) >> WAITER_SHIFT
    }

    /// Current hold depth (0 when free).
    #[inline]
    #[must_use]
    pub fn recursive_count(&self) -> u32 {
        self.recursive_count.load(Ordering::Relaxed)
    }

    /// Whether this mutex accepts re-locking by its owner.
    #[inline]
    #[must_use]
    pub fn is_recursive(&self) -> bool {
        self.recursive
    }

    /// Locks and returns a guard that unlocks on drop.
    #[must_use = "dropping the guard unlocks immediately"]
    pub fn guard(&self) -> MutexGuard<'_, P> {
        self.lock();
        MutexGuard { mutex: self }
    }

    /// Like [`Mutex::guard`], but returns `None` instead of blocking.
    #[must_use]
    pub fn try_guard(&self) -> Option<MutexGuard<'_, P>> {
        self.try_lock().then(|| MutexGuard { mutex: self })
    }

    /// Tears the mutex down, checking it is idle under `policy`.
    ///
    /// A held or waited-on mutex is a protocol violation unless `policy`
    /// has been suppressed (forced shutdown), in which case it is logged.
    pub fn destroy(self, policy: &TerminationPolicy) {
        self.check_idle(policy);
        // Already judged; keep Drop from judging again.
        self.state_and_waiters.store(0, Ordering::Relaxed);
        self.exclusive_owner.store(0, Ordering::Relaxed);
        self.requeued.store(0, Ordering::Relaxed);
    }

    fn check_idle(&self, policy: &TerminationPolicy) {
        let state = self.state_and_waiters.load(Ordering::Relaxed);
        let owner = self.owner();
        if state != 0 || !owner.is_none() {
            policy.report(ProtocolViolation::DestroyedWhileBusy {
                lock: self.kind(),
                state,
                owner,
            });
        }
    }

    pub(crate) fn platform(&self) -> &P {
        &self.platform
    }

    pub(crate) fn state_word(&self) -> &AtomicU32 {
        &self.state_and_waiters
    }

    /// Counts `moved` threads a condition variable parked on this word.
    /// Called by the holder, before its unlock.
    pub(crate) fn record_requeued(&self, moved: usize) {
        if moved == 0 {
            return;
        }
        let moved = u64::try_from(moved).unwrap_or(REQUEUED_COUNT_MASK).min(REQUEUED_COUNT_MASK);
        self.requeued.fetch_add(REQUEUED_EPOCH + moved, Ordering::SeqCst);
    }

    /// Threads believed parked on the word by a requeue. May lag behind
    /// until an unlock finds the word empty.
    #[must_use]
    pub(crate) fn requeued_count(&self) -> u32 {
        u32::try_from(self.requeued.load(Ordering::Relaxed) & REQUEUED_COUNT_MASK).unwrap_or(u32::MAX)
    }

    pub(crate) fn set_recursive_count(&self, depth: u32) {
        self.recursive_count.store(depth, Ordering::Relaxed);
    }
}

impl<P: Platform> Drop for Mutex<P> {
    fn drop(&mut self) {
        // A panic unwinding past a held lock already reported its problem.
        if std::thread::panicking() {
            return;
        }
        self.check_idle(self.platform.termination());
    }
}

impl<P: Platform> fmt::Debug for Mutex<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state_and_waiters.load(Ordering::Relaxed);
        f.debug_struct("Mutex")
            .field("held", &(state & HELD_MASK != 0))
            .field("waiters", &(state >> WAITER_SHIFT))
            .field("owner", &self.owner())
            .field("recursive_count", &self.recursive_count())
            .field("requeued", &self.requeued_count())
            .field("recursive", &self.recursive)
            .finish()
    }
}

/// Scoped hold of a [`Mutex`]. Unlocks on drop.
pub struct MutexGuard<'a, P: Platform = NativePlatform> {
    mutex: &'a Mutex<P>,
}

impl<'a, P: Platform> MutexGuard<'a, P> {
    /// The guarded mutex.
    #[must_use]
    pub fn mutex(&self) -> &'a Mutex<P> {
        self.mutex
    }
}

impl<P: Platform> Drop for MutexGuard<'_, P> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
