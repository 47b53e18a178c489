//! # Reader/Writer Lock
//!
//! Shared readers or one exclusive writer, arbitrated by a single word.
//!
//! ## State Word
//!
//! ```text
//!   u32::MAX (−1)   write-locked, owner recorded in exclusive_owner
//!   0               unlocked
//!   n > 0           n reader holds
//! ```
//!
//! Waiters are counted in a separate word rather than packed into the state,
//! so every unlock that may release someone wakes *all* waiters and lets them
//! race; readers and writers have no priority over each other.
//!
//! Readers never record themselves as owner. That is what lets [`ReadWriteLock::unlock`]
//! tell a write hold from a read hold without being told.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use keystone_core::{NativePlatform, Platform, ProtocolViolation, TerminationPolicy, ThreadId, WaitQueue};

/// State value of a write-locked lock.
const WRITE_LOCKED: u32 = u32::MAX;
/// Reader holds saturate below the write-locked value.
const MAX_READERS: u32 = WRITE_LOCKED - 1;

const KIND: &str = "read-write lock";

/// Reader/writer lock. Not recursive for writers; readers may nest.
pub struct ReadWriteLock<P: Platform = NativePlatform> {
    state: AtomicU32,
    /// Raw id of the writer, 0 when not write-locked.
    exclusive_owner: AtomicU32,
    /// Threads registered as blocked, readers and writers alike.
    waiters: AtomicU32,
    platform: P,
}

impl ReadWriteLock<NativePlatform> {
    /// Creates an unlocked lock on the process runtime.
    #[must_use]
    pub const fn new() -> Self {
        Self::build(NativePlatform)
    }
}

impl Default for ReadWriteLock<NativePlatform> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Platform> ReadWriteLock<P> {
    /// Creates an unlocked lock on `platform`.
    #[must_use]
    pub fn with_platform(platform: P) -> Self {
        Self::build(platform)
    }

    const fn build(platform: P) -> Self {
        Self {
            state: AtomicU32::new(0),
            exclusive_owner: AtomicU32::new(0),
            waiters: AtomicU32::new(0),
            platform,
        }
    }

    /// Acquires a shared hold, blocking while write-locked.
    pub fn read_lock(&self) {
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state < MAX_READERS {
                if self
                    .state
                    .compare_exchange_weak(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            let readable = self
                .platform
                .adaptive_wait()
                .spin_until(|| self.state.load(Ordering::Relaxed) < MAX_READERS);
            if !readable {
                self.block(state);
            }
        }
    }

    /// Attempts a shared hold without blocking.
    #[must_use]
    pub fn try_read_lock(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        while state < MAX_READERS {
            match self
                .state
                .compare_exchange_weak(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
        false
    }

    /// Acquires the exclusive hold, blocking while anyone holds the lock.
    pub fn write_lock(&self) {
        let current = self.platform.current_thread();
        if self.exclusive_owner.load(Ordering::Relaxed) == current.as_raw() {
            self.platform
                .termination()
                .report(ProtocolViolation::Reentrant { lock: KIND, owner: current });
            return;
        }
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state == 0 {
                if self
                    .state
                    .compare_exchange_weak(0, WRITE_LOCKED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    self.exclusive_owner.store(current.as_raw(), Ordering::Relaxed);
                    return;
                }
                continue;
            }
            let free = self
                .platform
                .adaptive_wait()
                .spin_until(|| self.state.load(Ordering::Relaxed) == 0);
            if !free {
                self.block(state);
            }
        }
    }

    /// Attempts the exclusive hold without blocking.
    #[must_use]
    pub fn try_write_lock(&self) -> bool {
        let current = self.platform.current_thread();
        if self
            .state
            .compare_exchange(0, WRITE_LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        self.exclusive_owner.store(current.as_raw(), Ordering::Relaxed);
        true
    }

    /// Sleeps until the state word moves away from `observed`.
    fn block(&self, observed: u32) {
        // SeqCst pairs with the unlock side: either we see its new state, or
        // it sees our registration and wakes us.
        self.waiters.fetch_add(1, Ordering::SeqCst);
        if self.state.load(Ordering::SeqCst) == observed {
            tracing::trace!(state = observed, "read-write lock contended, blocking");
            let _ = self.platform.wait_queue().wait(&self.state, observed, None);
        }
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    fn wake_waiters(&self) {
        if self.waiters.load(Ordering::SeqCst) > 0 {
            self.platform.wait_queue().wake(&self.state, u32::MAX);
        }
    }

    /// Releases whichever hold the caller has.
    ///
    /// A recorded writer means this is a write hold: readers never record
    /// themselves.
    pub fn unlock(&self) {
        if self.owner().is_none() {
            self.read_unlock();
        } else {
            self.write_unlock();
        }
    }

    /// Releases one shared hold. The last reader out wakes all waiters.
    pub fn read_unlock(&self) {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state == 0 || state == WRITE_LOCKED {
                self.platform
                    .termination()
                    .report(ProtocolViolation::UnlockUnheld { lock: KIND, state });
                return;
            }
            match self
                .state
                .compare_exchange_weak(state, state - 1, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => state = actual,
            }
        }
        if state == 1 {
            self.wake_waiters();
        }
    }

    /// Releases the exclusive hold and wakes all waiters.
    pub fn write_unlock(&self) {
        let caller = self.platform.current_thread();
        let owner = self.owner();
        if owner != caller {
            self.platform.termination().report(ProtocolViolation::UnlockNotOwner {
                lock: KIND,
                owner,
                caller,
            });
            return;
        }
        self.exclusive_owner.store(0, Ordering::Relaxed);
        if let Err(state) =
            self.state
                .compare_exchange(WRITE_LOCKED, 0, Ordering::SeqCst, Ordering::Relaxed)
        {
            self.platform
                .termination()
                .report(ProtocolViolation::UnlockUnheld { lock: KIND, state });
            return;
        }
        self.wake_waiters();
    }

    /// Shared hold scoped to the returned guard.
    #[must_use = "dropping the guard unlocks immediately"]
    pub fn read(&self) -> ReadGuard<'_, P> {
        self.read_lock();
        ReadGuard { lock: self }
    }

    /// Exclusive hold scoped to the returned guard.
    #[must_use = "dropping the guard unlocks immediately"]
    pub fn write(&self) -> WriteGuard<'_, P> {
        self.write_lock();
        WriteGuard { lock: self }
    }

    /// Whether a writer holds the lock.
    #[inline]
    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) == WRITE_LOCKED
    }

    /// Current reader holds, 0 when write-locked.
    #[inline]
    #[must_use]
    pub fn reader_count(&self) -> u32 {
        match self.state.load(Ordering::Relaxed) {
            WRITE_LOCKED => 0,
            readers => readers,
        }
    }

    /// Recorded writer, [`ThreadId::NONE`] otherwise.
    #[inline]
    #[must_use]
    pub fn owner(&self) -> ThreadId {
        ThreadId::from_raw(self.exclusive_owner.load(Ordering::Relaxed))
    }

    /// Blocked threads. Diagnostic only.
    #[inline]
    #[must_use]
    pub fn waiter_count(&self) -> u32 {
        self.waiters.load(Ordering::Relaxed)
    }

    /// Tears the lock down, checking it is idle under `policy`.
    pub fn destroy(self, policy: &TerminationPolicy) {
        self.check_idle(policy);
        self.state.store(0, Ordering::Relaxed);
        self.exclusive_owner.store(0, Ordering::Relaxed);
        self.waiters.store(0, Ordering::Relaxed);
    }

    fn check_idle(&self, policy: &TerminationPolicy) {
        let state = self.state.load(Ordering::Relaxed);
        let owner = self.owner();
        if state != 0 || !owner.is_none() || self.waiter_count() != 0 {
            policy.report(ProtocolViolation::DestroyedWhileBusy {
                lock: KIND,
                state,
                owner,
            });
        }
    }
}

impl<P: Platform> Drop for ReadWriteLock<P> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        self.check_idle(self.platform.termination());
    }
}

impl<P: Platform> fmt::Debug for ReadWriteLock<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadWriteLock")
            .field("write_locked", &self.is_write_locked())
            .field("readers", &self.reader_count())
            .field("owner", &self.owner())
            .field("waiters", &self.waiter_count())
            .finish()
    }
}

/// Scoped shared hold.
pub struct ReadGuard<'a, P: Platform = NativePlatform> {
    lock: &'a ReadWriteLock<P>,
}

impl<P: Platform> Drop for ReadGuard<'_, P> {
    fn drop(&mut self) {
        self.lock.read_unlock();
    }
}

/// Scoped exclusive hold.
pub struct WriteGuard<'a, P: Platform = NativePlatform> {
    lock: &'a ReadWriteLock<P>,
}

impl<P: Platform> Drop for WriteGuard<'_, P> {
    fn drop(&mut self) {
        self.lock.write_unlock();
    }
}
