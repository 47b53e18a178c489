//! # Wait Queues
//!
//! The one OS capability every lock needs: sleep on a memory address until
//! someone wakes it, unless the address no longer holds the value we last
//! saw.
//!
//! ```text
//!   waiter                              waker
//!   ──────                              ─────
//!   v = word.load()
//!   decide to sleep                     word.store(new)
//!   wait(word, v)  ── word != v? ──>    wake(word, n)
//!        │           return at once         │
//!        └──────────── sleeps until ────────┘
//! ```
//!
//! The compare-and-sleep is atomic with respect to `wake`, which is what
//! makes "check, then block" free of missed wakeups.
//!
//! ## Backends
//!
//! | Backend               | Target | Mechanism                                |
//! |-----------------------|--------|------------------------------------------|
//! | [`FutexWaitQueue`]    | Linux  | `futex(2)`, process-private              |
//! | [`ParkingWaitQueue`]  | any    | hashed `parking_lot` mutex/condvar buckets |
//!
//! [`NativeWaitQueue`] picks one at runtime from [`crate::SyncConfig`].

#[cfg(target_os = "linux")]
mod futex;
mod parking;

#[cfg(target_os = "linux")]
pub use futex::FutexWaitQueue;
pub use parking::ParkingWaitQueue;

use std::sync::atomic::AtomicU32;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::WaitBackend;
use crate::error::ConfigResult;

/// How a [`WaitQueue::wait`] call ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WaitOutcome {
    /// Woken by [`WaitQueue::wake`] (directly or after a requeue).
    Woken,
    /// The deadline passed.
    TimedOut,
    /// Returned without a wake: the word had already changed, a signal
    /// interrupted the wait, or the OS simply returned early.
    Spurious,
}

/// When a timed wait gives up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deadline {
    /// Relative to the moment the wait starts (monotonic clock).
    After(Duration),
    /// Absolute wall-clock time.
    At(SystemTime),
}

impl Deadline {
    /// Builds a deadline from millisecond + nanosecond parts, the shape
    /// runtime-level `wait(ms, ns)` calls arrive in. Absolute parts count from
    /// the Unix epoch.
    #[must_use]
    pub fn from_parts(ms: u64, ns: u32, absolute: bool) -> Self {
        let span = Duration::from_millis(ms).saturating_add(Duration::from_nanos(u64::from(ns)));
        if absolute {
            Self::At(UNIX_EPOCH + span)
        } else {
            Self::After(span)
        }
    }

    /// Time left from now. Zero once passed.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        match *self {
            Self::After(span) => span,
            Self::At(at) => at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO),
        }
    }

    /// Converts to a monotonic instant measured from now. `None` if the
    /// deadline is too far away to represent.
    #[must_use]
    pub fn to_instant(&self) -> Option<Instant> {
        Instant::now().checked_add(self.remaining())
    }
}

/// Address-keyed wait/wake/requeue.
///
/// Implementations must guarantee that `wait` re-checks `expected` against
/// the word atomically with respect to `wake` and `requeue` on the same
/// address.
pub trait WaitQueue: Send + Sync {
    /// Blocks while `*word == expected`, until woken or `deadline` passes.
    /// Returns [`WaitOutcome::Spurious`] immediately if the word differs.
    fn wait(&self, word: &AtomicU32, expected: u32, deadline: Option<Deadline>) -> WaitOutcome;

    /// Wakes up to `count` threads blocked on `word`. Returns how many.
    fn wake(&self, word: &AtomicU32, count: u32) -> usize;

    /// Moves up to `count` threads blocked on `from` so they now block on
    /// `to`, without waking them. Returns how many were moved where the
    /// backend can tell; the futex backend reports the kernel's total.
    fn requeue(&self, from: &AtomicU32, count: u32, to: &AtomicU32) -> usize;
}

impl<Q: WaitQueue + ?Sized> WaitQueue for &Q {
    #[inline]
    fn wait(&self, word: &AtomicU32, expected: u32, deadline: Option<Deadline>) -> WaitOutcome {
        (**self).wait(word, expected, deadline)
    }

    #[inline]
    fn wake(&self, word: &AtomicU32, count: u32) -> usize {
        (**self).wake(word, count)
    }

    #[inline]
    fn requeue(&self, from: &AtomicU32, count: u32, to: &AtomicU32) -> usize {
        (**self).requeue(from, count, to)
    }
}

/// Runtime-selected backend.
#[derive(Debug)]
pub enum NativeWaitQueue {
    /// Linux futex.
    #[cfg(target_os = "linux")]
    Futex(FutexWaitQueue),
    /// Parking emulation.
    Parking(ParkingWaitQueue),
}

impl NativeWaitQueue {
    /// Builds the backend named by `backend`.
    ///
    /// # Errors
    ///
    /// [`crate::ConfigError::UnsupportedBackend`] if the backend does not exist on
    /// this target.
    pub fn for_backend(backend: WaitBackend) -> ConfigResult<Self> {
        match backend {
            #[cfg(target_os = "linux")]
            WaitBackend::Futex => Ok(Self::Futex(FutexWaitQueue)),
            #[cfg(not(target_os = "linux"))]
            WaitBackend::Futex => Err(crate::error::ConfigError::UnsupportedBackend(backend.name())),
            WaitBackend::Parking => Ok(Self::Parking(ParkingWaitQueue::new())),
        }
    }

    /// The backend this queue was built for.
    #[must_use]
    pub fn backend(&self) -> WaitBackend {
        match self {
            #[cfg(target_os = "linux")]
            Self::Futex(_) => WaitBackend::Futex,
            Self::Parking(_) => WaitBackend::Parking,
        }
    }
}

impl Default for NativeWaitQueue {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        {
            Self::Futex(FutexWaitQueue)
        }
        #[cfg(not(target_os = "linux"))]
        {
            Self::Parking(ParkingWaitQueue::new())
        }
    }
}

impl WaitQueue for NativeWaitQueue {
    #[inline]
    fn wait(&self, word: &AtomicU32, expected: u32, deadline: Option<Deadline>) -> WaitOutcome {
        match self {
            #[cfg(target_os = "linux")]
            Self::Futex(queue) => queue.wait(word, expected, deadline),
            Self::Parking(queue) => queue.wait(word, expected, deadline),
        }
    }

    #[inline]
    fn wake(&self, word: &AtomicU32, count: u32) -> usize {
        match self {
            #[cfg(target_os = "linux")]
            Self::Futex(queue) => queue.wake(word, count),
            Self::Parking(queue) => queue.wake(word, count),
        }
    }

    #[inline]
    fn requeue(&self, from: &AtomicU32, count: u32, to: &AtomicU32) -> usize {
        match self {
            #[cfg(target_os = "linux")]
            Self::Futex(queue) => queue.requeue(from, count, to),
            Self::Parking(queue) => queue.requeue(from, count, to),
        }
    }
}

/// Shared conformance tests, run against every backend.
#[cfg(test)]
pub(crate) mod conformance {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;

    pub fn value_mismatch_returns_immediately<Q: WaitQueue>(queue: &Q) {
        let word = AtomicU32::new(1);
        let outcome = queue.wait(&word, 0, None);
        assert_eq!(outcome, WaitOutcome::Spurious);
    }

    pub fn relative_timeout_expires<Q: WaitQueue>(queue: &Q) {
        let word = AtomicU32::new(0);
        let start = Instant::now();
        let timeout = Duration::from_millis(30);
        // Retry on spurious returns, as every caller must.
        loop {
            let outcome = queue.wait(&word, 0, Some(Deadline::After(timeout.saturating_sub(start.elapsed()))));
            if outcome == WaitOutcome::TimedOut {
                break;
            }
            assert!(start.elapsed() < Duration::from_secs(5));
        }
        assert!(start.elapsed() >= timeout);
    }

    pub fn absolute_timeout_expires<Q: WaitQueue>(queue: &Q) {
        let word = AtomicU32::new(0);
        let until = SystemTime::now() + Duration::from_millis(30);
        loop {
            if queue.wait(&word, 0, Some(Deadline::At(until))) == WaitOutcome::TimedOut {
                break;
            }
        }
        assert!(SystemTime::now() >= until);
    }

    pub fn wake_without_waiters_is_zero<Q: WaitQueue>(queue: &Q) {
        let word = AtomicU32::new(0);
        assert_eq!(queue.wake(&word, 1), 0);
        assert_eq!(queue.wake(&word, u32::MAX), 0);
    }

    pub fn wake_releases_blocked_thread<Q: WaitQueue + 'static>(queue: Arc<Q>) {
        let word = Arc::new(AtomicU32::new(0));
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        let waiter = {
            let queue = Arc::clone(&queue);
            let word = Arc::clone(&word);
            thread::spawn(move || {
                ready_tx.send(()).unwrap();
                while word.load(Ordering::Acquire) == 0 {
                    let _ = queue.wait(&word, 0, None);
                }
            })
        };

        ready_rx.recv().unwrap();
        thread::sleep(Duration::from_millis(20));
        word.store(1, Ordering::Release);
        queue.wake(&word, 1);
        waiter.join().unwrap();
    }

    pub fn requeue_moves_waiter<Q: WaitQueue + 'static>(queue: Arc<Q>) {
        let from = Arc::new(AtomicU32::new(0));
        let to = Arc::new(AtomicU32::new(0));
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        let waiter = {
            let queue = Arc::clone(&queue);
            let from = Arc::clone(&from);
            thread::spawn(move || {
                ready_tx.send(()).unwrap();
                queue.wait(&from, 0, Some(Deadline::After(Duration::from_secs(10))))
            })
        };

        ready_rx.recv().unwrap();
        // Requeue until the waiter has actually blocked and been moved.
        let start = Instant::now();
        while queue.requeue(&from, 1, &to) == 0 {
            assert!(start.elapsed() < Duration::from_secs(5), "waiter never blocked");
            thread::sleep(Duration::from_millis(1));
        }
        // A wake on the old address finds nobody.
        assert_eq!(queue.wake(&from, 1), 0);
        // A wake on the new address releases it.
        let start = Instant::now();
        while queue.wake(&to, 1) == 0 {
            assert!(start.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(waiter.join().unwrap(), WaitOutcome::Woken);
    }
}
