//! # Parking Backend
//!
//! Futex semantics emulated in user space, for targets without futexes and
//! for deterministic test runs.
//!
//! ## Layout
//!
//! ```text
//!  address ──hash──> bucket[i] ── Mutex<Vec<Arc<Waiter>>>
//!                                       │
//!                                       └─ Waiter { key, woken: Mutex<bool>, Condvar }
//! ```
//!
//! A bucket lock serializes "compare word, enqueue" against "dequeue, wake"
//! for every address hashing to it, which is exactly the atomicity a futex
//! provides. Each waiter sleeps on its own condvar so a wake never has to
//! broadcast to unrelated threads.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use super::{Deadline, WaitOutcome, WaitQueue};

/// Number of hash buckets. Power of two.
const BUCKET_COUNT: usize = 64;

/// A blocked thread.
struct Waiter {
    /// Address currently waited on. Changes only under both bucket locks.
    key: AtomicUsize,
    /// Set by the waker, under this mutex.
    woken: Mutex<bool>,
    condvar: Condvar,
}

impl Waiter {
    fn new(key: usize) -> Self {
        Self {
            key: AtomicUsize::new(key),
            woken: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn unpark(&self) {
        *self.woken.lock() = true;
        self.condvar.notify_one();
    }
}

#[derive(Default)]
struct Bucket {
    waiters: Mutex<Vec<Arc<Waiter>>>,
}

/// User-space wait queue on `parking_lot` primitives.
pub struct ParkingWaitQueue {
    buckets: Box<[Bucket]>,
}

impl std::fmt::Debug for ParkingWaitQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParkingWaitQueue")
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

impl Default for ParkingWaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn key_of(word: &AtomicU32) -> usize {
    word as *const AtomicU32 as usize
}

impl ParkingWaitQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: (0..BUCKET_COUNT).map(|_| Bucket::default()).collect(),
        }
    }

    #[inline]
    fn bucket_index(key: usize) -> usize {
        // Fibonacci hashing; low bits of an aligned address are all zero.
        (key.wrapping_mul(0x9E37_79B9_7F4A_7C15_u64 as usize) >> 20) & (BUCKET_COUNT - 1)
    }

    #[inline]
    fn bucket(&self, key: usize) -> &Bucket {
        &self.buckets[Self::bucket_index(key)]
    }

    /// Number of threads currently queued on `word`. Diagnostic.
    #[must_use]
    pub fn queued(&self, word: &AtomicU32) -> usize {
        let key = key_of(word);
        self.bucket(key)
            .waiters
            .lock()
            .iter()
            .filter(|w| w.key.load(Ordering::Relaxed) == key)
            .count()
    }

    /// Removes `waiter` from whatever bucket it is in now. Returns false if
    /// a waker already dequeued it.
    fn cancel(&self, waiter: &Arc<Waiter>) -> bool {
        loop {
            let key = waiter.key.load(Ordering::Acquire);
            let mut queue = self.bucket(key).waiters.lock();
            // A concurrent requeue may have moved it between the load and
            // the lock; the key is stable while we hold its bucket.
            if waiter.key.load(Ordering::Acquire) != key {
                continue;
            }
            return match queue.iter().position(|w| Arc::ptr_eq(w, waiter)) {
                Some(pos) => {
                    queue.swap_remove(pos);
                    true
                }
                None => false,
            };
        }
    }

    /// Locks the buckets for two keys in index order.
    fn lock_pair(
        &self,
        from: usize,
        to: usize,
    ) -> (MutexGuard<'_, Vec<Arc<Waiter>>>, Option<MutexGuard<'_, Vec<Arc<Waiter>>>>) {
        let (a, b) = (Self::bucket_index(from), Self::bucket_index(to));
        if a == b {
            return (self.buckets[a].waiters.lock(), None);
        }
        if a < b {
            let first = self.buckets[a].waiters.lock();
            let second = self.buckets[b].waiters.lock();
            (first, Some(second))
        } else {
            let second = self.buckets[b].waiters.lock();
            let first = self.buckets[a].waiters.lock();
            (first, Some(second))
        }
    }
}

impl WaitQueue for ParkingWaitQueue {
    fn wait(&self, word: &AtomicU32, expected: u32, deadline: Option<Deadline>) -> WaitOutcome {
        let key = key_of(word);
        let waiter = Arc::new(Waiter::new(key));
        {
            let mut queue = self.bucket(key).waiters.lock();
            if word.load(Ordering::SeqCst) != expected {
                return WaitOutcome::Spurious;
            }
            queue.push(Arc::clone(&waiter));
        }

        // Deadlines too far out to represent are treated as "forever".
        let until = deadline.and_then(|d| d.to_instant());
        let mut woken = waiter.woken.lock();
        while !*woken {
            match until {
                None => waiter.condvar.wait(&mut woken),
                Some(instant) => {
                    if waiter.condvar.wait_until(&mut woken, instant).timed_out() {
                        break;
                    }
                }
            }
        }
        if *woken {
            return WaitOutcome::Woken;
        }
        drop(woken);

        if self.cancel(&waiter) {
            WaitOutcome::TimedOut
        } else {
            // Lost the race to a waker; consume its wake-up.
            let mut woken = waiter.woken.lock();
            while !*woken {
                waiter.condvar.wait(&mut woken);
            }
            WaitOutcome::Woken
        }
    }

    fn wake(&self, word: &AtomicU32, count: u32) -> usize {
        let key = key_of(word);
        let mut released = Vec::new();
        {
            let mut queue = self.bucket(key).waiters.lock();
            let mut i = 0;
            while i < queue.len() && released.len() < count as usize {
                if queue[i].key.load(Ordering::Relaxed) == key {
                    // Preserve arrival order for the waiters left behind.
                    released.push(queue.remove(i));
                } else {
                    i += 1;
                }
            }
        }
        for waiter in &released {
            waiter.unpark();
        }
        released.len()
    }

    fn requeue(&self, from: &AtomicU32, count: u32, to: &AtomicU32) -> usize {
        let (from_key, to_key) = (key_of(from), key_of(to));
        if from_key == to_key {
            return 0;
        }
        let (mut source, mut target) = self.lock_pair(from_key, to_key);
        let mut moved = 0;
        let mut i = 0;
        while i < source.len() && moved < count as usize {
            if source[i].key.load(Ordering::Relaxed) != from_key {
                i += 1;
                continue;
            }
            source[i].key.store(to_key, Ordering::Release);
            moved += 1;
            match target.as_mut() {
                Some(target) => target.push(source.remove(i)),
                // Same bucket: the key change alone moves it.
                None => i += 1,
            }
        }
        moved
    }
}
