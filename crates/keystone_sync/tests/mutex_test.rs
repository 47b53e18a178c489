//! Integration tests for Mutex and RecursiveMutex under real contention.

use keystone_core::{OsThreadIdentity, ParkingWaitQueue, Platform, Runtime, SpinConfig, ThreadIdentity};
use keystone_sync::{Mutex, NativePlatform, RecursiveMutex, ThreadId};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const THREADS: usize = 8;
const ITERATIONS: u64 = 20_000;

/// Increments with a separate load and store: any overlap between two
/// critical sections loses an update.
fn hammer<P: Platform + 'static>(mutex: Arc<Mutex<P>>) {
    let counter = Arc::new(AtomicU64::new(0));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let mutex = Arc::clone(&mutex);
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..ITERATIONS {
                    mutex.lock();
                    let value = counter.load(Ordering::Relaxed);
                    counter.store(value + 1, Ordering::Relaxed);
                    mutex.unlock();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(counter.load(Ordering::Relaxed), THREADS as u64 * ITERATIONS);
    assert!(!mutex.is_held());
    assert_eq!(mutex.waiter_count(), 0);
}

#[test]
fn test_mutual_exclusion_native() {
    hammer(Arc::new(Mutex::<NativePlatform>::new()));
}

#[test]
fn test_mutual_exclusion_parking() {
    hammer(Arc::new(Mutex::with_platform(
        Runtime::new(ParkingWaitQueue::new()).shared(),
    )));
}

#[test]
fn test_mutual_exclusion_parking_without_spinning() {
    // Every contended lock goes straight to the wait queue.
    let runtime = Runtime::new(ParkingWaitQueue::new())
        .with_spin(SpinConfig::disabled())
        .shared();
    hammer(Arc::new(Mutex::with_platform(runtime)));
}

#[cfg(target_os = "linux")]
#[test]
fn test_mutual_exclusion_futex_without_spinning() {
    let runtime = Runtime::new(keystone_core::FutexWaitQueue)
        .with_spin(SpinConfig::disabled())
        .shared();
    hammer(Arc::new(Mutex::with_platform(runtime)));
}

#[test]
fn test_try_lock_handoff_scenario() {
    let mutex = Arc::new(Mutex::new());
    assert!(mutex.lock_with(false));

    let try_from_other = |mutex: &Arc<Mutex>| {
        let mutex = Arc::clone(mutex);
        thread::spawn(move || {
            let acquired = mutex.try_lock();
            if acquired {
                mutex.unlock();
            }
            acquired
        })
        .join()
        .unwrap()
    };

    assert!(!try_from_other(&mutex));
    mutex.unlock();
    assert!(try_from_other(&mutex));
}

#[test]
fn test_try_lock_never_blocks() {
    let mutex = Arc::new(Mutex::new());
    mutex.lock();

    let contender = {
        let mutex = Arc::clone(&mutex);
        thread::spawn(move || {
            let start = Instant::now();
            for _ in 0..1_000 {
                assert!(!mutex.try_lock());
            }
            start.elapsed()
        })
    };
    let elapsed = contender.join().unwrap();
    mutex.unlock();

    println!("1000 failed try_lock calls: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(1));
}

#[test]
fn test_try_lock_with_spinning_gives_up() {
    let mutex = Arc::new(Mutex::new());
    mutex.lock();
    let result = {
        let mutex = Arc::clone(&mutex);
        thread::spawn(move || mutex.try_lock_with_spinning()).join().unwrap()
    };
    assert!(!result);
    mutex.unlock();
}

/// OS ids, counting every lookup. Each lock attempt looks its caller up
/// exactly once.
#[derive(Default)]
struct CountingIdentity {
    lookups: AtomicUsize,
}

impl ThreadIdentity for CountingIdentity {
    fn current(&self) -> ThreadId {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        OsThreadIdentity.current()
    }

    fn invalidate(&self) {
        OsThreadIdentity.invalidate();
    }
}

/// Owner id no real thread has; set and cleared with the hand-off calls.
const ABSENT_HOLDER: ThreadId = ThreadId::from_raw(u32::MAX - 3);

#[test]
fn test_try_lock_with_spinning_catches_release_mid_spin() {
    const ATTEMPTS: usize = 200;
    let runtime = Runtime::with_identity(ParkingWaitQueue::new(), CountingIdentity::default()).shared();
    let mutex = Mutex::with_platform(Arc::clone(&runtime));
    let lookups = &runtime.identity().lookups;

    let mut caught = 0;
    for _ in 0..ATTEMPTS {
        mutex.lock_for_other(ABSENT_HOLDER);
        lookups.store(0, Ordering::SeqCst);
        let acquired = thread::scope(|s| {
            s.spawn(|| {
                // The first attempt has failed; release while the caller spins.
                while lookups.load(Ordering::SeqCst) < 2 {
                    std::hint::spin_loop();
                }
                mutex.unlock_for_other(ABSENT_HOLDER);
            });
            mutex.try_lock_with_spinning()
        });
        if acquired {
            assert!(lookups.load(Ordering::SeqCst) >= 2);
            caught += 1;
            mutex.unlock();
        }
        assert_eq!(mutex.owner(), ThreadId::NONE);
    }
    println!("release caught mid-spin in {caught}/{ATTEMPTS} attempts");
    assert!(caught > 0, "spinning never observed a release");
}

#[test]
fn test_unlock_for_other_wakes_blocked_locker() {
    let runtime = Runtime::new(ParkingWaitQueue::new())
        .with_spin(SpinConfig::disabled())
        .shared();
    let mutex = Mutex::with_platform(runtime);
    mutex.lock_for_other(ABSENT_HOLDER);

    thread::scope(|s| {
        let blocked = s.spawn(|| {
            mutex.lock();
            let owner = mutex.owner();
            mutex.unlock();
            owner
        });

        let start = Instant::now();
        while mutex.waiter_count() == 0 {
            assert!(start.elapsed() < Duration::from_secs(5), "locker never registered");
            thread::yield_now();
        }
        mutex.unlock_for_other(ABSENT_HOLDER);

        while !blocked.is_finished() {
            assert!(start.elapsed() < Duration::from_secs(5), "blocked locker was never woken");
            thread::yield_now();
        }
        let owner = blocked.join().unwrap();
        assert!(!owner.is_none());
        assert_ne!(owner, ABSENT_HOLDER);
    });
    assert_eq!(mutex.waiter_count(), 0);
    assert_eq!(mutex.owner(), ThreadId::NONE);
}

#[test]
fn test_recursive_requires_matching_unlocks() {
    const DEPTH: u32 = 5;
    let mutex = Arc::new(RecursiveMutex::new());
    for _ in 0..DEPTH {
        mutex.lock();
    }

    let try_from_other = |mutex: &Arc<RecursiveMutex>| {
        let mutex = Arc::clone(mutex);
        thread::spawn(move || {
            let acquired = mutex.try_lock();
            if acquired {
                mutex.unlock();
            }
            acquired
        })
        .join()
        .unwrap()
    };

    for remaining in (1..=DEPTH).rev() {
        assert_eq!(mutex.recursive_count(), remaining);
        assert!(!try_from_other(&mutex), "acquired with {remaining} holds left");
        mutex.unlock();
    }
    assert!(try_from_other(&mutex));
}

#[test]
fn test_recursive_twice_scenario() {
    let mutex = Arc::new(RecursiveMutex::with_platform(
        Runtime::new(ParkingWaitQueue::new()).shared(),
    ));
    mutex.lock();
    mutex.lock();

    for _ in 0..2 {
        let mutex = Arc::clone(&mutex);
        assert!(!thread::spawn(move || mutex.try_lock()).join().unwrap());
    }

    mutex.unlock();
    mutex.unlock();

    let other = Arc::clone(&mutex);
    let acquired = thread::spawn(move || {
        let acquired = other.try_lock();
        if acquired {
            other.unlock();
        }
        acquired
    })
    .join()
    .unwrap();
    assert!(acquired);
}

#[test]
fn test_guard_under_contention() {
    let mutex = Arc::new(Mutex::new());
    let counter = Arc::new(AtomicU64::new(0));

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..5_000 {
                    let _guard = mutex.guard();
                    let value = counter.load(Ordering::Relaxed);
                    counter.store(value + 1, Ordering::Relaxed);
                }
            });
        }
    });
    assert_eq!(counter.load(Ordering::Relaxed), 20_000);
}
