//! Locks on a runtime with an injected thread identity: ownership follows
//! the injected ids, and invalidation renumbers the next operation.

use keystone_core::{ParkingWaitQueue, Runtime, ThreadIdentity};
use keystone_sync::{Mutex, Platform, ReadWriteLock, ThreadId};
use parking_lot::Mutex as TableLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

/// Hands out 1, 2, 3, ... in first-call order. Invalidation forgets every
/// assignment, so each thread gets a fresh number next time.
#[derive(Default)]
struct SequentialIdentity {
    assigned: TableLock<HashMap<thread::ThreadId, u32>>,
    next: AtomicU32,
    invalidations: AtomicU32,
}

impl ThreadIdentity for SequentialIdentity {
    fn current(&self) -> ThreadId {
        let mut assigned = self.assigned.lock();
        let raw = *assigned
            .entry(thread::current().id())
            .or_insert_with(|| self.next.fetch_add(1, Ordering::Relaxed) + 1);
        ThreadId::from_raw(raw)
    }

    fn invalidate(&self) {
        self.assigned.lock().clear();
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }
}

type SequentialRuntime = Arc<Runtime<ParkingWaitQueue, SequentialIdentity>>;

fn sequential_runtime() -> SequentialRuntime {
    Runtime::with_identity(ParkingWaitQueue::new(), SequentialIdentity::default()).shared()
}

#[test]
fn test_mutex_owner_follows_injected_ids() {
    let runtime = sequential_runtime();
    let mutex = Mutex::with_platform(Arc::clone(&runtime));

    mutex.lock();
    let me = runtime.current_thread();
    assert_eq!(me, ThreadId::from_raw(1));
    assert_eq!(mutex.owner(), me);
    assert!(mutex.is_held_by(me));

    let (other, acquired) = thread::scope(|s| {
        s.spawn(|| (runtime.current_thread(), mutex.try_lock()))
            .join()
            .unwrap()
    });
    assert_eq!(other, ThreadId::from_raw(2));
    assert!(!acquired);
    assert!(!mutex.is_held_by(other));

    mutex.unlock();
    assert_eq!(mutex.owner(), ThreadId::NONE);
}

#[test]
fn test_invalidate_renumbers_next_lock() {
    let runtime = sequential_runtime();
    let mutex = Mutex::with_platform(Arc::clone(&runtime));

    mutex.lock();
    let before = mutex.owner();
    mutex.unlock();

    runtime.identity().invalidate();
    assert_eq!(runtime.identity().invalidations.load(Ordering::Relaxed), 1);

    mutex.lock();
    let after = mutex.owner();
    assert_ne!(after, before);
    assert_eq!(after, runtime.current_thread());
    mutex.unlock();
}

#[test]
fn test_invalidate_while_held_orphans_the_lock() {
    let runtime = sequential_runtime();
    runtime.termination().suppress();
    let mutex = Mutex::with_platform(Arc::clone(&runtime));

    mutex.lock();
    let stale = mutex.owner();
    runtime.identity().invalidate();

    // Under the new id the caller is a stranger to its own lock.
    assert!(!mutex.is_held());
    mutex.unlock();
    assert!(mutex.is_held_by(stale));

    mutex.unlock_for_other(stale);
    assert_eq!(mutex.owner(), ThreadId::NONE);
    assert!(mutex.try_lock());
    mutex.unlock();
}

#[test]
fn test_rwlock_writer_follows_injected_ids() {
    let runtime = sequential_runtime();
    let lock = ReadWriteLock::with_platform(Arc::clone(&runtime));

    lock.write_lock();
    assert_eq!(lock.owner(), runtime.current_thread());
    lock.unlock();
    assert_eq!(lock.owner(), ThreadId::NONE);

    runtime.identity().invalidate();
    lock.write_lock();
    assert_eq!(lock.owner(), ThreadId::from_raw(2));
    lock.write_unlock();
}
