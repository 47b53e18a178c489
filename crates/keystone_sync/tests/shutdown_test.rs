//! Forced-shutdown behavior: once termination checks are suppressed on the
//! process-wide policy, protocol violations are logged and execution goes on.
//!
//! Lives in its own test binary because suppression is one-way and global.

use keystone_core::{are_termination_checks_suppressed, Deadline};
use keystone_sync::{
    suppress_termination_checks, ConditionVariable, Mutex, ReadWriteLock, TerminationPolicy,
    ThreadId,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn test_suppressed_violations_are_not_fatal() {
    assert!(!are_termination_checks_suppressed());
    suppress_termination_checks();
    assert!(are_termination_checks_suppressed());

    // A "daemon" thread dies holding the lock.
    let mutex = Arc::new(Mutex::new());
    {
        let mutex = Arc::clone(&mutex);
        thread::spawn(move || mutex.lock()).join().unwrap();
    }
    assert!(!mutex.owner().is_none());

    // Unlock by a non-owner: warned, lock stays with the dead thread.
    mutex.unlock();
    assert!(!mutex.owner().is_none());
    assert!(!mutex.try_lock());

    // Handing a busy lock to someone else: warned, ignored.
    mutex.lock_for_other(ThreadId::from_raw(1));
    assert!(!mutex.is_held_by(ThreadId::from_raw(1)));

    // Tearing it down: warned, not fatal.
    match Arc::try_unwrap(mutex) {
        Ok(mutex) => mutex.destroy(TerminationPolicy::global()),
        Err(_) => panic!("mutex still shared"),
    }

    // Re-locking a held non-recursive mutex returns without a second hold.
    let mutex = Mutex::new();
    mutex.lock();
    assert!(!mutex.lock_with(false));
    assert_eq!(mutex.recursive_count(), 1);
    mutex.unlock();

    // Waiting without the mutex returns immediately.
    let other = Mutex::new();
    let condvar = ConditionVariable::new();
    assert!(!condvar.timed_wait(&other, Deadline::After(Duration::from_secs(30))));

    // Read-unlocking an idle rwlock is ignored.
    let rwlock = ReadWriteLock::new();
    rwlock.read_unlock();
    assert_eq!(rwlock.reader_count(), 0);

    // A busy rwlock dropped during shutdown only warns.
    rwlock.write_lock();
    drop(rwlock);
}
