//! # KEYSTONE Sync
//!
//! Runtime-level locks, each arbitrated by a single 32-bit word and blocking
//! through the [`WaitQueue`] of its [`Platform`]:
//!
//! | Lock                   | Word                         | Wake policy            |
//! |------------------------|------------------------------|------------------------|
//! | [`Mutex`]              | held bit + waiter count      | one waiter per unlock  |
//! | [`RecursiveMutex`]     | same, owner may nest         | one waiter per unlock  |
//! | [`ConditionVariable`]  | generation counter           | requeue onto the mutex |
//! | [`ReadWriteLock`]      | −1 writer / n readers        | all waiters            |
//!
//! Every lock defaults to [`NativePlatform`], the process-wide runtime.
//! Pass an `Arc<Runtime<..>>` to `with_platform` to run a lock against its
//! own wait queue, identity source or termination policy.
//!
//! ## Example
//!
//! ```rust,ignore
//! use keystone_sync::{ConditionVariable, Mutex};
//!
//! static LOCK: Mutex = Mutex::new();
//! static READY: ConditionVariable<'static> = ConditionVariable::new();
//!
//! LOCK.lock();
//! while !ready() {
//!     READY.wait(&LOCK);
//! }
//! LOCK.unlock();
//! ```
//!
//! Misuse (unlocking a lock you do not own, waiting without the mutex,
//! destroying a busy lock) is reported through the platform's
//! [`TerminationPolicy`] and is fatal unless checks were suppressed.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod condvar;
pub mod mutex;
pub mod recursive;
pub mod rwlock;

pub use condvar::ConditionVariable;
pub use mutex::{Mutex, MutexGuard};
pub use recursive::RecursiveMutex;
pub use rwlock::{ReadGuard, ReadWriteLock, WriteGuard};

pub use keystone_core::{
    install, post_fork, suppress_termination_checks, Deadline, NativePlatform, Platform, Runtime,
    SyncConfig, TerminationPolicy, ThreadId, WaitQueue,
};
