//! # Error Types
//!
//! Two families live here and they are handled very differently:
//!
//! - [`ProtocolViolation`]: a caller broke the locking protocol. Never
//!   returned; always routed through [`crate::TerminationPolicy::report`].
//! - [`ConfigError`]: startup configuration problems, returned as `Result`.

use thiserror::Error;

use crate::identity::ThreadId;

/// A misuse of a lock that the runtime cannot recover from.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// Destroyed while held, owned or waited on.
    #[error("{lock} destroyed while busy: state {state:#x}, owner {owner}")]
    DestroyedWhileBusy {
        /// Kind of lock.
        lock: &'static str,
        /// Raw state word at destruction.
        state: u32,
        /// Recorded owner at destruction.
        owner: ThreadId,
    },

    /// Unlocked by a thread that does not own it.
    #[error("{lock} unlocked by thread {caller}, but owned by {owner}")]
    UnlockNotOwner {
        /// Kind of lock.
        lock: &'static str,
        /// Recorded owner.
        owner: ThreadId,
        /// Thread attempting the unlock.
        caller: ThreadId,
    },

    /// Unlocked while not locked in the released mode at all.
    #[error("{lock} unlocked while not held (state {state:#x})")]
    UnlockUnheld {
        /// Kind of lock.
        lock: &'static str,
        /// Raw state word observed.
        state: u32,
    },

    /// Condition variable wait entered without holding the mutex.
    #[error("condition variable wait by thread {caller} without holding the mutex")]
    WaitWithoutMutex {
        /// Thread attempting the wait.
        caller: ThreadId,
    },

    /// Condition variable used with a second, different mutex.
    #[error("condition variable bound to mutex {bound:#x}, used with {other:#x}")]
    CondvarRebound {
        /// Address of the mutex bound on first use.
        bound: usize,
        /// Address of the offending mutex.
        other: usize,
    },

    /// Condition variable destroyed with threads still waiting on it.
    #[error("condition variable destroyed with {waiters} waiter(s)")]
    CondvarDestroyedWithWaiters {
        /// Number of registered waiters.
        waiters: u32,
    },

    /// Non-recursive lock re-acquired by its owner.
    #[error("{lock} re-locked by its owner {owner}")]
    Reentrant {
        /// Kind of lock.
        lock: &'static str,
        /// The owning (and re-locking) thread.
        owner: ThreadId,
    },

    /// Ownership handed to another thread while the lock was not idle.
    #[error("{lock} handed to thread {target} while busy (state {state:#x})")]
    HandoffContended {
        /// Kind of lock.
        lock: &'static str,
        /// Intended owner.
        target: ThreadId,
        /// Raw state word observed.
        state: u32,
    },
}

/// Errors raised while loading or installing configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid TOML for [`crate::SyncConfig`].
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The selected wait backend does not exist on this target.
    #[error("wait backend {0} is not supported on this target")]
    UnsupportedBackend(&'static str),

    /// The process-wide runtime was already installed (or already in use).
    #[error("runtime already installed")]
    AlreadyInstalled,
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
