//! # Thread Identity
//!
//! Lock words record their owner as a 32-bit OS thread id. Looking that id up
//! is a syscall, so each thread caches it on first use.
//!
//! ## Fork Contract
//!
//! After `fork()` the child's only thread inherits the parent's thread-local
//! cache, which holds the *parent's* thread id. Every lock the child touches
//! would then believe it is owned by a thread that does not exist.
//!
//! The embedding process MUST call [`post_fork`] once in the child, before
//! the child touches any lock. It bumps a process-wide generation so every
//! cached id is recomputed on next use.

#![allow(unsafe_code)]

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// An OS thread id as stored in lock words. Zero means "no thread".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u32);

impl ThreadId {
    /// The "no owner" sentinel.
    pub const NONE: Self = Self(0);

    /// Wraps a raw id as read from a lock word.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw value stored in lock words.
    #[inline]
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Returns true for the [`ThreadId::NONE`] sentinel.
    #[inline]
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("<none>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Source of the calling thread's id.
///
/// Injected through [`crate::Platform`] so tests and verification builds can
/// substitute their own numbering.
pub trait ThreadIdentity: Send + Sync {
    /// Id of the calling thread. Never [`ThreadId::NONE`].
    fn current(&self) -> ThreadId;

    /// Drops every cached id so the next [`ThreadIdentity::current`] call
    /// recomputes it. Required in a child process after `fork()`.
    fn invalidate(&self);
}

/// Bumped by every invalidation; caches tagged with an older value are stale.
static FORK_GENERATION: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// (generation, raw id). Raw id 0 means "not computed yet".
    static CACHED_ID: Cell<(u64, u32)> = const { Cell::new((0, 0)) };
}

/// The default identity: OS thread id (`gettid` on Linux) cached per thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsThreadIdentity;

impl OsThreadIdentity {
    /// Number of invalidations so far. Diagnostic.
    #[must_use]
    pub fn generation() -> u64 {
        FORK_GENERATION.load(Ordering::Relaxed)
    }
}

impl ThreadIdentity for OsThreadIdentity {
    #[inline]
    fn current(&self) -> ThreadId {
        let generation = FORK_GENERATION.load(Ordering::Relaxed);
        CACHED_ID
            .try_with(|cached| {
                let (cached_generation, raw) = cached.get();
                if raw != 0 && cached_generation == generation {
                    return ThreadId(raw);
                }
                let raw = os_thread_id();
                cached.set((generation, raw));
                ThreadId(raw)
            })
            // TLS already torn down: still answer, just without caching.
            .unwrap_or_else(|_| ThreadId(os_thread_id()))
    }

    fn invalidate(&self) {
        FORK_GENERATION.fetch_add(1, Ordering::Relaxed);
    }
}

/// Resets cached thread ids. Call once in the child right after `fork()`.
///
/// Allocation-free and lock-free, so it is safe in a freshly forked child of
/// a multi-threaded parent.
pub fn post_fork() {
    OsThreadIdentity.invalidate();
}

#[cfg(target_os = "linux")]
fn os_thread_id() -> u32 {
    // SAFETY: gettid takes no arguments and cannot fail.
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    // Linux thread ids are positive and fit in pid_t.
    u32::try_from(tid).unwrap_or(u32::MAX)
}

#[cfg(not(target_os = "linux"))]
fn os_thread_id() -> u32 {
    use std::sync::atomic::AtomicU32;

    static NEXT_ID: AtomicU32 = AtomicU32::new(1);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}
