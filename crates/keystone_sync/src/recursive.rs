//! # Recursive Mutex
//!
//! A [`Mutex`] whose owner may lock it again. Each `lock` by the owner bumps
//! the hold depth without touching the lock word; the lock is released when
//! the depth returns to zero.

use std::ops::Deref;

use keystone_core::{NativePlatform, Platform, TerminationPolicy};

use crate::mutex::Mutex;

/// Re-entrant mutex. Dereferences to [`Mutex`] for every lock operation.
#[derive(Debug)]
pub struct RecursiveMutex<P: Platform = NativePlatform> {
    inner: Mutex<P>,
}

impl RecursiveMutex<NativePlatform> {
    /// Creates an unlocked recursive mutex on the process runtime.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: Mutex::build(NativePlatform, true),
        }
    }
}

impl Default for RecursiveMutex<NativePlatform> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Platform> RecursiveMutex<P> {
    /// Creates an unlocked recursive mutex on `platform`.
    #[must_use]
    pub fn with_platform(platform: P) -> Self {
        Self {
            inner: Mutex::build(platform, true),
        }
    }

    /// See [`Mutex::destroy`].
    pub fn destroy(self, policy: &TerminationPolicy) {
        self.inner.destroy(policy);
    }
}

impl<P: Platform> Deref for RecursiveMutex<P> {
    type Target = Mutex<P>;

    #[inline]
    fn deref(&self) -> &Mutex<P> {
        &self.inner
    }
}
