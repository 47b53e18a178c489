//! # Termination Policy
//!
//! Protocol violations are fatal. The one exception is forced shutdown: when
//! the runtime kills daemon threads that never returned, those threads may
//! die holding locks, and tearing the locks down must not take the whole
//! process with them.
//!
//! ```text
//! normal operation ──suppress()──> shutdown (violations logged, not fatal)
//!                    (one way, never reset)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::ProtocolViolation;

/// One-way switch deciding how protocol violations are handled.
#[derive(Debug, Default)]
pub struct TerminationPolicy {
    suppressed: AtomicBool,
}

static GLOBAL_POLICY: TerminationPolicy = TerminationPolicy::new();

impl TerminationPolicy {
    /// A policy in its initial, fatal state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            suppressed: AtomicBool::new(false),
        }
    }

    /// The process-wide instance used by [`crate::NativePlatform`].
    #[inline]
    #[must_use]
    pub fn global() -> &'static Self {
        &GLOBAL_POLICY
    }

    /// Downgrades all subsequent violations to warnings. Never undone.
    pub fn suppress(&self) {
        if !self.suppressed.swap(true, Ordering::AcqRel) {
            tracing::warn!("termination checks suppressed, lock violations are no longer fatal");
        }
    }

    /// Whether [`TerminationPolicy::suppress`] has been called.
    #[inline]
    #[must_use]
    pub fn are_suppressed(&self) -> bool {
        self.suppressed.load(Ordering::Acquire)
    }

    /// Handles a violation: panics, or logs once suppressed.
    ///
    /// Callers continue after this returns; every call site leaves the lock
    /// in a consistent state for that case.
    ///
    /// # Panics
    ///
    /// Panics with the violation message unless checks are suppressed.
    #[track_caller]
    pub fn report(&self, violation: ProtocolViolation) {
        if self.are_suppressed() {
            tracing::warn!(%violation, "lock protocol violation during shutdown");
            return;
        }
        panic!("lock protocol violation: {violation}");
    }
}

/// Suppresses termination checks on the global policy.
pub fn suppress_termination_checks() {
    TerminationPolicy::global().suppress();
}

/// Whether the global policy has been suppressed.
#[must_use]
pub fn are_termination_checks_suppressed() -> bool {
    TerminationPolicy::global().are_suppressed()
}
