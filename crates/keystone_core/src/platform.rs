//! # Platform Injection
//!
//! Locks never reach for the OS directly. Everything environmental comes
//! through a [`Platform`]:
//!
//! ```text
//!                 ┌──────────── Platform ─────────────┐
//!  Mutex<P>  ───> │ wait_queue()     WaitQueue        │
//!  Condvar<P>───> │ current_thread() ThreadIdentity   │
//!  RwLock<P> ───> │ adaptive_wait()  spin bound       │
//!                 │ termination()    TerminationPolicy│
//!                 └───────────────────────────────────┘
//! ```
//!
//! - [`NativePlatform`]: zero-sized handle to the process-wide runtime. The
//!   default for every lock.
//! - `Arc<Runtime<Q, I>>`: an explicit runtime, for tests and verification
//!   builds that swap in their own queue or identity.
//!
//! A condition variable requeues waiters from its own word onto its mutex's
//! word, so both must use the *same* wait queue instance.

use std::sync::{Arc, OnceLock};

use crate::config::{SpinConfig, SyncConfig};
use crate::error::{ConfigError, ConfigResult};
use crate::identity::{OsThreadIdentity, ThreadId, ThreadIdentity};
use crate::policy::TerminationPolicy;
use crate::spin::AdaptiveWait;
use crate::wait_queue::{NativeWaitQueue, WaitQueue};

/// Everything a lock needs from its environment.
pub trait Platform: Send + Sync {
    /// Wait queue backend.
    type Queue: WaitQueue;

    /// The wait queue all blocking goes through.
    fn wait_queue(&self) -> &Self::Queue;

    /// Id of the calling thread.
    fn current_thread(&self) -> ThreadId;

    /// Spin policy for slow paths.
    fn adaptive_wait(&self) -> AdaptiveWait;

    /// How protocol violations are handled.
    fn termination(&self) -> &TerminationPolicy;
}

/// A self-contained runtime: queue, identity, spin bound, policy.
#[derive(Debug, Default)]
pub struct Runtime<Q, I = OsThreadIdentity> {
    queue: Q,
    identity: I,
    spin: SpinConfig,
    termination: TerminationPolicy,
}

impl<Q: WaitQueue> Runtime<Q> {
    /// Runtime over `queue` with OS thread ids and default spinning.
    #[must_use]
    pub fn new(queue: Q) -> Self {
        Self::with_identity(queue, OsThreadIdentity)
    }
}

impl<Q: WaitQueue, I: ThreadIdentity> Runtime<Q, I> {
    /// Runtime with an explicit identity source.
    #[must_use]
    pub fn with_identity(queue: Q, identity: I) -> Self {
        Self {
            queue,
            identity,
            spin: SpinConfig::default(),
            termination: TerminationPolicy::new(),
        }
    }

    /// Replaces the spin bound.
    #[must_use]
    pub fn with_spin(mut self, spin: SpinConfig) -> Self {
        self.spin = spin;
        self
    }

    /// Wraps the runtime for sharing between locks.
    #[must_use]
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// The wait queue.
    #[must_use]
    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// The identity source.
    #[must_use]
    pub fn identity(&self) -> &I {
        &self.identity
    }

    /// This runtime's private termination policy.
    #[must_use]
    pub fn termination(&self) -> &TerminationPolicy {
        &self.termination
    }
}

impl<Q: WaitQueue, I: ThreadIdentity> Platform for Arc<Runtime<Q, I>> {
    type Queue = Q;

    #[inline]
    fn wait_queue(&self) -> &Q {
        &self.queue
    }

    #[inline]
    fn current_thread(&self) -> ThreadId {
        self.identity.current()
    }

    #[inline]
    fn adaptive_wait(&self) -> AdaptiveWait {
        AdaptiveWait::new(self.spin)
    }

    #[inline]
    fn termination(&self) -> &TerminationPolicy {
        &self.termination
    }
}

/// The process-wide runtime behind [`NativePlatform`].
struct NativeRuntime {
    queue: NativeWaitQueue,
    spin: SpinConfig,
}

static NATIVE_RUNTIME: OnceLock<NativeRuntime> = OnceLock::new();

fn native_runtime() -> &'static NativeRuntime {
    NATIVE_RUNTIME.get_or_init(|| NativeRuntime {
        queue: NativeWaitQueue::default(),
        spin: SpinConfig::default(),
    })
}

/// Installs the process-wide runtime from `config`.
///
/// Must run before the first lock operation; the first [`NativePlatform`]
/// use installs the defaults.
///
/// # Errors
///
/// - [`ConfigError::UnsupportedBackend`] if the backend is unavailable here.
/// - [`ConfigError::AlreadyInstalled`] if a runtime is already in place.
pub fn install(config: &SyncConfig) -> ConfigResult<()> {
    let queue = NativeWaitQueue::for_backend(config.backend)?;
    NATIVE_RUNTIME
        .set(NativeRuntime {
            queue,
            spin: config.spin,
        })
        .map_err(|_| ConfigError::AlreadyInstalled)?;
    tracing::debug!(
        backend = config.backend.name(),
        spin_rounds = config.spin.rounds,
        "synchronization runtime installed"
    );
    Ok(())
}

/// Handle to the process-wide runtime. Zero-sized, so it costs nothing to
/// embed in every lock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NativePlatform;

impl Platform for NativePlatform {
    type Queue = NativeWaitQueue;

    #[inline]
    fn wait_queue(&self) -> &NativeWaitQueue {
        &native_runtime().queue
    }

    #[inline]
    fn current_thread(&self) -> ThreadId {
        OsThreadIdentity.current()
    }

    #[inline]
    fn adaptive_wait(&self) -> AdaptiveWait {
        AdaptiveWait::new(native_runtime().spin)
    }

    #[inline]
    fn termination(&self) -> &TerminationPolicy {
        TerminationPolicy::global()
    }
}
