//! # KEYSTONE Core
//!
//! The pieces every KEYSTONE lock is assembled from:
//! - [`ThreadIdentity`]: who is asking, cached per thread, reset after `fork()`
//! - [`AdaptiveWait`]: a bounded spin before paying for a syscall
//! - [`WaitQueue`]: block on / wake / requeue by memory address
//! - [`TerminationPolicy`]: whether protocol violations kill the process
//! - [`Platform`]: the injection seam bundling all of the above
//!
//! ## Process-wide Hooks
//!
//! The embedding runtime owns three lifecycle duties:
//!
//! 1. Call [`install`] once at startup if the default backend is not wanted.
//! 2. Call [`post_fork`] in every child process right after `fork()`.
//! 3. Call [`suppress_termination_checks`] before force-terminating stuck
//!    daemon threads, so their abandoned locks do not abort teardown.
//!
//! ## Example
//!
//! ```rust,ignore
//! use keystone_core::{install, SyncConfig, WaitBackend};
//!
//! let config = SyncConfig::from_toml_str("backend = \"parking\"")?;
//! install(&config)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod error;
pub mod identity;
pub mod platform;
pub mod policy;
pub mod spin;
pub mod wait_queue;

pub use config::{SpinConfig, SyncConfig, WaitBackend};
pub use error::{ConfigError, ConfigResult, ProtocolViolation};
pub use identity::{post_fork, OsThreadIdentity, ThreadId, ThreadIdentity};
pub use platform::{install, NativePlatform, Platform, Runtime};
pub use policy::{are_termination_checks_suppressed, suppress_termination_checks, TerminationPolicy};
pub use spin::AdaptiveWait;
pub use wait_queue::{Deadline, NativeWaitQueue, ParkingWaitQueue, WaitOutcome, WaitQueue};

#[cfg(target_os = "linux")]
pub use wait_queue::FutexWaitQueue;
