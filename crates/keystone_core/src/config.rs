//! # Runtime Configuration
//!
//! Loaded once at startup, before any lock is contended. Example:
//!
//! ```toml
//! backend = "futex"
//!
//! [spin]
//! rounds = 8
//! ```

use serde::Deserialize;
use std::path::Path;

use crate::error::ConfigResult;

/// Which [`crate::WaitQueue`] implementation backs the process-wide platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitBackend {
    /// Linux `futex(2)`.
    Futex,
    /// Portable emulation on `parking_lot` mutex/condvar buckets.
    Parking,
}

impl WaitBackend {
    /// Name used in config files and diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Futex => "futex",
            Self::Parking => "parking",
        }
    }

    /// The native choice for this target.
    #[must_use]
    pub const fn native() -> Self {
        if cfg!(target_os = "linux") {
            Self::Futex
        } else {
            Self::Parking
        }
    }
}

impl Default for WaitBackend {
    fn default() -> Self {
        Self::native()
    }
}

/// Bound on the spin phase that runs before every blocking wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SpinConfig {
    /// Backoff rounds before falling back to the wait queue. Each round
    /// spins twice as long as the previous one, later rounds yield the CPU.
    /// Zero disables spinning.
    pub rounds: u32,
}

impl SpinConfig {
    /// Default bound: enough to ride out a short critical section.
    pub const DEFAULT_ROUNDS: u32 = 12;

    /// Never spin; go straight to the wait queue.
    #[must_use]
    pub const fn disabled() -> Self {
        Self { rounds: 0 }
    }

    /// Short bound for oversubscribed hosts where spinning steals CPU from
    /// the lock holder.
    #[must_use]
    pub const fn oversubscribed() -> Self {
        Self { rounds: 4 }
    }
}

impl Default for SpinConfig {
    fn default() -> Self {
        Self {
            rounds: Self::DEFAULT_ROUNDS,
        }
    }
}

/// Process-wide synchronization settings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Wait queue backend.
    pub backend: WaitBackend,
    /// Spin bound.
    pub spin: SpinConfig,
}

impl SyncConfig {
    /// Portable config: parking emulation on every target.
    #[must_use]
    pub const fn portable() -> Self {
        Self {
            backend: WaitBackend::Parking,
            spin: SpinConfig {
                rounds: SpinConfig::DEFAULT_ROUNDS,
            },
        }
    }

    /// Parses a TOML document. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ConfigError::Parse`] on malformed input.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ConfigError::Io`] if the file cannot be read and
    /// [`crate::ConfigError::Parse`] on malformed input.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}
