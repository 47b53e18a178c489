//! # Lock Torture
//!
//! Stress harness for the KEYSTONE locks on the process-wide runtime.
//!
//! ```text
//! lock_torture [config.toml]
//! ```
//!
//! Installs the runtime from the given TOML file (defaults otherwise), then
//! hammers a mutex, a condition variable and a reader/writer lock, checking
//! the invariants each one guarantees. Exits non-zero on any failure.

use std::process::ExitCode;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use keystone_core::{ConfigResult, Platform, SyncConfig};
use keystone_sync::{install, ConditionVariable, Mutex, NativePlatform, ReadWriteLock};

/// Torture parameters.
struct TortureConfig {
    /// Worker threads per phase.
    threads: usize,
    /// Lock cycles per worker.
    iterations: u64,
    /// Condition variable hand-offs per worker pair.
    handoffs: u32,
}

impl Default for TortureConfig {
    fn default() -> Self {
        Self {
            threads: 8,
            iterations: 200_000,
            handoffs: 20_000,
        }
    }
}

/// Outcome of one phase.
struct PhaseReport {
    name: &'static str,
    operations: u64,
    elapsed: Duration,
    passed: bool,
}

impl PhaseReport {
    fn print(&self) {
        let rate = self.operations as f64 / self.elapsed.as_secs_f64().max(f64::EPSILON);
        println!(
            "│ {:<18} {:>12} ops {:>10.2?} {:>14.0} ops/s  {} │",
            self.name,
            self.operations,
            self.elapsed,
            rate,
            if self.passed { "PASS" } else { "FAIL" }
        );
    }
}

fn load_config() -> ConfigResult<SyncConfig> {
    match std::env::args().nth(1) {
        Some(path) => SyncConfig::load(path),
        None => Ok(SyncConfig::default()),
    }
}

/// Load/store increments under the mutex; overlap loses updates.
fn mutex_phase(config: &TortureConfig) -> PhaseReport {
    let mutex = Mutex::new();
    let counter = AtomicU64::new(0);
    let start = Instant::now();

    thread::scope(|s| {
        for _ in 0..config.threads {
            s.spawn(|| {
                for _ in 0..config.iterations {
                    mutex.lock();
                    let value = counter.load(Ordering::Relaxed);
                    counter.store(value + 1, Ordering::Relaxed);
                    mutex.unlock();
                }
            });
        }
    });

    let expected = config.threads as u64 * config.iterations;
    PhaseReport {
        name: "mutex",
        operations: expected,
        elapsed: start.elapsed(),
        passed: counter.load(Ordering::Relaxed) == expected && mutex.waiter_count() == 0,
    }
}

/// Pairs of threads alternate turns through one condition variable.
fn condvar_phase(config: &TortureConfig) -> PhaseReport {
    let mutex = Mutex::new();
    let condvar = ConditionVariable::new();
    let turn = AtomicU32::new(0);
    let start = Instant::now();

    thread::scope(|s| {
        for parity in 0..2 {
            let (mutex, condvar, turn) = (&mutex, &condvar, &turn);
            s.spawn(move || {
                for _ in 0..config.handoffs {
                    mutex.lock();
                    while turn.load(Ordering::Relaxed) % 2 != parity {
                        condvar.wait(mutex);
                    }
                    turn.fetch_add(1, Ordering::Relaxed);
                    condvar.signal();
                    mutex.unlock();
                }
            });
        }
    });

    PhaseReport {
        name: "condvar hand-off",
        operations: u64::from(2 * config.handoffs),
        elapsed: start.elapsed(),
        passed: turn.load(Ordering::Relaxed) == 2 * config.handoffs && condvar.waiter_count() == 0,
    }
}

/// Writers keep `left + right == 0`; readers verify it.
fn rwlock_phase(config: &TortureConfig) -> PhaseReport {
    let lock = ReadWriteLock::new();
    let left = AtomicI64::new(0);
    let right = AtomicI64::new(0);
    let torn = AtomicU64::new(0);
    let start = Instant::now();

    thread::scope(|s| {
        for worker in 0..config.threads {
            let (lock, left, right, torn) = (&lock, &left, &right, &torn);
            s.spawn(move || {
                for _ in 0..config.iterations / 4 {
                    if worker % 4 == 0 {
                        let _guard = lock.write();
                        let value = left.load(Ordering::Relaxed) + 1;
                        left.store(value, Ordering::Relaxed);
                        right.store(-value, Ordering::Relaxed);
                    } else {
                        let _guard = lock.read();
                        if left.load(Ordering::Relaxed) + right.load(Ordering::Relaxed) != 0 {
                            torn.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            });
        }
    });

    PhaseReport {
        name: "rwlock mixed",
        operations: config.threads as u64 * (config.iterations / 4),
        elapsed: start.elapsed(),
        passed: torn.load(Ordering::Relaxed) == 0 && lock.waiter_count() == 0,
    }
}

fn main() -> ExitCode {
    let sync_config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("lock_torture: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = install(&sync_config) {
        eprintln!("lock_torture: {err}");
        return ExitCode::FAILURE;
    }
    let config = TortureConfig::default();
    let backend = NativePlatform.wait_queue().backend().name();

    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║                  KEYSTONE LOCK TORTURE                           ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!();
    println!("Configuration:");
    println!("  Backend:       {backend}");
    println!("  Spin rounds:   {}", sync_config.spin.rounds);
    println!("  Threads:       {}", config.threads);
    println!("  Iterations:    {}", config.iterations);
    println!("  Hand-offs:     {}", config.handoffs);
    println!();

    let reports = [
        mutex_phase(&config),
        condvar_phase(&config),
        rwlock_phase(&config),
    ];

    println!("┌─ Results ────────────────────────────────────────────────────────────────┐");
    for report in &reports {
        report.print();
    }
    println!("└──────────────────────────────────────────────────────────────────────────┘");

    if reports.iter().all(|r| r.passed) {
        println!("All invariants held.");
        ExitCode::SUCCESS
    } else {
        println!("INVARIANT VIOLATED.");
        ExitCode::FAILURE
    }
}
