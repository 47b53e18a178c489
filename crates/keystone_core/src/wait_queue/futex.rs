//! # Futex Backend
//!
//! Thin wrapper over Linux `futex(2)`. Every operation carries
//! `FUTEX_PRIVATE_FLAG`: cross-process locking is not supported, and private
//! futexes skip the kernel's shared-mapping lookup.
//!
//! | Operation | futex op                                             |
//! |-----------|------------------------------------------------------|
//! | wait      | `FUTEX_WAIT` (relative) / `FUTEX_WAIT_BITSET` + `FUTEX_CLOCK_REALTIME` (absolute) |
//! | wake      | `FUTEX_WAKE`                                         |
//! | requeue   | `FUTEX_REQUEUE`, wake 0, move `count`                |

#![allow(unsafe_code)]

use std::ptr;
use std::sync::atomic::AtomicU32;
use std::time::{Duration, UNIX_EPOCH};

use super::{Deadline, WaitOutcome, WaitQueue};

/// `FUTEX_WAIT_BITSET` mask matching every waker.
const FUTEX_BITSET_MATCH_ANY: u32 = 0xFFFF_FFFF;

/// The kernel takes counts as `int`.
const MAX_COUNT: u32 = i32::MAX as u32;

/// Linux futex wait queue. Stateless: the kernel owns the queues.
#[derive(Clone, Copy, Debug, Default)]
pub struct FutexWaitQueue;

fn timespec_from(span: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: libc::time_t::try_from(span.as_secs()).unwrap_or(libc::time_t::MAX),
        // Always < 1e9.
        tv_nsec: span.subsec_nanos() as libc::c_long,
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

impl WaitQueue for FutexWaitQueue {
    fn wait(&self, word: &AtomicU32, expected: u32, deadline: Option<Deadline>) -> WaitOutcome {
        let (op, timeout) = match deadline {
            None => (libc::FUTEX_WAIT, None),
            Some(Deadline::After(span)) => (libc::FUTEX_WAIT, Some(timespec_from(span))),
            Some(Deadline::At(at)) => {
                // Before the epoch clamps to the epoch, which has long passed.
                let since_epoch = at.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
                (
                    libc::FUTEX_WAIT_BITSET | libc::FUTEX_CLOCK_REALTIME,
                    Some(timespec_from(since_epoch)),
                )
            }
        };
        let timeout_ptr = timeout
            .as_ref()
            .map_or(ptr::null(), |ts| ts as *const libc::timespec);

        // SAFETY: `word` is a live, aligned u32 for the duration of the call;
        // `timeout_ptr` is null or points at a timespec on this stack frame.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                op | libc::FUTEX_PRIVATE_FLAG,
                expected,
                timeout_ptr,
                ptr::null::<u32>(),
                FUTEX_BITSET_MATCH_ANY,
            )
        };
        if rc == 0 {
            return WaitOutcome::Woken;
        }
        match last_errno() {
            libc::ETIMEDOUT => WaitOutcome::TimedOut,
            // Word already changed, or a signal arrived.
            libc::EAGAIN | libc::EINTR => WaitOutcome::Spurious,
            errno => {
                tracing::warn!(errno, "unexpected futex wait failure");
                WaitOutcome::Spurious
            }
        }
    }

    fn wake(&self, word: &AtomicU32, count: u32) -> usize {
        // SAFETY: `word` is a live, aligned u32.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                count.min(MAX_COUNT),
            )
        };
        if rc < 0 {
            tracing::warn!(errno = last_errno(), "unexpected futex wake failure");
            return 0;
        }
        usize::try_from(rc).unwrap_or(0)
    }

    fn requeue(&self, from: &AtomicU32, count: u32, to: &AtomicU32) -> usize {
        // FUTEX_REQUEUE reads the requeue limit from the timeout slot.
        let limit = count.min(MAX_COUNT) as usize;
        // SAFETY: both words are live, aligned u32s.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                from.as_ptr(),
                libc::FUTEX_REQUEUE | libc::FUTEX_PRIVATE_FLAG,
                0u32,
                limit,
                to.as_ptr(),
            )
        };
        if rc < 0 {
            tracing::warn!(errno = last_errno(), "unexpected futex requeue failure");
            return 0;
        }
        usize::try_from(rc).unwrap_or(0)
    }
}
