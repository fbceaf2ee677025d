//! Futex wait/wake on a shared `i32` word.
//!
//! On Linux these are raw `futex(2)` calls. The futexes are not
//! process-private, so the same word can be waited on from another process
//! that maps the region. Other targets fall back to polling with short sleeps,
//! and [`futex_signal`] is a no-op there.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

/// Result of a single futex wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutexResult {
    /// Woken by a signal (or spuriously).
    Woken,
    /// The word did not hold the expected value when the wait started.
    Mismatch,
    /// The timeout elapsed.
    TimedOut,
    /// Interrupted by a signal handler.
    Interrupted,
}

#[cfg(target_os = "linux")]
mod imp {
    use super::*;

    pub(super) fn wait(word: &AtomicI32, expected: i32, timeout: Option<Duration>) -> FutexResult {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |ts| ts as *const libc::timespec);

        // SAFETY: `word` is a live, aligned i32; FUTEX_WAIT only reads it.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAIT,
                expected,
                ts_ptr,
                std::ptr::null::<u32>(),
                0,
            )
        };

        if rc == 0 {
            return FutexResult::Woken;
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EAGAIN) => FutexResult::Mismatch,
            Some(libc::ETIMEDOUT) => FutexResult::TimedOut,
            Some(libc::EINTR) => FutexResult::Interrupted,
            other => {
                tracing::warn!(errno = ?other, "futex wait failed");
                FutexResult::Woken
            }
        }
    }

    pub(super) fn wake(word: &AtomicI32) -> usize {
        // SAFETY: `word` is a live, aligned i32.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAKE,
                i32::MAX,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0,
            )
        };
        if rc < 0 { 0 } else { rc as usize }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;

    const POLL_INTERVAL: Duration = Duration::from_micros(200);

    pub(super) fn wait(word: &AtomicI32, expected: i32, timeout: Option<Duration>) -> FutexResult {
        if word.load(Ordering::SeqCst) != expected {
            return FutexResult::Mismatch;
        }
        std::thread::yield_now();
        if word.load(Ordering::SeqCst) != expected {
            return FutexResult::Woken;
        }
        let nap = timeout.map_or(POLL_INTERVAL, |t| t.min(POLL_INTERVAL));
        std::thread::sleep(nap);
        if word.load(Ordering::SeqCst) != expected {
            FutexResult::Woken
        } else if timeout.is_some_and(|t| t <= POLL_INTERVAL) {
            FutexResult::TimedOut
        } else {
            FutexResult::Woken
        }
    }

    pub(super) fn wake(_word: &AtomicI32) -> usize {
        0
    }
}

/// One futex wait: sleep while `word == expected`, at most `timeout`.
///
/// May return early (spuriously, or on a signal). Use [`wait_while_equal`]
/// for a deadline-respecting loop.
pub fn futex_wait(word: &AtomicI32, expected: i32, timeout: Option<Duration>) -> FutexResult {
    imp::wait(word, expected, timeout)
}

/// Wake every waiter on `word`. Returns the number of woken waiters (always 0
/// on targets without futexes).
pub fn futex_signal(word: &AtomicI32) -> usize {
    imp::wake(word)
}

/// Block until `word` differs from `expected` or `timeout` elapses.
///
/// Returns `true` if the value changed, `false` on timeout. Spurious wakeups
/// and interrupts are absorbed.
pub fn wait_while_equal(word: &AtomicI32, expected: i32, timeout: Duration) -> bool {
    let deadline = Instant::now().checked_add(timeout);
    loop {
        if word.load(Ordering::SeqCst) != expected {
            return true;
        }
        let remaining = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                Some(deadline - now)
            }
            None => None,
        };
        match futex_wait(word, expected, remaining) {
            FutexResult::Woken | FutexResult::Mismatch | FutexResult::Interrupted => {}
            FutexResult::TimedOut => {
                return word.load(Ordering::SeqCst) != expected;
            }
        }
    }
}
