//! The wait half of the wait/notify contract.
//!
//! State machines describe *what* to wait for with a [`WaitRequest`]; a
//! [`BlockingWait`] or [`AsyncWait`] implementation decides *how*. The notify
//! half lives on [`Header::publish`](crate::Header::publish), since a store is
//! always followed by a wake regardless of calling convention.

use std::future::Future;
use std::sync::atomic::AtomicI32;
use std::time::Duration;

use crate::futex;
use crate::layout::Semaphore;
use crate::region::Region;

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The word no longer holds the expected value.
    Changed,
    /// The timeout elapsed first.
    TimedOut,
}

/// A request to block until a header word leaves `expected`.
#[derive(Debug, Clone)]
pub struct WaitRequest {
    region: Region,
    word: usize,
    expected: i32,
    timeout: Duration,
}

impl WaitRequest {
    /// Only built by transfers, after they validated the region.
    pub(crate) fn new(region: Region, word: usize, expected: Semaphore, timeout: Duration) -> Self {
        Self {
            region,
            word,
            expected: expected.as_i32(),
            timeout,
        }
    }

    /// The region the word lives in.
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Index of the header word to watch.
    pub fn word_index(&self) -> usize {
        self.word
    }

    /// The word itself.
    pub fn word(&self) -> &AtomicI32 {
        // SAFETY: requests are only created for validated regions.
        unsafe { self.region.header_unchecked() }.word(self.word)
    }

    /// Value to wait away from.
    pub fn expected(&self) -> i32 {
        self.expected
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Blocking form of the wait primitive.
pub trait BlockingWait {
    fn wait(&self, request: &WaitRequest) -> WaitOutcome;
}

/// Suspending form of the wait primitive.
pub trait AsyncWait {
    fn wait(&self, request: &WaitRequest) -> impl Future<Output = WaitOutcome> + Send;
}

/// Futex-backed wait.
///
/// The async form runs the futex wait on tokio's blocking pool, so the calling
/// task yields instead of parking a runtime worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct FutexWait;

impl BlockingWait for FutexWait {
    fn wait(&self, request: &WaitRequest) -> WaitOutcome {
        if futex::wait_while_equal(request.word(), request.expected(), request.timeout()) {
            WaitOutcome::Changed
        } else {
            WaitOutcome::TimedOut
        }
    }
}

#[cfg(feature = "tokio")]
impl AsyncWait for FutexWait {
    fn wait(&self, request: &WaitRequest) -> impl Future<Output = WaitOutcome> + Send {
        let request = request.clone();
        async move {
            if request.word().load(std::sync::atomic::Ordering::SeqCst) != request.expected() {
                return WaitOutcome::Changed;
            }
            // The request owns a clone of the region, which keeps heap-backed
            // memory alive until the blocking wait returns.
            let waited = tokio::task::spawn_blocking(move || BlockingWait::wait(&FutexWait, &request));
            match waited.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(error = %e, "blocking futex wait did not complete");
                    WaitOutcome::TimedOut
                }
            }
        }
    }
}
