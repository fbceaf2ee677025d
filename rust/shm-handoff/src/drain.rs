//! Driving a transfer to completion.
//!
//! A [`Transfer`] is a resumable state machine: each call to
//! [`Transfer::next_action`] performs the stores and copies for one protocol
//! step and then either asks to wait or reports the result. The drains below
//! are the only places that actually block or suspend.

use bytes::Bytes;

use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::reader::Reader;
use crate::region::Region;
use crate::wait::{BlockingWait, FutexWait, WaitOutcome, WaitRequest};
use crate::writer::Writer;

#[cfg(feature = "tokio")]
use crate::wait::AsyncWait;

/// What a transfer needs next.
#[derive(Debug)]
pub enum Action<T> {
    /// Wait as described, then call `next_action` with the outcome.
    Wait(WaitRequest),
    /// The transfer is over.
    Done(Result<T, TransferError>),
}

/// One side of the protocol, as an explicit state machine.
pub trait Transfer {
    type Output;

    /// Advance one step.
    ///
    /// `outcome` is the result of the wait requested by the previous call
    /// (`None` on the first call). Passing `None` while a wait is pending
    /// re-issues the same request. After [`Action::Done`], further calls
    /// return `Done(Err(TransferError::Finished))`.
    fn next_action(&mut self, outcome: Option<WaitOutcome>) -> Action<Self::Output>;
}

/// Run a transfer to completion, blocking the current thread at each wait.
pub fn drain_blocking<T, W>(transfer: &mut T, waiter: &W) -> Result<T::Output, TransferError>
where
    T: Transfer,
    W: BlockingWait + ?Sized,
{
    let mut outcome = None;
    loop {
        match transfer.next_action(outcome) {
            Action::Wait(request) => outcome = Some(BlockingWait::wait(waiter, &request)),
            Action::Done(result) => return result,
        }
    }
}

/// Run a transfer to completion, yielding to the runtime at each wait.
#[cfg(feature = "tokio")]
pub async fn drain_async<T, W>(transfer: &mut T, waiter: &W) -> Result<T::Output, TransferError>
where
    T: Transfer,
    W: AsyncWait + ?Sized,
{
    let mut outcome = None;
    loop {
        match transfer.next_action(outcome) {
            Action::Wait(request) => outcome = Some(AsyncWait::wait(waiter, &request).await),
            Action::Done(result) => return result,
        }
    }
}

/// Write `payload` into `region`, blocking until the reader consumed it.
pub fn send(
    region: &Region,
    payload: impl Into<Bytes>,
    config: &TransferConfig,
) -> Result<(), TransferError> {
    let mut writer = Writer::new(region.clone(), payload, config)?;
    drain_blocking(&mut writer, &FutexWait)
}

/// Read one payload from `region`, blocking until it fully arrived.
pub fn recv(region: &Region, config: &TransferConfig) -> Result<Vec<u8>, TransferError> {
    let mut reader = Reader::new(region.clone(), config)?;
    drain_blocking(&mut reader, &FutexWait)
}

/// Async [`send`].
#[cfg(feature = "tokio")]
pub async fn send_async(
    region: &Region,
    payload: impl Into<Bytes>,
    config: &TransferConfig,
) -> Result<(), TransferError> {
    let mut writer = Writer::new(region.clone(), payload, config)?;
    drain_async(&mut writer, &FutexWait).await
}

/// Async [`recv`].
#[cfg(feature = "tokio")]
pub async fn recv_async(region: &Region, config: &TransferConfig) -> Result<Vec<u8>, TransferError> {
    let mut reader = Reader::new(region.clone(), config)?;
    drain_async(&mut reader, &FutexWait).await
}
