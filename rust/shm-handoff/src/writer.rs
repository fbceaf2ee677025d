//! Writer side of the handoff.
//!
//! ```text
//!   Start ──publish HANDSHAKE──▶ AwaitHandshakeAck
//!     AwaitHandshakeAck ──ack──▶ stage chunk 0 ──publish PAYLOAD──▶ AwaitChunkAck(0)
//!     AwaitChunkAck(i)  ──ack──▶ stage chunk i+1 … or Done
//!   any timeout ──▶ Done(Err)
//! ```
//!
//! Once the handshake is published the writer holds a [`ReleaseGuard`]; it is
//! dropped on every exit (success, timeout, or the writer itself being
//! dropped mid-transfer) and resets the semaphore to `READY`.

use std::time::Duration;

use bytes::Bytes;

use crate::config::TransferConfig;
use crate::drain::{Action, Transfer};
use crate::error::TransferError;
use crate::layout::{self, ChunkFields, HandshakeFields, Header, SEMAPHORE_WORD, Semaphore};
use crate::region::Region;
use crate::wait::{WaitOutcome, WaitRequest};

/// How a payload is cut into chunks for a given payload area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    total_size: usize,
    chunk_capacity: usize,
    total_chunks: usize,
}

impl ChunkPlan {
    /// # Panics
    ///
    /// Panics if `chunk_capacity` is zero.
    pub fn new(total_size: usize, chunk_capacity: usize) -> Self {
        assert!(chunk_capacity > 0, "chunk capacity must be non-zero");
        Self {
            total_size,
            chunk_capacity,
            total_chunks: total_size.div_ceil(chunk_capacity),
        }
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn chunk_capacity(&self) -> usize {
        self.chunk_capacity
    }

    pub fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    /// Byte range `(offset, size)` of chunk `index`.
    pub fn chunk(&self, index: usize) -> Option<(usize, usize)> {
        if index >= self.total_chunks {
            return None;
        }
        let offset = index * self.chunk_capacity;
        let size = self.chunk_capacity.min(self.total_size - offset);
        Some((offset, size))
    }

    /// All chunks as `(index, offset, size)`.
    pub fn chunks(&self) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        (0..self.total_chunks).filter_map(move |i| self.chunk(i).map(|(o, s)| (i, o, s)))
    }
}

/// Resets the semaphore to `READY` (and wakes the peer) when dropped.
struct ReleaseGuard {
    region: Region,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        // SAFETY: only armed after the writer validated the region.
        unsafe { self.region.header_unchecked() }.publish(Semaphore::Ready);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Start,
    AwaitHandshakeAck,
    AwaitChunkAck { index: usize },
    Done,
}

/// Writer state machine.
///
/// Drive it with [`drain_blocking`](crate::drain_blocking) or
/// [`drain_async`](crate::drain_async), or step it by hand through
/// [`Transfer::next_action`].
pub struct Writer {
    region: Region,
    payload: Bytes,
    plan: ChunkPlan,
    timeout: Duration,
    state: WriterState,
    release: Option<ReleaseGuard>,
}

impl Writer {
    /// Validate the region and payload. Nothing is written yet.
    pub fn new(
        region: Region,
        payload: impl Into<Bytes>,
        config: &TransferConfig,
    ) -> Result<Self, TransferError> {
        let layout = region.layout()?;
        let payload = payload.into();
        layout::check_payload_len(payload.len())?;

        let plan = ChunkPlan::new(payload.len(), layout.payload_capacity);
        Ok(Self {
            region,
            payload,
            plan,
            timeout: config.timeout,
            state: WriterState::Start,
            release: None,
        })
    }

    pub fn plan(&self) -> &ChunkPlan {
        &self.plan
    }

    pub fn is_finished(&self) -> bool {
        self.state == WriterState::Done
    }

    fn header(&self) -> &Header {
        // SAFETY: validated in Writer::new.
        unsafe { self.region.header_unchecked() }
    }

    fn wait_while(&self, state: Semaphore) -> WaitRequest {
        WaitRequest::new(self.region.clone(), SEMAPHORE_WORD, state, self.timeout)
    }

    /// Publish the handshake and arm the release guard.
    fn begin(&mut self) -> WaitRequest {
        // Both values fit: the payload length was checked against i32::MAX
        // and the chunk count never exceeds it.
        let fields = HandshakeFields {
            total_size: self.plan.total_size() as i32,
            total_chunks: self.plan.total_chunks() as i32,
        };
        tracing::debug!(
            total_size = fields.total_size,
            total_chunks = fields.total_chunks,
            chunk_capacity = self.plan.chunk_capacity(),
            "publishing handshake"
        );

        let header = self.header();
        header.write_handshake(fields);
        self.release = Some(ReleaseGuard {
            region: self.region.clone(),
        });
        self.header().publish(Semaphore::Handshake);

        self.state = WriterState::AwaitHandshakeAck;
        self.wait_while(Semaphore::Handshake)
    }

    /// Stage chunk `index`, or report completion when all chunks went out.
    fn stage(&mut self, index: usize) -> Option<WaitRequest> {
        let (offset, size) = self.plan.chunk(index)?;

        // SAFETY: the reader acknowledged the previous step, so the payload
        // area is ours; `size <= payload_capacity` by construction of the plan.
        unsafe {
            self.region
                .write_payload(&self.payload[offset..offset + size]);
        }
        self.header().write_chunk(ChunkFields {
            index: index as i32,
            offset: offset as i32,
            size: size as i32,
        });
        self.header().publish(Semaphore::Payload);
        tracing::trace!(index, offset, size, "staged chunk");

        self.state = WriterState::AwaitChunkAck { index };
        Some(self.wait_while(Semaphore::Payload))
    }

    fn advance(&mut self, outcome: Option<WaitOutcome>) -> Result<Option<WaitRequest>, TransferError> {
        match (self.state, outcome) {
            (WriterState::Start, _) => Ok(Some(self.begin())),

            (WriterState::AwaitHandshakeAck, None) => Ok(Some(self.wait_while(Semaphore::Handshake))),
            (WriterState::AwaitHandshakeAck, Some(WaitOutcome::TimedOut)) => {
                Err(TransferError::ReaderHandshakeTimeout)
            }
            (WriterState::AwaitHandshakeAck, Some(WaitOutcome::Changed)) => {
                self.note_ack(Semaphore::Handshake);
                Ok(self.stage(0))
            }

            (WriterState::AwaitChunkAck { .. }, None) => Ok(Some(self.wait_while(Semaphore::Payload))),
            (WriterState::AwaitChunkAck { index }, Some(WaitOutcome::TimedOut)) => {
                Err(TransferError::ReaderChunkTimeout {
                    index,
                    last: self.plan.total_chunks() - 1,
                })
            }
            (WriterState::AwaitChunkAck { index }, Some(WaitOutcome::Changed)) => {
                self.note_ack(Semaphore::Payload);
                Ok(self.stage(index + 1))
            }

            (WriterState::Done, _) => Err(TransferError::Finished),
        }
    }

    /// The reader only ever acknowledges with `READY`; anything else is
    /// logged but not fatal on this side.
    fn note_ack(&self, waited_on: Semaphore) {
        let found = self.header().semaphore();
        if found != Semaphore::Ready.as_i32() {
            tracing::warn!(
                waited_on = %waited_on,
                found = Semaphore::describe(found),
                "unexpected acknowledgement value"
            );
        }
    }

    /// Terminal transition: drop the guard, which resets the semaphore.
    fn finish(&mut self) {
        self.state = WriterState::Done;
        self.release.take();
    }
}

impl Transfer for Writer {
    type Output = ();

    fn next_action(&mut self, outcome: Option<WaitOutcome>) -> Action<()> {
        if self.state == WriterState::Done {
            return Action::Done(Err(TransferError::Finished));
        }
        match self.advance(outcome) {
            Ok(Some(request)) => Action::Wait(request),
            Ok(None) => {
                tracing::debug!(
                    total_size = self.plan.total_size(),
                    total_chunks = self.plan.total_chunks(),
                    "payload delivered"
                );
                self.finish();
                Action::Done(Ok(()))
            }
            Err(e) => {
                tracing::warn!(error = %e, "write aborted");
                self.finish();
                Action::Done(Err(e))
            }
        }
    }
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("region", &self.region)
            .field("plan", &self.plan)
            .field("timeout", &self.timeout)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{HEADER_SIZE, HeaderView, LayoutError};
    use crate::region::HeapRegion;

    fn region(len: usize) -> (HeapRegion, Region) {
        let owner = HeapRegion::new_zeroed(len);
        let region = owner.region();
        (owner, region)
    }

    fn expect_wait<T: std::fmt::Debug>(action: Action<T>) -> WaitRequest {
        match action {
            Action::Wait(request) => request,
            Action::Done(result) => panic!("expected a wait, got {:?}", result),
        }
    }

    fn expect_done<T: std::fmt::Debug>(action: Action<T>) -> Result<T, TransferError> {
        match action {
            Action::Done(result) => result,
            Action::Wait(request) => panic!("expected completion, got {:?}", request),
        }
    }

    #[test]
    fn test_chunk_counts() {
        let p = 1008;
        assert_eq!(ChunkPlan::new(0, p).total_chunks(), 0);
        assert_eq!(ChunkPlan::new(1, p).total_chunks(), 1);
        assert_eq!(ChunkPlan::new(p - 1, p).total_chunks(), 1);
        assert_eq!(ChunkPlan::new(p, p).total_chunks(), 1);
        assert_eq!(ChunkPlan::new(p + 1, p).total_chunks(), 2);
        assert_eq!(ChunkPlan::new(2 * p + 1, p).total_chunks(), 3);
        assert_eq!(ChunkPlan::new(5 * p + 3, p).total_chunks(), 6);
    }

    #[test]
    fn test_chunk_ranges() {
        let plan = ChunkPlan::new(2 * 1008 + 1, 1008);
        let chunks: Vec<_> = plan.chunks().collect();
        assert_eq!(chunks, vec![(0, 0, 1008), (1, 1008, 1008), (2, 2016, 1)]);
        assert_eq!(plan.chunk(3), None);
    }

    #[test]
    fn test_small_payload_single_chunk() {
        let (_owner, region) = region(1024);
        let mut writer = Writer::new(region.clone(), &b"hello"[..], &TransferConfig::default()).unwrap();
        assert_eq!(writer.plan().chunk_capacity(), 1024 - HEADER_SIZE);
        assert_eq!(writer.plan().total_chunks(), 1);

        let request = expect_wait(writer.next_action(None));
        assert_eq!(request.expected(), Semaphore::Handshake.as_i32());
        let header = region.header().unwrap();
        assert_eq!(
            header.view(),
            HeaderView::Handshake(HandshakeFields {
                total_size: 5,
                total_chunks: 1
            })
        );

        // Reader acknowledges.
        header.publish(Semaphore::Ready);
        let request = expect_wait(writer.next_action(Some(WaitOutcome::Changed)));
        assert_eq!(request.expected(), Semaphore::Payload.as_i32());
        assert_eq!(
            header.view(),
            HeaderView::Payload(ChunkFields {
                index: 0,
                offset: 0,
                size: 5
            })
        );
        let mut staged = [0u8; 5];
        unsafe { region.read_payload(&mut staged) };
        assert_eq!(&staged, b"hello");

        header.publish(Semaphore::Ready);
        assert_eq!(expect_done(writer.next_action(Some(WaitOutcome::Changed))), Ok(()));
        assert!(writer.is_finished());
        assert_eq!(header.semaphore(), Semaphore::Ready.as_i32());
    }

    #[test]
    fn test_empty_payload_has_no_chunks() {
        let (_owner, region) = region(64);
        let mut writer = Writer::new(region.clone(), Bytes::new(), &TransferConfig::default()).unwrap();
        expect_wait(writer.next_action(None));
        assert_eq!(
            region.header().unwrap().view(),
            HeaderView::Handshake(HandshakeFields {
                total_size: 0,
                total_chunks: 0
            })
        );
        region.header().unwrap().publish(Semaphore::Ready);
        assert_eq!(expect_done(writer.next_action(Some(WaitOutcome::Changed))), Ok(()));
    }

    #[test]
    fn test_handshake_timeout_resets_semaphore() {
        let (_owner, region) = region(64);
        let mut writer = Writer::new(region.clone(), &b"abc"[..], &TransferConfig::default()).unwrap();
        expect_wait(writer.next_action(None));
        assert_eq!(region.header().unwrap().semaphore(), Semaphore::Handshake.as_i32());

        assert_eq!(
            expect_done(writer.next_action(Some(WaitOutcome::TimedOut))),
            Err(TransferError::ReaderHandshakeTimeout)
        );
        assert_eq!(region.header().unwrap().semaphore(), Semaphore::Ready.as_i32());
    }

    #[test]
    fn test_chunk_timeout_names_chunk() {
        // 48-byte payload area, 150 bytes: 4 chunks.
        let (_owner, region) = region(64);
        let mut writer = Writer::new(region.clone(), vec![1u8; 150], &TransferConfig::default()).unwrap();
        expect_wait(writer.next_action(None));
        expect_wait(writer.next_action(Some(WaitOutcome::Changed)));
        expect_wait(writer.next_action(Some(WaitOutcome::Changed)));
        assert_eq!(
            region.header().unwrap().view(),
            HeaderView::Payload(ChunkFields {
                index: 1,
                offset: 48,
                size: 48
            })
        );

        let err = expect_done(writer.next_action(Some(WaitOutcome::TimedOut))).unwrap_err();
        assert_eq!(err, TransferError::ReaderChunkTimeout { index: 1, last: 3 });
        assert_eq!(err.to_string(), "reader timeout on chunk 1/3");
        assert_eq!(region.header().unwrap().semaphore(), Semaphore::Ready.as_i32());
    }

    #[test]
    fn test_none_reissues_pending_wait() {
        let (_owner, region) = region(64);
        let mut writer = Writer::new(region.clone(), &b"abc"[..], &TransferConfig::default()).unwrap();
        expect_wait(writer.next_action(None));
        let again = expect_wait(writer.next_action(None));
        assert_eq!(again.expected(), Semaphore::Handshake.as_i32());
        assert_eq!(region.header().unwrap().semaphore(), Semaphore::Handshake.as_i32());
    }

    #[test]
    fn test_finished_writer_stays_finished() {
        let (_owner, region) = region(64);
        let mut writer = Writer::new(region.clone(), &b"abc"[..], &TransferConfig::default()).unwrap();
        expect_wait(writer.next_action(None));
        let _ = expect_done(writer.next_action(Some(WaitOutcome::TimedOut)));

        // A later transfer on the same region must not be disturbed.
        region.header().unwrap().publish(Semaphore::Handshake);
        assert_eq!(
            expect_done(writer.next_action(Some(WaitOutcome::Changed))),
            Err(TransferError::Finished)
        );
        assert_eq!(region.header().unwrap().semaphore(), Semaphore::Handshake.as_i32());
    }

    #[test]
    fn test_drop_mid_transfer_resets_semaphore() {
        let (_owner, region) = region(64);
        let mut writer = Writer::new(region.clone(), vec![9u8; 100], &TransferConfig::default()).unwrap();
        expect_wait(writer.next_action(None));
        expect_wait(writer.next_action(Some(WaitOutcome::Changed)));
        assert_eq!(region.header().unwrap().semaphore(), Semaphore::Payload.as_i32());

        drop(writer);
        assert_eq!(region.header().unwrap().semaphore(), Semaphore::Ready.as_i32());
    }

    #[test]
    fn test_unstarted_writer_leaves_region_alone() {
        let (_owner, region) = region(64);
        region.header().unwrap().publish(Semaphore::Payload);
        let writer = Writer::new(region.clone(), &b"abc"[..], &TransferConfig::default()).unwrap();
        drop(writer);
        assert_eq!(region.header().unwrap().semaphore(), Semaphore::Payload.as_i32());
    }

    #[test]
    fn test_rejects_bad_regions() {
        for len in [18, 30] {
            let (_owner, region) = region(len);
            assert_eq!(
                Writer::new(region, &b"x"[..], &TransferConfig::default()).unwrap_err(),
                TransferError::Layout(LayoutError::SizeNotAligned { len })
            );
        }
        for len in [0, 8, 16] {
            let (_owner, region) = region(len);
            assert_eq!(
                Writer::new(region, &b"x"[..], &TransferConfig::default()).unwrap_err(),
                TransferError::Layout(LayoutError::TooSmall { len })
            );
        }
    }
}
