//! Reader side of the handoff.
//!
//! The reader trusts nothing it finds in the header: every wake-up is checked
//! against the phase it expects, handshake totals are checked against each
//! other and the payload area, and every chunk is checked for order and bounds
//! before a single byte is copied out.

use std::time::Duration;

use crate::config::TransferConfig;
use crate::drain::{Action, Transfer};
use crate::error::TransferError;
use crate::layout::{ChunkFields, HandshakeFields, Header, HeaderView, SEMAPHORE_WORD, Semaphore};
use crate::region::Region;
use crate::wait::{WaitOutcome, WaitRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    AwaitHandshake,
    AwaitChunk { index: usize },
    Done,
}

/// Reader state machine. Produces the reassembled payload.
pub struct Reader {
    region: Region,
    chunk_capacity: usize,
    timeout: Duration,
    state: ReaderState,
    total_chunks: usize,
    output: Vec<u8>,
}

impl Reader {
    /// Validate the region. Nothing is read or written yet.
    pub fn new(region: Region, config: &TransferConfig) -> Result<Self, TransferError> {
        let layout = region.layout()?;
        Ok(Self {
            region,
            chunk_capacity: layout.payload_capacity,
            timeout: config.timeout,
            state: ReaderState::AwaitHandshake,
            total_chunks: 0,
            output: Vec::new(),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.state == ReaderState::Done
    }

    fn header(&self) -> &Header {
        // SAFETY: validated in Reader::new.
        unsafe { self.region.header_unchecked() }
    }

    /// Wait for the writer to move the semaphore off `READY`.
    fn wait_for_writer(&self) -> WaitRequest {
        WaitRequest::new(self.region.clone(), SEMAPHORE_WORD, Semaphore::Ready, self.timeout)
    }

    /// Store `READY` and wake the writer.
    fn acknowledge(&self) {
        self.header().publish(Semaphore::Ready);
    }

    fn validate_handshake(&self, fields: HandshakeFields) -> Result<(usize, usize), TransferError> {
        let HandshakeFields {
            total_size,
            total_chunks,
        } = fields;
        let invalid = TransferError::InvalidHandshakeValues {
            total_size,
            total_chunks,
        };

        let (Ok(size), Ok(chunks)) = (usize::try_from(total_size), usize::try_from(total_chunks))
        else {
            return Err(invalid);
        };
        if size == 0 && chunks != 0 {
            return Err(invalid);
        }
        // u64: `chunks * capacity` can exceed usize on 32-bit targets.
        if size as u64 > chunks as u64 * self.chunk_capacity as u64 {
            return Err(invalid);
        }
        Ok((size, chunks))
    }

    fn on_handshake(&mut self) -> Result<Option<WaitRequest>, TransferError> {
        let fields = match self.header().view() {
            HeaderView::Handshake(fields) => fields,
            other => {
                return Err(TransferError::InvalidHandshakeState {
                    found: other.raw_semaphore(),
                });
            }
        };
        let (total_size, total_chunks) = self.validate_handshake(fields)?;
        tracing::debug!(total_size, total_chunks, "accepted handshake");

        self.output = vec![0u8; total_size];
        self.total_chunks = total_chunks;
        self.acknowledge();

        if total_chunks == 0 {
            return Ok(None);
        }
        self.state = ReaderState::AwaitChunk { index: 0 };
        Ok(Some(self.wait_for_writer()))
    }

    fn validate_chunk(&self, index: usize, chunk: ChunkFields) -> Result<(usize, usize), TransferError> {
        if usize::try_from(chunk.index).ok() != Some(index) {
            return Err(TransferError::ChunkIndexMismatch {
                received: chunk.index,
                expected: index,
            });
        }

        let invalid = TransferError::InvalidChunkMetadata {
            index,
            offset: chunk.offset,
            size: chunk.size,
        };
        let (Ok(offset), Ok(size)) = (usize::try_from(chunk.offset), usize::try_from(chunk.size))
        else {
            return Err(invalid);
        };
        if size == 0 || size > self.chunk_capacity {
            return Err(invalid);
        }
        match offset.checked_add(size) {
            Some(end) if end <= self.output.len() => Ok((offset, size)),
            _ => Err(invalid),
        }
    }

    fn on_chunk(&mut self, index: usize) -> Result<Option<WaitRequest>, TransferError> {
        let chunk = match self.header().view() {
            HeaderView::Payload(chunk) => chunk,
            other => {
                return Err(TransferError::UnexpectedState {
                    expected: Semaphore::Payload,
                    found: other.raw_semaphore(),
                });
            }
        };
        let (offset, size) = self.validate_chunk(index, chunk)?;

        // SAFETY: the writer published PAYLOAD after filling the area and does
        // not touch it again until we acknowledge; `size <= chunk_capacity`.
        unsafe {
            self.region
                .read_payload(&mut self.output[offset..offset + size]);
        }
        tracing::trace!(index, offset, size, "consumed chunk");
        self.acknowledge();

        let next = index + 1;
        if next == self.total_chunks {
            return Ok(None);
        }
        self.state = ReaderState::AwaitChunk { index: next };
        Ok(Some(self.wait_for_writer()))
    }

    fn advance(&mut self, outcome: Option<WaitOutcome>) -> Result<Option<WaitRequest>, TransferError> {
        match (self.state, outcome) {
            (ReaderState::Done, _) => Err(TransferError::Finished),
            (_, None) => Ok(Some(self.wait_for_writer())),

            (ReaderState::AwaitHandshake, Some(WaitOutcome::TimedOut)) => {
                Err(TransferError::HandshakeTimeout)
            }
            (ReaderState::AwaitHandshake, Some(WaitOutcome::Changed)) => self.on_handshake(),

            (ReaderState::AwaitChunk { index }, Some(WaitOutcome::TimedOut)) => {
                Err(TransferError::WriterChunkTimeout { index })
            }
            (ReaderState::AwaitChunk { index }, Some(WaitOutcome::Changed)) => self.on_chunk(index),
        }
    }
}

impl Transfer for Reader {
    type Output = Vec<u8>;

    fn next_action(&mut self, outcome: Option<WaitOutcome>) -> Action<Vec<u8>> {
        if self.state == ReaderState::Done {
            return Action::Done(Err(TransferError::Finished));
        }
        match self.advance(outcome) {
            Ok(Some(request)) => Action::Wait(request),
            Ok(None) => {
                self.state = ReaderState::Done;
                tracing::debug!(
                    total_size = self.output.len(),
                    total_chunks = self.total_chunks,
                    "payload received"
                );
                Action::Done(Ok(std::mem::take(&mut self.output)))
            }
            Err(e) => {
                self.state = ReaderState::Done;
                if e.is_protocol_violation() {
                    tracing::warn!(error = %e, "protocol violation");
                } else {
                    tracing::warn!(error = %e, "read aborted");
                }
                Action::Done(Err(e))
            }
        }
    }
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("region", &self.region)
            .field("chunk_capacity", &self.chunk_capacity)
            .field("timeout", &self.timeout)
            .field("state", &self.state)
            .field("total_chunks", &self.total_chunks)
            .finish()
    }
}
