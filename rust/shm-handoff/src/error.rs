use std::fmt;

use crate::layout::{LayoutError, Semaphore};

/// Errors surfaced by a writer or reader.
///
/// Three families:
/// - setup: [`TransferError::Layout`], raised before any header access;
/// - timeouts: the peer did not move the semaphore before the wait deadline;
/// - integrity: the header holds a value the protocol does not allow at this
///   step (misbehaving peer or corrupted memory).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// The region or payload cannot host the protocol.
    Layout(LayoutError),

    /// Writer: the reader never acknowledged the handshake.
    ReaderHandshakeTimeout,
    /// Writer: the reader never acknowledged chunk `index` (of `0..=last`).
    ReaderChunkTimeout { index: usize, last: usize },
    /// Reader: no handshake arrived.
    HandshakeTimeout,
    /// Reader: the writer never staged chunk `index`.
    WriterChunkTimeout { index: usize },

    /// Reader: woke up for a handshake but the semaphore holds something else.
    InvalidHandshakeState { found: i32 },
    /// Reader: handshake totals are inconsistent with each other or the region.
    InvalidHandshakeValues { total_size: i32, total_chunks: i32 },
    /// Reader: woke up for a chunk but the semaphore holds something else.
    UnexpectedState { expected: Semaphore, found: i32 },
    /// Reader: chunk arrived out of order.
    ChunkIndexMismatch { received: i32, expected: usize },
    /// Reader: chunk offset/size fall outside the payload or the payload area.
    InvalidChunkMetadata { index: usize, offset: i32, size: i32 },

    /// The state machine already produced its terminal result.
    Finished,
}

impl TransferError {
    /// Whether the peer simply failed to respond in time.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ReaderHandshakeTimeout
                | Self::ReaderChunkTimeout { .. }
                | Self::HandshakeTimeout
                | Self::WriterChunkTimeout { .. }
        )
    }

    /// Whether the header contradicted the protocol.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::InvalidHandshakeState { .. }
                | Self::InvalidHandshakeValues { .. }
                | Self::UnexpectedState { .. }
                | Self::ChunkIndexMismatch { .. }
                | Self::InvalidChunkMetadata { .. }
        )
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Layout(e) => write!(f, "layout error: {}", e),
            Self::ReaderHandshakeTimeout => write!(f, "reader handshake timeout"),
            Self::ReaderChunkTimeout { index, last } => {
                write!(f, "reader timeout on chunk {}/{}", index, last)
            }
            Self::HandshakeTimeout => write!(f, "handshake timeout"),
            Self::WriterChunkTimeout { index } => {
                write!(f, "writer timeout waiting for chunk {}", index)
            }
            Self::InvalidHandshakeState { found } => write!(
                f,
                "invalid handshake state: {} ({})",
                Semaphore::describe(*found),
                found
            ),
            Self::InvalidHandshakeValues {
                total_size,
                total_chunks,
            } => write!(
                f,
                "invalid handshake values: total_size={} total_chunks={}",
                total_size, total_chunks
            ),
            Self::UnexpectedState { expected, found } => write!(
                f,
                "expected {} header, received {}",
                expected.name().to_ascii_lowercase(),
                Semaphore::describe(*found)
            ),
            Self::ChunkIndexMismatch { received, expected } => write!(
                f,
                "chunk integrity failure: received chunk {} expected {}",
                received, expected
            ),
            Self::InvalidChunkMetadata {
                index,
                offset,
                size,
            } => write!(
                f,
                "invalid chunk metadata for chunk {}: offset={} size={}",
                index, offset, size
            ),
            Self::Finished => write!(f, "transfer already finished"),
        }
    }
}

impl std::error::Error for TransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Layout(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LayoutError> for TransferError {
    fn from(e: LayoutError) -> Self {
        Self::Layout(e)
    }
}
