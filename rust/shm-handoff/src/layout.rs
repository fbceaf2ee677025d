//! Region layout definitions.
//!
//! A region is a header of four `i32` control words followed by the payload
//! area. The three words after the semaphore are overloaded: their meaning
//! depends on which phase the semaphore announces.
//!
//! # Memory Layout
//!
//! ```text
//! +-------------------------------------------------------------------+
//! | HEADER (16 bytes)                                                 |
//! |   [0] semaphore     READY / HANDSHAKE / PAYLOAD                   |
//! |   [1] total_size    (HANDSHAKE)  | chunk_index   (PAYLOAD)        |
//! |   [2] total_chunks  (HANDSHAKE)  | chunk_offset  (PAYLOAD)        |
//! |   [3] unused        (HANDSHAKE)  | chunk_size    (PAYLOAD)        |
//! +-------------------------------------------------------------------+
//! | PAYLOAD AREA (region_len - 16 bytes)                              |
//! |   holds exactly one chunk at a time, always staged at offset 0    |
//! +-------------------------------------------------------------------+
//! ```

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::futex;

// =============================================================================
// Constants
// =============================================================================

/// Width of one control word in bytes.
pub const WORD_SIZE: usize = core::mem::size_of::<i32>();

/// Number of control words in the header.
pub const HEADER_WORDS: usize = 4;

/// Header length in bytes.
pub const HEADER_SIZE: usize = HEADER_WORDS * WORD_SIZE;

/// Index of the semaphore word.
pub const SEMAPHORE_WORD: usize = 0;

/// Index of `total_size` (HANDSHAKE) / `chunk_index` (PAYLOAD).
pub const SIZE_OR_INDEX_WORD: usize = 1;

/// Index of `total_chunks` (HANDSHAKE) / `chunk_offset` (PAYLOAD).
pub const CHUNKS_OR_OFFSET_WORD: usize = 2;

/// Index of `chunk_size` (PAYLOAD only).
pub const CHUNK_SIZE_WORD: usize = 3;

/// Largest byte count a header word can describe.
pub const MAX_WORD_VALUE: usize = i32::MAX as usize;

// =============================================================================
// Semaphore
// =============================================================================

/// Protocol phase stored in the semaphore word.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Semaphore {
    /// Idle, or the last step was acknowledged.
    Ready = 0,
    /// Writer has published `total_size` and `total_chunks`.
    Handshake = 1,
    /// Writer has staged one chunk and its metadata.
    Payload = 2,
}

impl Semaphore {
    /// Convert from the raw word value.
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Semaphore::Ready),
            1 => Some(Semaphore::Handshake),
            2 => Some(Semaphore::Payload),
            _ => None,
        }
    }

    #[inline]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            Semaphore::Ready => "READY",
            Semaphore::Handshake => "HANDSHAKE",
            Semaphore::Payload => "PAYLOAD",
        }
    }

    /// Name of a raw word value, `"UNKNOWN"` for anything outside the enum.
    pub fn describe(raw: i32) -> &'static str {
        Self::from_i32(raw).map_or("UNKNOWN", Self::name)
    }
}

impl fmt::Display for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Header phase views
// =============================================================================

/// Handshake-phase interpretation of words 1 and 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeFields {
    pub total_size: i32,
    pub total_chunks: i32,
}

/// Payload-phase interpretation of words 1 to 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFields {
    pub index: i32,
    pub offset: i32,
    pub size: i32,
}

/// Header contents, decoded according to the semaphore.
///
/// Words 1 to 3 only mean something in the phase that wrote them, so they are
/// never exposed without the phase they belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderView {
    Ready,
    Handshake(HandshakeFields),
    Payload(ChunkFields),
    /// Semaphore holds a value outside [`Semaphore`].
    Unknown(i32),
}

impl HeaderView {
    /// The raw semaphore value this view was decoded from.
    pub fn raw_semaphore(&self) -> i32 {
        match self {
            HeaderView::Ready => Semaphore::Ready.as_i32(),
            HeaderView::Handshake(_) => Semaphore::Handshake.as_i32(),
            HeaderView::Payload(_) => Semaphore::Payload.as_i32(),
            HeaderView::Unknown(raw) => *raw,
        }
    }
}

// =============================================================================
// Header
// =============================================================================

/// The four control words at the start of a region.
///
/// All accesses are `SeqCst`: a semaphore store must be visible, together with
/// the fields written before it, to the peer's next wait.
#[repr(C)]
pub struct Header {
    words: [AtomicI32; HEADER_WORDS],
}

static_assertions::const_assert_eq!(core::mem::size_of::<Header>(), HEADER_SIZE);
static_assertions::const_assert_eq!(core::mem::align_of::<Header>(), WORD_SIZE);

impl Header {
    /// The semaphore word (target of every wait and wake).
    #[inline]
    pub fn semaphore_word(&self) -> &AtomicI32 {
        &self.words[SEMAPHORE_WORD]
    }

    /// A control word by index.
    ///
    /// # Panics
    ///
    /// Panics if `index >= HEADER_WORDS`.
    #[inline]
    pub fn word(&self, index: usize) -> &AtomicI32 {
        &self.words[index]
    }

    /// Raw semaphore value.
    #[inline]
    pub fn semaphore(&self) -> i32 {
        self.semaphore_word().load(Ordering::SeqCst)
    }

    /// Decode the header according to the current semaphore value.
    pub fn view(&self) -> HeaderView {
        let raw = self.semaphore();
        match Semaphore::from_i32(raw) {
            Some(Semaphore::Ready) => HeaderView::Ready,
            Some(Semaphore::Handshake) => HeaderView::Handshake(HandshakeFields {
                total_size: self.load(SIZE_OR_INDEX_WORD),
                total_chunks: self.load(CHUNKS_OR_OFFSET_WORD),
            }),
            Some(Semaphore::Payload) => HeaderView::Payload(ChunkFields {
                index: self.load(SIZE_OR_INDEX_WORD),
                offset: self.load(CHUNKS_OR_OFFSET_WORD),
                size: self.load(CHUNK_SIZE_WORD),
            }),
            None => HeaderView::Unknown(raw),
        }
    }

    /// Write the handshake fields. Does not touch the semaphore.
    pub fn write_handshake(&self, fields: HandshakeFields) {
        self.store(SIZE_OR_INDEX_WORD, fields.total_size);
        self.store(CHUNKS_OR_OFFSET_WORD, fields.total_chunks);
    }

    /// Write the chunk metadata. Does not touch the semaphore.
    pub fn write_chunk(&self, fields: ChunkFields) {
        self.store(SIZE_OR_INDEX_WORD, fields.index);
        self.store(CHUNKS_OR_OFFSET_WORD, fields.offset);
        self.store(CHUNK_SIZE_WORD, fields.size);
    }

    /// Store a new phase into the semaphore and wake the peer.
    pub fn publish(&self, state: Semaphore) {
        self.publish_raw(state.as_i32());
    }

    /// Store an arbitrary semaphore value and wake the peer.
    ///
    /// Only for diagnostics and tests that need to inject invalid states.
    pub fn publish_raw(&self, value: i32) {
        self.semaphore_word().store(value, Ordering::SeqCst);
        futex::futex_signal(self.semaphore_word());
    }

    #[inline]
    fn load(&self, index: usize) -> i32 {
        self.words[index].load(Ordering::SeqCst)
    }

    #[inline]
    fn store(&self, index: usize, value: i32) {
        self.words[index].store(value, Ordering::SeqCst);
    }
}

// =============================================================================
// Region validation
// =============================================================================

/// Validated geometry of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    /// Total region length in bytes.
    pub len: usize,
    /// Bytes available for one chunk.
    pub payload_capacity: usize,
}

impl RegionLayout {
    /// Validate a region length.
    ///
    /// The capacity is clamped to [`MAX_WORD_VALUE`] so chunk sizes always fit
    /// a header word.
    pub fn for_len(len: usize) -> Result<Self, LayoutError> {
        if !len.is_multiple_of(WORD_SIZE) {
            return Err(LayoutError::SizeNotAligned { len });
        }
        if len <= HEADER_SIZE {
            return Err(LayoutError::TooSmall { len });
        }
        Ok(Self {
            len,
            payload_capacity: (len - HEADER_SIZE).min(MAX_WORD_VALUE),
        })
    }

    /// Validate a region base address and length.
    pub fn for_raw(base: *const u8, len: usize) -> Result<Self, LayoutError> {
        let layout = Self::for_len(len)?;
        let addr = base as usize;
        if !addr.is_multiple_of(WORD_SIZE) {
            return Err(LayoutError::Misaligned { addr });
        }
        Ok(layout)
    }
}

/// Reject payloads whose length cannot be announced in a handshake.
pub fn check_payload_len(len: usize) -> Result<i32, LayoutError> {
    i32::try_from(len).map_err(|_| LayoutError::PayloadTooLarge {
        len,
        max: MAX_WORD_VALUE,
    })
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from region setup, raised before any header access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// Region length is not a multiple of the word width.
    SizeNotAligned { len: usize },
    /// Region leaves no room for a payload area.
    TooSmall { len: usize },
    /// Region base address is not word aligned.
    Misaligned { addr: usize },
    /// Payload length does not fit a header word.
    PayloadTooLarge { len: usize, max: usize },
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SizeNotAligned { len } => write!(
                f,
                "region size {} is not a multiple of {} bytes",
                len, WORD_SIZE
            ),
            Self::TooSmall { len } => write!(
                f,
                "region too small: {} bytes leaves no payload area after the {}-byte header",
                len, HEADER_SIZE
            ),
            Self::Misaligned { addr } => {
                write!(f, "region base {:#x} is not {}-byte aligned", addr, WORD_SIZE)
            }
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload too large: {} bytes, max {}", len, max)
            }
        }
    }
}

impl std::error::Error for LayoutError {}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Header {
        Header {
            words: [
                AtomicI32::new(0),
                AtomicI32::new(0),
                AtomicI32::new(0),
                AtomicI32::new(0),
            ],
        }
    }

    #[test]
    fn test_header_size() {
        assert_eq!(core::mem::size_of::<Header>(), 16);
        assert_eq!(HEADER_SIZE, 16);
    }

    #[test]
    fn test_payload_capacity() {
        let layout = RegionLayout::for_len(1024).unwrap();
        assert_eq!(layout.payload_capacity, 1008);

        let layout = RegionLayout::for_len(20).unwrap();
        assert_eq!(layout.payload_capacity, 4);
    }

    #[test]
    fn test_rejects_unaligned_len() {
        assert_eq!(
            RegionLayout::for_len(1022),
            Err(LayoutError::SizeNotAligned { len: 1022 })
        );
        assert_eq!(
            RegionLayout::for_len(17),
            Err(LayoutError::SizeNotAligned { len: 17 })
        );
    }

    #[test]
    fn test_rejects_small_regions() {
        for len in [0, 4, 12, 16] {
            assert_eq!(
                RegionLayout::for_len(len),
                Err(LayoutError::TooSmall { len })
            );
        }
    }

    #[test]
    fn test_rejects_misaligned_base() {
        let backing = [0u32; 8];
        let base = backing.as_ptr() as *const u8;
        assert!(RegionLayout::for_raw(base, 32).is_ok());
        let shifted = base.wrapping_add(1);
        assert_eq!(
            RegionLayout::for_raw(shifted, 28),
            Err(LayoutError::Misaligned {
                addr: shifted as usize
            })
        );
    }

    #[test]
    fn test_payload_len_limit() {
        assert_eq!(check_payload_len(0), Ok(0));
        assert_eq!(check_payload_len(MAX_WORD_VALUE), Ok(i32::MAX));
        assert!(matches!(
            check_payload_len(MAX_WORD_VALUE + 1),
            Err(LayoutError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_semaphore_names() {
        assert_eq!(Semaphore::describe(0), "READY");
        assert_eq!(Semaphore::describe(1), "HANDSHAKE");
        assert_eq!(Semaphore::describe(2), "PAYLOAD");
        assert_eq!(Semaphore::describe(-1), "UNKNOWN");
        assert_eq!(Semaphore::describe(3), "UNKNOWN");
    }

    #[test]
    fn test_view_follows_semaphore() {
        let header = header();
        assert_eq!(header.view(), HeaderView::Ready);

        header.write_handshake(HandshakeFields {
            total_size: 2017,
            total_chunks: 3,
        });
        header.publish(Semaphore::Handshake);
        assert_eq!(
            header.view(),
            HeaderView::Handshake(HandshakeFields {
                total_size: 2017,
                total_chunks: 3
            })
        );

        header.write_chunk(ChunkFields {
            index: 2,
            offset: 2016,
            size: 1,
        });
        header.publish(Semaphore::Payload);
        assert_eq!(
            header.view(),
            HeaderView::Payload(ChunkFields {
                index: 2,
                offset: 2016,
                size: 1
            })
        );

        header.publish_raw(7);
        assert_eq!(header.view(), HeaderView::Unknown(7));
        assert_eq!(header.view().raw_semaphore(), 7);
    }
}
