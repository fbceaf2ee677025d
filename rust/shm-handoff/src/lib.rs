//! Chunked payload handoff over a single shared memory region.
//!
//! Two peers (a writer and a reader) share one fixed-size region and nothing
//! else. The writer announces a payload with a handshake, then streams it one
//! chunk at a time through the region's payload area; the reader validates and
//! acknowledges each step. All coordination goes through one `i32` semaphore
//! word in the region header, plus futex wait/wake on that word.
//!
//! # State machines and drains
//!
//! [`Writer`] and [`Reader`] never block on their own. Each exposes
//! [`Transfer::next_action`], which either asks the caller to wait on a word
//! ([`Action::Wait`]) or reports the terminal result ([`Action::Done`]).
//! The drains decide how to wait:
//!
//! - [`drain_blocking`]: parks the calling thread with [`BlockingWait`].
//! - [`drain_async`]: yields to the async runtime with [`AsyncWait`].
//!
//! [`send`] / [`recv`] (and their `_async` variants) wire the state machines to
//! the futex-backed [`FutexWait`].
//!
//! # Example
//!
//! ```no_run
//! use shm_handoff::{HeapRegion, TransferConfig, recv, send};
//!
//! let owner = HeapRegion::new_zeroed(4096);
//! let region = owner.region();
//! let config = TransferConfig::default();
//!
//! let reader = {
//!     let region = region.clone();
//!     let config = config.clone();
//!     std::thread::spawn(move || recv(&region, &config))
//! };
//! send(&region, &b"hello"[..], &config).unwrap();
//! assert_eq!(reader.join().unwrap().unwrap(), b"hello");
//! ```

pub mod config;
pub mod drain;
pub mod error;
pub mod futex;
pub mod layout;
pub mod reader;
pub mod region;
pub mod wait;
pub mod writer;

pub use config::{DEFAULT_TIMEOUT_MS, TransferConfig};
pub use drain::{Action, Transfer, drain_blocking, recv, send};
#[cfg(feature = "tokio")]
pub use drain::{drain_async, recv_async, send_async};
pub use error::TransferError;
pub use layout::{
    ChunkFields, HEADER_SIZE, HEADER_WORDS, HandshakeFields, Header, HeaderView, LayoutError,
    RegionLayout, Semaphore, WORD_SIZE,
};
pub use reader::Reader;
pub use region::{HeapRegion, Region};
pub use wait::{AsyncWait, BlockingWait, FutexWait, WaitOutcome, WaitRequest};
pub use writer::{ChunkPlan, Writer};
