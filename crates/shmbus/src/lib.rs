//! shmbus — cross-process shared-memory message transport.
//!
//! The core primitive is a lock-free single-producer/single-consumer cyclic
//! byte buffer living inside a memory-mapped file. On top of it the crate
//! layers a cooperative cross-process lock with signalling, a named doorbell
//! for wakeups, and a framing buffer that turns the byte ring into a queue of
//! length-prefixed records.
//!
//! # Example
//!
//! ```no_run
//! use shmbus::FrameBuffer;
//! use std::path::Path;
//! use std::time::Duration;
//!
//! // Producer side (initiator):
//! let queue = FrameBuffer::create("msg", 0, Path::new("/tmp/bus"), 0)?;
//! queue.push(b"hello")?;
//!
//! // Consumer side, typically another process:
//! let feed = FrameBuffer::open("msg", 0, Path::new("/tmp/bus"), 0)?;
//! feed.wait(Duration::from_secs(1))?;
//! let mut record = [0u8; 256];
//! let length = feed.pop(&mut record)?;
//! assert_eq!(&record[..length], b"hello");
//! # Ok::<(), shmbus::Error>(())
//! ```

mod cyclic;
mod doorbell;
mod error;
mod frame;
mod region;
mod shared_lock;

pub use cyclic::{Cursor, CyclicBuffer, FramePolicy, RawFrames};
pub use doorbell::Doorbell;
pub use error::{Error, Result};
pub use frame::{FrameBuffer, DATA_BUFFER_SIZE};
pub use region::{MappedFile, DEFAULT_PERMISSIONS};
