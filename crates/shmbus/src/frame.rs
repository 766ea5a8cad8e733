//! Length-prefixed record framing over the cyclic buffer, coupled to a
//! doorbell.
//!
//! A record on the wire is `u16_le full_length || payload[full_length - 2]`,
//! where `full_length` includes its own two-byte header. The frame-aware
//! policies below make overwrite-eviction drop whole records and make a read
//! return exactly one record.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::cyclic::{Cursor, CyclicBuffer, FramePolicy};
use crate::doorbell::Doorbell;
use crate::error::{Error, Result};

/// Default capacity of a frame buffer's data ring.
pub const DATA_BUFFER_SIZE: u32 = 20 * 1024;

const HEADER_SIZE: u16 = 2;

/// Record-aware policy: evictions skip whole records, reads return one
/// record with its header already consumed.
struct RecordFrames;

impl FramePolicy for RecordFrames {
    fn overwrite_size(&self, cursor: &mut Cursor<'_>) -> u32 {
        while cursor.offset() < cursor.size() {
            let chunk = cursor.peek_u16();
            cursor.forward(chunk as u32);
        }
        cursor.offset()
    }

    fn read_size(&self, cursor: &mut Cursor<'_>) -> u32 {
        // Just read one entry.
        let entry = cursor.peek_u16();
        cursor.forward(HEADER_SIZE as u32);
        if entry > HEADER_SIZE {
            (entry - HEADER_SIZE) as u32
        } else {
            0
        }
    }
}

/// Endpoint names derived from the instance identity.
#[derive(Debug, Clone)]
struct Filenames {
    doorbell: String,
    metadata: String,
    data: PathBuf,
}

impl Filenames {
    fn prepare(identifier: &str, instance_id: u32, base_dir: &Path, socket_port: u16) -> Self {
        let base = base_dir.join(identifier);
        let base = base.to_string_lossy().into_owned();

        let (doorbell, metadata) = if socket_port != 0 {
            (
                format!("127.0.0.1:{socket_port}"),
                format!("127.0.0.1:{}", socket_port as u32 + instance_id + 1),
            )
        } else {
            (
                format!("{base}.doorbell"),
                format!("{base}.{instance_id}.metadata"),
            )
        };

        Self {
            doorbell,
            metadata,
            data: PathBuf::from(format!("{base}.{instance_id}.data")),
        }
    }
}

/// A queue of length-prefixed records in shared memory, with a doorbell to
/// wake the consumer.
///
/// Cross-process ordering comes from the cyclic buffer alone; the local
/// mutex only serialises threads of the same process.
pub struct FrameBuffer {
    names: Filenames,
    lock: Mutex<()>,
    buffer: CyclicBuffer,
    doorbell: Doorbell,
}

impl FrameBuffer {
    /// Creates the backing buffer (the initiator side). The data ring runs
    /// in overwrite mode: a stalled consumer costs records, never producers.
    pub fn create(
        identifier: &str,
        instance_id: u32,
        base_dir: &Path,
        socket_port: u16,
    ) -> Result<Self> {
        Self::with_size(identifier, instance_id, base_dir, socket_port, DATA_BUFFER_SIZE)
    }

    /// [`create`](Self::create) with an explicit ring capacity.
    pub fn with_size(
        identifier: &str,
        instance_id: u32,
        base_dir: &Path,
        socket_port: u16,
        size: u32,
    ) -> Result<Self> {
        let names = Filenames::prepare(identifier, instance_id, base_dir, socket_port);
        let buffer =
            CyclicBuffer::create_with_policy(&names.data, size, true, None, Box::new(RecordFrames))?;
        let doorbell = Doorbell::new(&names.doorbell);

        Ok(Self {
            names,
            lock: Mutex::new(()),
            buffer,
            doorbell,
        })
    }

    /// Attaches to an existing buffer. If records are already queued, the
    /// doorbell is rung so the consumer learns about them.
    pub fn open(
        identifier: &str,
        instance_id: u32,
        base_dir: &Path,
        socket_port: u16,
    ) -> Result<Self> {
        let names = Filenames::prepare(identifier, instance_id, base_dir, socket_port);
        let buffer = CyclicBuffer::open_with_policy(&names.data, Box::new(RecordFrames))?;
        let doorbell = Doorbell::new(&names.doorbell);

        let attached = Self {
            names,
            lock: Mutex::new(()),
            buffer,
            doorbell,
        };

        if attached.buffer.used() > 0 {
            let _ = attached.doorbell.ring();
        }

        Ok(attached)
    }

    /// Path of the data file.
    pub fn name(&self) -> &Path {
        &self.names.data
    }

    /// Endpoint a controller should dial for metadata exchange.
    pub fn metadata_endpoint(&self) -> &str {
        &self.names.metadata
    }

    /// Appends one record and rings the doorbell.
    ///
    /// The payload is reserved, written and published atomically: a reader
    /// either sees the whole record or none of it.
    pub fn push(&self, payload: &[u8]) -> Result<()> {
        debug_assert!(!payload.is_empty());
        debug_assert!(payload.len() <= (u16::MAX - HEADER_SIZE) as usize);

        let full_length = HEADER_SIZE + payload.len() as u16;
        let _guard = self.lock.lock().unwrap();

        let reserved = self.buffer.reserve(full_length as u32)?;
        if reserved < full_length as u32 {
            // Record larger than the ring can ever hold.
            self.buffer.cancel_reservation();
            return Err(Error::WriteError);
        }

        // No serialisation step needed, the buffer takes the record in two
        // pieces and publishes them together.
        self.buffer.write(&full_length.to_le_bytes())?;
        self.buffer.write(payload)?;

        let _ = self.doorbell.ring();
        Ok(())
    }

    /// Pops one record into `payload`.
    ///
    /// Returns the record size, [`Error::Empty`] when there is none, or
    /// [`Error::Truncated`] when `payload` was too small: the bytes that fit
    /// were copied, the rest of the record is gone, and `required` tells the
    /// caller what a retry would have needed.
    pub fn pop(&self, payload: &mut [u8]) -> Result<usize> {
        debug_assert!(!payload.is_empty());

        let _guard = self.lock.lock().unwrap();
        let length = self.buffer.read(payload, true)?;

        if length as usize > payload.len() {
            return Err(Error::Truncated {
                required: length as u16,
            });
        }

        Ok(length as usize)
    }

    /// Waits for the doorbell, acknowledging the delivery unless it timed
    /// out.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let result = self.doorbell.wait(timeout);
        if !matches!(result, Err(Error::TimedOut)) {
            self.doorbell.acknowledge();
        }
        result
    }

    /// Rings the doorbell without pushing.
    pub fn ring(&self) {
        let _ = self.doorbell.ring();
    }

    /// Unblocks a waiting consumer with [`Error::Unavailable`].
    pub fn relinquish(&self) {
        self.doorbell.relinquish();
    }

    /// Discards all queued records.
    pub fn flush(&self) {
        let _guard = self.lock.lock().unwrap();
        self.buffer.flush();
    }

    /// True when overwrite policy has dropped records since the last call.
    pub fn overwritten(&self) -> bool {
        self.buffer.overwritten()
    }

    /// Records currently queued, in bytes (headers included).
    pub fn used(&self) -> u32 {
        self.buffer.used()
    }

    /// Removes the backing file.
    pub fn destroy(&self) -> Result<()> {
        self.buffer.destroy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_follow_instance_identity() {
        let names = Filenames::prepare("msg", 3, Path::new("/tmp/frames"), 0);
        assert_eq!(names.doorbell, "/tmp/frames/msg.doorbell");
        assert_eq!(names.metadata, "/tmp/frames/msg.3.metadata");
        assert_eq!(names.data, Path::new("/tmp/frames/msg.3.data"));
    }

    #[test]
    fn socket_port_switches_to_loopback_endpoints() {
        let names = Filenames::prepare("msg", 3, Path::new("/tmp/frames"), 7000);
        assert_eq!(names.doorbell, "127.0.0.1:7000");
        assert_eq!(names.metadata, "127.0.0.1:7004");
        assert_eq!(names.data, Path::new("/tmp/frames/msg.3.data"));
    }

    #[test]
    fn push_pop_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let frames = FrameBuffer::create("msg", 0, dir.path(), 0).unwrap();

        frames.push(b"hello").unwrap();

        let mut out = [0u8; 32];
        assert_eq!(frames.pop(&mut out).unwrap(), 5);
        assert_eq!(&out[..5], b"hello");
        assert_eq!(frames.pop(&mut out), Err(Error::Empty));
    }

    #[test]
    fn truncated_pop_reports_required_length() {
        let dir = tempfile::tempdir().unwrap();
        let frames = FrameBuffer::create("msg", 0, dir.path(), 0).unwrap();

        frames.push(b"AB").unwrap();
        frames.push(b"CDE").unwrap();

        let mut tiny = [0u8; 1];
        assert_eq!(frames.pop(&mut tiny), Err(Error::Truncated { required: 2 }));

        // The cut record is consumed; the next one is intact.
        let mut out = [0u8; 8];
        assert_eq!(frames.pop(&mut out).unwrap(), 3);
        assert_eq!(&out[..3], b"CDE");
    }

    #[test]
    fn oversized_record_fails_and_leaves_no_reservation() {
        let dir = tempfile::tempdir().unwrap();
        let frames = FrameBuffer::with_size("msg", 0, dir.path(), 0, 256).unwrap();

        let oversized = vec![0u8; 1024];
        assert_eq!(frames.push(&oversized), Err(Error::WriteError));

        // The failed push must not wedge the buffer.
        frames.push(b"still alive").unwrap();
        let mut out = [0u8; 32];
        assert_eq!(frames.pop(&mut out).unwrap(), 11);
    }

    #[test]
    fn overwrite_drops_whole_records() {
        let dir = tempfile::tempdir().unwrap();
        let frames = FrameBuffer::with_size("msg", 0, dir.path(), 0, 256).unwrap();
        let size = 256u32;

        // Fill with records of payload 30 (32 on the wire).
        let mut pushed = 0u32;
        while pushed + 32 < size {
            frames.push(&[0xEE; 30]).unwrap();
            pushed += 32;
        }
        assert!(!frames.overwritten());

        frames.push(&[0xDD; 30]).unwrap();
        assert!(frames.overwritten());

        // Every record that survived is whole.
        let mut out = [0u8; 64];
        let mut last = Vec::new();
        loop {
            match frames.pop(&mut out) {
                Ok(n) => {
                    assert_eq!(n, 30);
                    last = out[..n].to_vec();
                }
                Err(Error::Empty) => break,
                Err(other) => panic!("unexpected: {other:?}"),
            }
        }
        assert_eq!(last, vec![0xDD; 30]);
    }

    #[test]
    fn attached_handle_sees_pushed_records() {
        let dir = tempfile::tempdir().unwrap();
        let producer = FrameBuffer::create("msg", 0, dir.path(), 0).unwrap();
        producer.push(b"queued early").unwrap();

        let consumer = FrameBuffer::open("msg", 0, dir.path(), 0).unwrap();
        let mut out = [0u8; 32];
        assert_eq!(consumer.pop(&mut out).unwrap(), 12);
        assert_eq!(&out[..12], b"queued early");
    }
}
