//! Property-based tests for the cyclic buffer and the framing layer.
//!
//! These verify the arithmetic invariants of the cursor protocol across
//! randomly generated operation sequences:
//! - used + free == size after any sequence of operations
//! - used stays in [0, size - 1]
//! - a write followed by a sufficient read round-trips the bytes
//! - overwrite mode always accepts a write and only drops whole records
//! - a pushed record pops back identical, or reports the exact size needed

use proptest::collection::vec as prop_vec;
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use shmbus::{CyclicBuffer, Error, FrameBuffer};

fn ring(size: u32, overwrite: bool) -> (tempfile::TempDir, CyclicBuffer) {
    let dir = tempfile::tempdir().unwrap();
    let buffer = CyclicBuffer::create(&dir.path().join("ring"), size, overwrite, None).unwrap();
    (dir, buffer)
}

proptest! {
    /// used + free == size and used < size after any mix of writes/reads.
    #[test]
    fn used_and_free_stay_complementary(
        chunks in prop_vec(1usize..200, 0..60),
        read_every in 1usize..5,
    ) {
        let (_dir, buffer) = ring(1024, true);
        let mut sink = vec![0u8; 1024];

        for (index, chunk) in chunks.iter().enumerate() {
            buffer.write(&vec![index as u8; *chunk]).unwrap();

            prop_assert_eq!(buffer.used() + buffer.free(), buffer.size());
            prop_assert!(buffer.used() < buffer.size());

            if index % read_every == 0 {
                // Partial reads consume a whole chunk at a time.
                let _ = buffer.read(&mut sink, true);
                prop_assert_eq!(buffer.used() + buffer.free(), buffer.size());
            }
        }
    }

    /// Quiescent write/read round-trips bytes exactly and drains the buffer.
    #[test]
    fn write_read_round_trip(payload in prop_vec(any::<u8>(), 1..900)) {
        let (_dir, buffer) = ring(1024, false);

        prop_assert_eq!(buffer.write(&payload).unwrap() as usize, payload.len());

        let mut out = vec![0u8; 1024];
        let read = buffer.read(&mut out, false).unwrap() as usize;
        prop_assert_eq!(read, payload.len());
        prop_assert_eq!(&out[..read], &payload[..]);
        prop_assert_eq!(buffer.used(), 0);
    }

    /// Bytes survive arbitrary wrap positions: pre-advance the cursors, then
    /// round-trip.
    #[test]
    fn round_trip_survives_wrap(
        lead in 1usize..1000,
        payload in prop_vec(any::<u8>(), 1..800),
    ) {
        let (_dir, buffer) = ring(1024, false);
        let mut sink = vec![0u8; 1024];

        // Park the cursors somewhere inside the region.
        let lead = lead.min(buffer.free() as usize - 1);
        buffer.write(&vec![0u8; lead]).unwrap();
        buffer.read(&mut sink, true).unwrap();

        if (payload.len() as u32) < buffer.free() {
            buffer.write(&payload).unwrap();
            let read = buffer.read(&mut sink, false).unwrap() as usize;
            prop_assert_eq!(read, payload.len());
            prop_assert_eq!(&sink[..read], &payload[..]);
        }
    }

    /// With overwrite set every push succeeds, and whatever remains readable
    /// is a suffix of what was pushed, whole records only.
    #[test]
    fn overwrite_keeps_whole_records(records in prop_vec(prop_vec(any::<u8>(), 1..120), 1..80)) {
        let dir = tempfile::tempdir().unwrap();
        let frames = FrameBuffer::with_size("prop", 0, dir.path(), 0, 512).unwrap();

        for record in &records {
            frames.push(record).unwrap();
        }

        // Pop everything; each must match a pushed record, in order, ending
        // with the final record (the last push can never be evicted).
        let mut out = vec![0u8; 512];
        let mut popped = Vec::new();
        loop {
            match frames.pop(&mut out) {
                Ok(length) => popped.push(out[..length].to_vec()),
                Err(Error::Empty) => break,
                Err(other) => return Err(TestCaseError::fail(format!("unexpected: {other:?}"))),
            }
        }

        prop_assert!(!popped.is_empty());
        prop_assert_eq!(popped.last().unwrap(), records.last().unwrap());

        // The survivors form a contiguous suffix of the pushed sequence.
        let start = records.len() - popped.len();
        for (offset, record) in popped.iter().enumerate() {
            prop_assert_eq!(record, &records[start + offset]);
        }
    }

    /// Framing closure: a pop returns the pushed bytes exactly, or reports
    /// TRUNCATED carrying the original length.
    #[test]
    fn framing_closure(
        payload in prop_vec(any::<u8>(), 1..300),
        destination in 1usize..400,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let frames = FrameBuffer::with_size("prop", 0, dir.path(), 0, 1024).unwrap();

        frames.push(&payload).unwrap();

        let mut out = vec![0u8; destination];
        match frames.pop(&mut out) {
            Ok(length) => {
                prop_assert_eq!(length, payload.len());
                prop_assert_eq!(&out[..length], &payload[..]);
            }
            Err(Error::Truncated { required }) => {
                prop_assert!(destination < payload.len());
                prop_assert_eq!(required as usize, payload.len());
            }
            Err(other) => return Err(TestCaseError::fail(format!("unexpected: {other:?}"))),
        }
    }
}
