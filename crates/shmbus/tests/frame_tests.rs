//! Producer/consumer scenarios over the frame buffer, with the doorbell in
//! the loop. Two handles on one backing file stand in for two processes.

use shmbus::{Error, FrameBuffer};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn consumer_wakes_on_push() {
    let dir = tempfile::tempdir().unwrap();
    let producer = Arc::new(FrameBuffer::with_size("msg", 0, dir.path(), 0, 4096).unwrap());
    let consumer = FrameBuffer::open("msg", 0, dir.path(), 0).unwrap();

    // Bind the doorbell before the producer rings.
    assert_eq!(consumer.wait(Duration::from_millis(10)), Err(Error::TimedOut));

    let pusher = {
        let producer = Arc::clone(&producer);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            producer.push(b"hello").unwrap();
        })
    };

    let started = Instant::now();
    assert_eq!(consumer.wait(Duration::from_secs(1)), Ok(()));
    assert!(started.elapsed() < Duration::from_secs(1));

    let mut out = [0u8; 64];
    assert_eq!(consumer.pop(&mut out).unwrap(), 5);
    assert_eq!(&out[..5], b"hello");

    pusher.join().unwrap();
}

#[test]
fn records_arrive_in_fifo_order() {
    let dir = tempfile::tempdir().unwrap();
    let producer = FrameBuffer::with_size("msg", 0, dir.path(), 0, 4096).unwrap();
    let consumer = FrameBuffer::open("msg", 0, dir.path(), 0).unwrap();

    for index in 0..10u8 {
        producer.push(&[index; 16]).unwrap();
    }

    let mut out = [0u8; 64];
    for index in 0..10u8 {
        assert_eq!(consumer.pop(&mut out).unwrap(), 16);
        assert_eq!(&out[..16], &[index; 16][..]);
    }
    assert_eq!(consumer.pop(&mut out), Err(Error::Empty));
}

#[test]
fn truncation_consumes_and_reports() {
    let dir = tempfile::tempdir().unwrap();
    let frames = FrameBuffer::with_size("msg", 0, dir.path(), 0, 4096).unwrap();

    frames.push(b"AB").unwrap();
    frames.push(b"CDE").unwrap();

    let mut one = [0u8; 1];
    assert_eq!(frames.pop(&mut one), Err(Error::Truncated { required: 2 }));

    let mut eight = [0u8; 8];
    assert_eq!(frames.pop(&mut eight).unwrap(), 3);
    assert_eq!(&eight[..3], b"CDE");
}

#[test]
fn doorbell_rings_coalesce() {
    let dir = tempfile::tempdir().unwrap();
    let producer = FrameBuffer::with_size("msg", 0, dir.path(), 0, 4096).unwrap();
    let consumer = FrameBuffer::open("msg", 0, dir.path(), 0).unwrap();

    assert_eq!(consumer.wait(Duration::from_millis(10)), Err(Error::TimedOut));

    for index in 0..8u8 {
        producer.push(&[index]).unwrap();
    }

    // One delivery for the burst; the wait acknowledges the backlog.
    assert_eq!(consumer.wait(Duration::from_secs(1)), Ok(()));
    assert_eq!(consumer.wait(Duration::from_millis(50)), Err(Error::TimedOut));

    // All records are still there, the coalescing lost no data.
    let mut out = [0u8; 16];
    let mut received = 0;
    while consumer.pop(&mut out).is_ok() {
        received += 1;
    }
    assert_eq!(received, 8);
}

#[test]
fn relinquish_unblocks_consumer() {
    let dir = tempfile::tempdir().unwrap();
    let _producer = FrameBuffer::with_size("msg", 0, dir.path(), 0, 4096).unwrap();
    let consumer = Arc::new(FrameBuffer::open("msg", 0, dir.path(), 0).unwrap());

    assert_eq!(consumer.wait(Duration::from_millis(10)), Err(Error::TimedOut));

    let waiter = {
        let consumer = Arc::clone(&consumer);
        std::thread::spawn(move || consumer.wait(Duration::from_secs(5)))
    };

    std::thread::sleep(Duration::from_millis(50));
    consumer.relinquish();

    assert_eq!(waiter.join().unwrap(), Err(Error::Unavailable));
}

#[test]
fn flush_drops_backlog() {
    let dir = tempfile::tempdir().unwrap();
    let frames = FrameBuffer::with_size("msg", 0, dir.path(), 0, 4096).unwrap();

    frames.push(b"one").unwrap();
    frames.push(b"two").unwrap();
    frames.flush();

    let mut out = [0u8; 16];
    assert_eq!(frames.pop(&mut out), Err(Error::Empty));
}

#[test]
fn sustained_throughput_with_concurrent_consumer() {
    let dir = tempfile::tempdir().unwrap();
    let producer = Arc::new(FrameBuffer::with_size("msg", 0, dir.path(), 0, 4096).unwrap());
    let consumer = Arc::new(FrameBuffer::open("msg", 0, dir.path(), 0).unwrap());

    const MESSAGES: u32 = 2_000;

    let feeder = {
        let producer = Arc::clone(&producer);
        std::thread::spawn(move || {
            for index in 0..MESSAGES {
                let payload = index.to_le_bytes();
                producer.push(&payload).unwrap();
                if index % 64 == 0 {
                    std::thread::yield_now();
                }
            }
        })
    };

    // The ring overwrites under pressure, so the consumer may miss records
    // but must only ever see whole, in-order payloads.
    let mut out = [0u8; 16];
    let mut previous: Option<u32> = None;
    let mut seen = 0u32;
    let deadline = Instant::now() + Duration::from_secs(10);

    while seen < MESSAGES && Instant::now() < deadline {
        match consumer.pop(&mut out) {
            Ok(4) => {
                let value = u32::from_le_bytes(out[..4].try_into().unwrap());
                if let Some(previous) = previous {
                    assert!(value > previous, "out of order: {value} after {previous}");
                }
                previous = Some(value);
                seen += 1;
                if value == MESSAGES - 1 {
                    break;
                }
            }
            Ok(other) => panic!("unexpected record size {other}"),
            Err(Error::Empty) => std::thread::yield_now(),
            Err(other) => panic!("unexpected: {other:?}"),
        }
    }

    feeder.join().unwrap();
    assert!(previous.is_some(), "consumer never saw a record");
}
