//! The lock-free cyclic byte buffer living in shared memory.
//!
//! # Memory ordering & cursor protocol
//!
//! The buffer is a byte ring addressed by two 32-bit cursors in a shared
//! control block:
//!
//! - `head` is the write cursor. It is a plain byte index into the region,
//!   published with a Release store after the payload copy so a reader that
//!   observes the new head also observes the bytes.
//! - `tail` is the read cursor. Its low bits (`index_mask`) address a byte,
//!   the high bits carry a wrapping *round counter*. The round exists solely
//!   so that the single compare-exchange that advances `tail` can detect a
//!   competing reader even when the index itself has come back around (ABA).
//!
//! `used`/`free` arithmetic operates on index parts only. Equal indices mean
//! *empty*, never full, which caps a single transfer at `size - 1` bytes.
//!
//! Administrative operations (the coarse cross-process lock, waiter wakeup)
//! go through a process-shared mutex/condvar pair embedded at the start of
//! the control block. Signals are emitted while that mutex is held so a
//! waiter can never slip past its predicate check.

use std::mem::size_of;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;

use crate::error::{Error, Result};
use crate::region::MappedFile;
use crate::shared_lock::SharedLock;

const STATE_LOCKED: u16 = 0x01;
const STATE_OVERWRITE: u16 = 0x02;
const STATE_OVERWRITTEN: u16 = 0x04;

/// Shared control block at the start of the mapped region.
///
/// Created once by the initiator, after which the layout is frozen; every
/// attaching process casts the base of its own mapping to this struct.
#[repr(C)]
struct ControlBlock {
    lock: SharedLock,
    head: AtomicU32,
    tail: AtomicU32,
    /// `(1 << k) - 1` with `(1 << k) >= size`; splits `tail` into
    /// `[round | index]`.
    index_mask: u32,
    /// Wrap value for the round counter, chosen so that
    /// `round * (index_mask + 1)` stays within 32 bits.
    round_modulus: u32,
    /// Number of agents currently blocked in the lock wait.
    waiters: AtomicU32,
    state: AtomicU16,
    /// Usable payload bytes (region size minus this control block).
    size: u32,
    /// Owner of the coarse lock, 0 when free.
    locking_pid: AtomicU32,
    /// Bytes claimed by the open reservation.
    reserved: AtomicU32,
    /// Bytes of the open reservation already written.
    reserved_written: AtomicU32,
    /// Owner of the open reservation, 0 when none.
    reserving_pid: AtomicU32,
}

/// Record-awareness hooks for the layers above the raw byte ring.
///
/// The buffer itself moves opaque bytes. A framing layer implements this
/// trait so that overwrite-eviction removes whole records and a read returns
/// exactly one record. The defaults treat content as unstructured bytes.
pub trait FramePolicy: Send + Sync {
    /// How many bytes to evict, given a cursor asking for at least
    /// `cursor.size()` of them. Must return at least that much.
    fn overwrite_size(&self, cursor: &mut Cursor<'_>) -> u32 {
        cursor.size()
    }

    /// How many payload bytes the next read should return. `cursor.size()`
    /// holds the number of used bytes; forwarding the cursor skips header
    /// bytes that the copy should not include.
    fn read_size(&self, cursor: &mut Cursor<'_>) -> u32 {
        cursor.size()
    }

    /// Called (under the admin lock) when a write makes an empty buffer
    /// non-empty.
    fn data_available(&self, buffer: &CyclicBuffer) {
        let _ = buffer;
    }
}

/// The identity policy: unstructured bytes.
pub struct RawFrames;

impl FramePolicy for RawFrames {}

/// A read-only walker over buffer content starting at a tail snapshot.
///
/// Handed to [`FramePolicy`] hooks so they can inspect record headers without
/// committing to a new tail position.
pub struct Cursor<'a> {
    buffer: &'a CyclicBuffer,
    tail: u32,
    size: u32,
    offset: u32,
}

impl<'a> Cursor<'a> {
    fn new(buffer: &'a CyclicBuffer, tail: u32, size: u32) -> Self {
        Self {
            buffer,
            tail,
            size,
            offset: 0,
        }
    }

    /// The quantity this cursor was asked about: bytes available (reads) or
    /// bytes to clear (overwrite eviction).
    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Bytes walked so far.
    #[inline]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Advances the cursor without copying.
    #[inline]
    pub fn forward(&mut self, byte_count: u32) {
        self.offset += byte_count;
    }

    /// Reads the little-endian `u16` at the current position, wrapping at
    /// the region end. The cursor does not move.
    pub fn peek_u16(&self) -> u16 {
        let ctl = self.buffer.control();
        let start = ((self.tail & ctl.index_mask) + self.offset) % ctl.size;
        let low = self.buffer.byte_at(start);
        let high = self.buffer.byte_at((start + 1) % ctl.size);
        u16::from_le_bytes([low, high])
    }

    /// Recombines the tail snapshot advanced by `offset` bytes into a full
    /// `[round | index]` cursor value, bumping the round on wrap.
    fn complete_tail(&self, offset: u32) -> u32 {
        let ctl = self.buffer.control();
        let span = ctl.index_mask + 1;

        let mut round = self.tail / span;
        let old_index = self.tail & ctl.index_mask;

        let index = (old_index + offset) % ctl.size;
        if index < old_index {
            // Add one round, but prevent overflow.
            round = (round + 1) % ctl.round_modulus;
        }

        index | (round * span)
    }
}

/// The shared cyclic buffer.
///
/// Any number of handles, in any number of processes, may be attached to the
/// same backing file. Writers that interleave without a reservation must be
/// serialised externally; one reservation at a time is enforced in-band.
pub struct CyclicBuffer {
    storage: MappedFile,
    policy: Box<dyn FramePolicy>,
    /// Process-local cancellation flag for lock waits.
    alerted: AtomicBool,
}

impl CyclicBuffer {
    /// Creates the backing file and initialises the control block. The
    /// caller becomes the initiator; `size` is the usable payload capacity.
    pub fn create(path: &Path, size: u32, overwrite: bool, permissions: Option<u32>) -> Result<Self> {
        Self::create_with_policy(path, size, overwrite, permissions, Box::new(RawFrames))
    }

    /// [`create`](Self::create) with a framing policy.
    pub fn create_with_policy(
        path: &Path,
        size: u32,
        overwrite: bool,
        permissions: Option<u32>,
        policy: Box<dyn FramePolicy>,
    ) -> Result<Self> {
        if size < 2 {
            return Err(Error::IllegalState);
        }

        let storage = MappedFile::create(path, size as usize + size_of::<ControlBlock>(), permissions)?;

        let buffer = Self {
            storage,
            policy,
            alerted: AtomicBool::new(false),
        };

        // SAFETY: freshly created region, zero-filled, no peers attached
        // yet. The lock and the plain layout fields are written through the
        // raw pointer before any shared reference to the block is formed.
        unsafe {
            let ctl = buffer.storage.base().cast::<ControlBlock>();
            SharedLock::init(std::ptr::addr_of_mut!((*ctl).lock));

            let size = (buffer.storage.len() - size_of::<ControlBlock>()) as u32;
            (*ctl).size = size;

            let mut mask: u32 = 1;
            let mut modulus: u32 = 1 << 31;
            while mask < size {
                mask = (mask << 1) | 1;
                modulus >>= 1;
            }
            (*ctl).index_mask = mask;
            (*ctl).round_modulus = modulus;
        }

        let ctl = buffer.control();
        ctl.head.store(0, Ordering::Relaxed);
        ctl.tail.store(0, Ordering::Relaxed);
        ctl.waiters.store(0, Ordering::Relaxed);
        ctl.state.store(
            if overwrite { STATE_OVERWRITE } else { 0 },
            Ordering::Relaxed,
        );
        ctl.locking_pid.store(0, Ordering::Relaxed);
        ctl.reserved.store(0, Ordering::Relaxed);
        ctl.reserved_written.store(0, Ordering::Relaxed);
        ctl.reserving_pid.store(0, Ordering::Relaxed);

        Ok(buffer)
    }

    /// Attaches to an existing buffer, validating the control block but
    /// never re-initialising it.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_policy(path, Box::new(RawFrames))
    }

    /// [`open`](Self::open) with a framing policy.
    pub fn open_with_policy(path: &Path, policy: Box<dyn FramePolicy>) -> Result<Self> {
        let storage = MappedFile::open(path)?;

        if storage.len() <= size_of::<ControlBlock>() {
            return Err(Error::IllegalState);
        }

        let buffer = Self {
            storage,
            policy,
            alerted: AtomicBool::new(false),
        };

        let ctl = buffer.control();
        let valid = ctl.size != 0
            && ctl.size as usize == buffer.storage.len() - size_of::<ControlBlock>()
            && ctl.index_mask >= ctl.size
            && ctl.round_modulus != 0;
        if !valid {
            return Err(Error::IllegalState);
        }

        Ok(buffer)
    }

    // ---------------------------------------------------------------------
    // STATUS
    // ---------------------------------------------------------------------

    #[inline]
    fn control(&self) -> &ControlBlock {
        // SAFETY: validated at construction; the mapping outlives self.
        unsafe { &*self.storage.base().cast::<ControlBlock>() }
    }

    #[inline]
    fn data(&self) -> *mut u8 {
        // SAFETY: the region is sized `ControlBlock` + `size` bytes.
        unsafe { self.storage.base().add(size_of::<ControlBlock>()) }
    }

    #[inline]
    fn byte_at(&self, index: u32) -> u8 {
        debug_assert!(index < self.control().size);
        // SAFETY: index is bounded by the payload size.
        unsafe { self.data().add(index as usize).read() }
    }

    fn used_of(&self, head: u32, tail: u32) -> u32 {
        let size = self.control().size;
        if head >= tail {
            head - tail
        } else {
            size - (tail - head)
        }
    }

    /// Bytes currently readable.
    pub fn used(&self) -> u32 {
        let ctl = self.control();
        let head = ctl.head.load(Ordering::Acquire);
        let tail = ctl.tail.load(Ordering::Acquire) & ctl.index_mask;
        self.used_of(head, tail)
    }

    /// Bytes currently writable (the complement of [`used`](Self::used)).
    pub fn free(&self) -> u32 {
        self.control().size - self.used()
    }

    /// Usable payload capacity.
    #[inline]
    pub fn size(&self) -> u32 {
        self.control().size
    }

    /// Path of the backing file.
    pub fn name(&self) -> &Path {
        self.storage.path()
    }

    pub fn is_locked(&self) -> bool {
        self.control().state.load(Ordering::Relaxed) & STATE_LOCKED != 0
    }

    pub fn lock_pid(&self) -> u32 {
        self.control().locking_pid.load(Ordering::Relaxed)
    }

    pub fn is_overwrite(&self) -> bool {
        self.control().state.load(Ordering::Relaxed) & STATE_OVERWRITE != 0
    }

    /// Owner of the open reservation, 0 when none. A pid that no longer
    /// exists here is a stuck buffer; reclaim is an operator concern.
    pub fn reserving_pid(&self) -> u32 {
        self.control().reserving_pid.load(Ordering::Acquire)
    }

    /// One-shot latch: true when overwrite policy has discarded data since
    /// the last call. Reading clears it.
    pub fn overwritten(&self) -> bool {
        let previous = self
            .control()
            .state
            .fetch_and(!STATE_OVERWRITTEN, Ordering::Relaxed);
        previous & STATE_OVERWRITTEN != 0
    }

    /// Discards all content.
    pub fn flush(&self) {
        let ctl = self.control();
        // Only the index part carries content; reusing head's index keeps
        // tail's round consistent with an empty buffer.
        let head = ctl.head.load(Ordering::Relaxed);
        ctl.tail.store(head, Ordering::Relaxed);
    }

    /// Removes the backing file (the mapping stays usable until drop).
    pub fn destroy(&self) -> Result<()> {
        self.storage.destroy()
    }

    // ---------------------------------------------------------------------
    // WRITE PATH
    // ---------------------------------------------------------------------

    /// Appends `data` and publishes `head`.
    ///
    /// Without a reservation the write either fits (strictly: one byte must
    /// stay free so full and empty remain distinguishable) or, with the
    /// overwrite flag set, evicts old content to make room. With the flag
    /// clear and no room, returns [`Error::WriteError`].
    ///
    /// During an open reservation held by this process, the write appends at
    /// `head + reserved_written` without moving `head`; the final write of
    /// the reservation publishes everything at once.
    pub fn write(&self, data: &[u8]) -> Result<u32> {
        let ctl = self.control();
        let length = data.len() as u32;

        debug_assert!(length > 0);
        debug_assert!(length < ctl.size);

        let head = ctl.head.load(Ordering::Acquire);
        let starting_empty = self.used() == 0;
        let write_start;
        let mut should_move_head = true;

        if ctl.reserving_pid.load(Ordering::Acquire) != 0 {
            // We are writing because of a reservation this process took.
            debug_assert_eq!(ctl.reserving_pid.load(Ordering::Relaxed), std::process::id());

            let already_written = ctl.reserved_written.load(Ordering::Relaxed);
            let reserved = ctl.reserved.load(Ordering::Relaxed);
            let new_written = already_written + length;
            debug_assert!(new_written <= reserved, "write exceeds reservation");

            write_start = (head + already_written) % ctl.size;
            ctl.reserved_written.store(new_written, Ordering::Relaxed);

            if new_written == reserved {
                // All reserved data present, close the reservation.
                ctl.reserving_pid.store(0, Ordering::Release);
            } else {
                // Not yet complete, hold off moving head.
                should_move_head = false;
            }
        } else {
            if !self.is_overwrite() && length >= self.free() {
                return Err(Error::WriteError);
            }

            self.assure_free_space(length);
            write_start = head;
        }

        let write_end = (write_start + length) % ctl.size;
        // SAFETY: write_start < size; the two-pass copy wraps at the region
        // end; the target range is free space no reader will touch until
        // head is published.
        unsafe { self.copy_in(write_start, data) };

        if should_move_head {
            ctl.head.store(write_end, Ordering::Release);

            if starting_empty {
                // Was empty before; tell observers about the new data.
                self.admin_lock();
                self.reevaluate();
                self.policy.data_available(self);
                self.admin_unlock();
                self.settle();
            }
        }

        Ok(length)
    }

    /// Claims `length` bytes (clamped to `size - 1`) ahead of writing them.
    ///
    /// At most one process may hold a reservation; a concurrent attempt
    /// fails with [`Error::IllegalState`]. With overwrite clear the claim
    /// fails with [`Error::WriteError`] when it cannot fit. Returns the
    /// actual number of bytes reserved.
    pub fn reserve(&self, length: u32) -> Result<u32> {
        let ctl = self.control();
        let actual = length.min(ctl.size - 1);

        if !self.is_overwrite() && actual >= self.free() {
            return Err(Error::WriteError);
        }

        let pid = std::process::id();
        if ctl
            .reserving_pid
            .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::IllegalState);
        }

        self.assure_free_space(actual);

        ctl.reserved.store(actual, Ordering::Relaxed);
        ctl.reserved_written.store(0, Ordering::Relaxed);

        Ok(actual)
    }

    /// Abandons a reservation this process holds without publishing data.
    pub(crate) fn cancel_reservation(&self) {
        let ctl = self.control();
        if ctl.reserving_pid.load(Ordering::Acquire) == std::process::id() {
            ctl.reserved.store(0, Ordering::Relaxed);
            ctl.reserved_written.store(0, Ordering::Relaxed);
            ctl.reserving_pid.store(0, Ordering::Release);
        }
    }

    /// Moves `tail` forward until more than `required` bytes are free,
    /// evicting content in whole policy-sized steps.
    fn assure_free_space(&self, required: u32) {
        let ctl = self.control();
        let mut old_tail = ctl.tail.load(Ordering::Acquire);

        loop {
            let tail_index = old_tail & ctl.index_mask;
            let free = ctl.size - self.used_of(ctl.head.load(Ordering::Relaxed), tail_index);
            if free > required {
                break;
            }

            // One extra byte keeps head != tail after the pending write.
            let deficit = required - free + 1;
            let mut cursor = Cursor::new(self, old_tail, deficit);
            let skip = self.policy.overwrite_size(&mut cursor);
            debug_assert!(free + skip > required);

            let new_tail = cursor.complete_tail(skip);
            match ctl
                .tail
                .compare_exchange(old_tail, new_tail, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    ctl.state.fetch_or(STATE_OVERWRITTEN, Ordering::Relaxed);
                    old_tail = new_tail;
                }
                Err(current) => old_tail = current,
            }
        }
    }

    // ---------------------------------------------------------------------
    // READ PATH
    // ---------------------------------------------------------------------

    /// Pops the next chunk into `buffer`.
    ///
    /// Returns the chunk size as the policy determined it, which with
    /// `partial` set may exceed what was copied (`buffer.len()`); the caller
    /// learns the size it should have offered. With `partial` clear a
    /// too-small destination leaves the buffer untouched and reports
    /// [`Error::Empty`].
    ///
    /// The tail advance is a single compare-exchange; losing the race to a
    /// concurrent reader restarts the whole procedure.
    pub fn read(&self, buffer: &mut [u8], partial: bool) -> Result<u32> {
        let ctl = self.control();
        debug_assert!(buffer.len() as u32 <= ctl.size);

        loop {
            let old_tail = ctl.tail.load(Ordering::Acquire);
            let head = ctl.head.load(Ordering::Acquire);
            let tail_index = old_tail & ctl.index_mask;

            let used = self.used_of(head, tail_index);
            if used == 0 {
                return Err(Error::Empty);
            }

            let mut cursor = Cursor::new(self, old_tail, used);
            let result = self.policy.read_size(&mut cursor);

            if result == 0 || (result as usize > buffer.len() && !partial) {
                return Err(Error::Empty);
            }

            let copy_len = (result as usize).min(buffer.len()) as u32;
            let offset = tail_index + cursor.offset();
            let mut round = old_tail / (ctl.index_mask + 1);

            if offset + result < ctl.size {
                // One pass.
                // SAFETY: offset + copy_len <= size, linear copy.
                unsafe { self.copy_out(offset, &mut buffer[..copy_len as usize]) };

                let new_tail = offset + result + round * (ctl.index_mask + 1);
                if ctl
                    .tail
                    .compare_exchange(old_tail, new_tail, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(result);
                }
            } else {
                // Wraps at the region end. A start beyond the end (the
                // record header itself wrapped) carries over to the region
                // start.
                let (part1, part2) = if ctl.size < offset {
                    (0, result - (offset - ctl.size))
                } else {
                    (ctl.size - offset, result - (ctl.size - offset))
                };

                let first = part1.min(copy_len);
                if first > 0 {
                    // SAFETY: offset + first <= size.
                    unsafe { self.copy_out(offset, &mut buffer[..first as usize]) };
                }
                if part1 < copy_len {
                    // SAFETY: continues from the region start.
                    unsafe { self.copy_out(0, &mut buffer[part1 as usize..copy_len as usize]) };
                }

                // Add one round, but prevent overflow.
                round = (round + 1) % ctl.round_modulus;
                let new_tail = part2 + round * (ctl.index_mask + 1);
                if ctl
                    .tail
                    .compare_exchange(old_tail, new_tail, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(result);
                }
            }
            // Another reader advanced tail underneath us; start over.
        }
    }

    /// Non-destructive read: copies up to `buffer.len()` bytes from the tail
    /// without advancing it. Retries while a concurrent reader moves the
    /// tail mid-copy.
    pub fn peek(&self, buffer: &mut [u8]) -> Result<u32> {
        let ctl = self.control();
        debug_assert!(buffer.len() as u32 <= ctl.size);

        loop {
            let old_tail = ctl.tail.load(Ordering::Acquire);
            let head = ctl.head.load(Ordering::Acquire);
            let tail_index = old_tail & ctl.index_mask;

            let used = self.used_of(head, tail_index);
            if used == 0 {
                return Err(Error::Empty);
            }

            let result = used.min(buffer.len() as u32);
            let first = result.min(ctl.size - tail_index);
            // SAFETY: tail_index + first <= size; remainder wraps to 0.
            unsafe {
                self.copy_out(tail_index, &mut buffer[..first as usize]);
                if first < result {
                    self.copy_out(0, &mut buffer[first as usize..result as usize]);
                }
            }

            // The copy is only coherent if no reader advanced the tail.
            if ctl.tail.load(Ordering::Acquire) == old_tail {
                return Ok(result);
            }
        }
    }

    // SAFETY: `at < size`; wraps at the region end in a second pass.
    unsafe fn copy_in(&self, at: u32, src: &[u8]) {
        let size = self.control().size;
        let first = (size - at).min(src.len() as u32) as usize;

        std::ptr::copy_nonoverlapping(src.as_ptr(), self.data().add(at as usize), first);
        if first < src.len() {
            std::ptr::copy_nonoverlapping(src.as_ptr().add(first), self.data(), src.len() - first);
        }
    }

    // SAFETY: `at + dst.len() <= size`; strictly linear.
    unsafe fn copy_out(&self, at: u32, dst: &mut [u8]) {
        std::ptr::copy_nonoverlapping(self.data().add(at as usize), dst.as_mut_ptr(), dst.len());
    }

    // ---------------------------------------------------------------------
    // ADMIN LOCK
    // ---------------------------------------------------------------------

    fn shared_lock(&self) -> &SharedLock {
        &self.control().lock
    }

    fn admin_lock(&self) {
        self.shared_lock().lock();
    }

    fn admin_unlock(&self) {
        self.shared_lock().unlock();
    }

    /// Wakes every blocked agent so it re-evaluates its predicate. Must be
    /// called with the admin mutex held.
    fn reevaluate(&self) {
        let ctl = self.control();
        if ctl.waiters.load(Ordering::Relaxed) > 0 {
            self.shared_lock().broadcast();
        }
    }

    /// Waits (bounded) until all woken agents have left the wait, so callers
    /// observe a consistent post-state. Must be called with the admin mutex
    /// released; woken waiters need it to exit.
    fn settle(&self) {
        let ctl = self.control();
        let backoff = Backoff::new();
        let mut patience = 10_000u32;
        while ctl.waiters.load(Ordering::Relaxed) > 0 && patience > 0 {
            backoff.snooze();
            patience -= 1;
        }
    }

    /// Takes the coarse cross-process lock.
    ///
    /// Blocks until no other process holds it and, when `data_present` is
    /// set, until the buffer is non-empty. A process that already owns the
    /// lock is granted it again immediately. `None` waits forever.
    pub fn lock(&self, data_present: bool, timeout: Option<Duration>) -> Result<()> {
        let ctl = self.control();
        let pid = std::process::id();

        // Per-process recursion: owning the lock means owning it for every
        // thread of this process.
        if ctl.locking_pid.load(Ordering::Relaxed) == pid {
            return Ok(());
        }

        self.admin_lock();

        let mut remaining = timeout;
        let result = loop {
            let state = ctl.state.load(Ordering::Relaxed);
            if state & STATE_LOCKED == 0 && (!data_present || self.used() > 0) {
                ctl.state.fetch_or(STATE_LOCKED, Ordering::Relaxed);
                ctl.locking_pid.store(pid, Ordering::Relaxed);
                break Ok(());
            }

            if remaining == Some(Duration::ZERO) {
                break Err(Error::TimedOut);
            }

            ctl.waiters.fetch_add(1, Ordering::Relaxed);
            remaining = match remaining {
                None => {
                    self.shared_lock().wait();
                    None
                }
                Some(budget) => {
                    let started = Instant::now();
                    if self.shared_lock().wait_timeout(budget) {
                        Some(Duration::ZERO)
                    } else {
                        Some(budget.saturating_sub(started.elapsed()))
                    }
                }
            };
            // Read the cancellation flag before leaving the waiter count:
            // `alert` only clears the flag once the count has drained.
            let alerted = self.alerted.load(Ordering::Relaxed);
            ctl.waiters.fetch_sub(1, Ordering::Relaxed);

            if alerted {
                break Err(Error::Alerted);
            }
        };

        self.admin_unlock();
        result
    }

    /// Releases the coarse lock. Only the owning process may unlock.
    pub fn unlock(&self) -> Result<()> {
        let ctl = self.control();

        self.admin_lock();
        let result = if ctl.locking_pid.load(Ordering::Relaxed) == std::process::id()
            && ctl.state.load(Ordering::Relaxed) & STATE_LOCKED != 0
        {
            ctl.locking_pid.store(0, Ordering::Relaxed);
            ctl.state.fetch_and(!STATE_LOCKED, Ordering::Relaxed);
            self.reevaluate();
            Ok(())
        } else {
            Err(Error::IllegalState)
        };
        self.admin_unlock();

        if result.is_ok() {
            self.settle();
        }
        result
    }

    /// Unblocks every agent of *this handle* currently waiting in
    /// [`lock`](Self::lock); each exits with [`Error::Alerted`]. The flag
    /// clears itself once the waiters have drained.
    pub fn alert(&self) {
        self.admin_lock();
        self.alerted.store(true, Ordering::Relaxed);
        self.reevaluate();
        self.admin_unlock();

        self.settle();
        self.alerted.store(false, Ordering::Relaxed);
    }
}
