//! Process-shared mutex/condvar pair.
//!
//! The pair lives *inside* the mapped region (at the head of the cyclic
//! buffer's control block) so that every attached process synchronises on the
//! same kernel object. Only the initiator runs [`SharedLock::init`]; everyone
//! else uses the primitives as-is.
//!
//! Timed waits use absolute `CLOCK_REALTIME` deadlines, matching
//! `pthread_cond_timedwait`'s default clock.

use std::cell::UnsafeCell;
use std::time::Duration;

/// The raw pthread pair. `#[repr(C)]` because the surrounding control block
/// is shared memory with a fixed layout.
#[repr(C)]
pub(crate) struct SharedLock {
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    cond: UnsafeCell<libc::pthread_cond_t>,
}

// SAFETY: the pthread objects are the synchronisation primitives themselves;
// the kernel arbitrates concurrent use from any thread or process.
unsafe impl Send for SharedLock {}
unsafe impl Sync for SharedLock {}

impl SharedLock {
    /// Initialises the pair with `PTHREAD_PROCESS_SHARED` attributes.
    ///
    /// # Safety
    ///
    /// `this` must point at writable, zeroed shared memory that no other
    /// process is using yet. Must be called exactly once per region.
    pub(crate) unsafe fn init(this: *mut SharedLock) {
        let mut mutex_attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        libc::pthread_mutexattr_init(&mut mutex_attr);
        libc::pthread_mutexattr_setpshared(&mut mutex_attr, libc::PTHREAD_PROCESS_SHARED);
        libc::pthread_mutex_init((*this).mutex.get(), &mutex_attr);
        libc::pthread_mutexattr_destroy(&mut mutex_attr);

        let mut cond_attr: libc::pthread_condattr_t = std::mem::zeroed();
        libc::pthread_condattr_init(&mut cond_attr);
        libc::pthread_condattr_setpshared(&mut cond_attr, libc::PTHREAD_PROCESS_SHARED);
        libc::pthread_cond_init((*this).cond.get(), &cond_attr);
        libc::pthread_condattr_destroy(&mut cond_attr);
    }

    pub(crate) fn lock(&self) {
        // SAFETY: the mutex was initialised by the region's initiator.
        unsafe {
            libc::pthread_mutex_lock(self.mutex.get());
        }
    }

    pub(crate) fn unlock(&self) {
        // SAFETY: only called by the thread that holds the mutex.
        unsafe {
            libc::pthread_mutex_unlock(self.mutex.get());
        }
    }

    /// Blocks on the condvar. The mutex must be held; it is released while
    /// waiting and re-acquired before returning.
    pub(crate) fn wait(&self) {
        // SAFETY: caller holds the mutex, per the condvar contract.
        unsafe {
            libc::pthread_cond_wait(self.cond.get(), self.mutex.get());
        }
    }

    /// Timed variant of [`wait`]. Returns `true` when the deadline passed
    /// without a signal.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: plain clock read into a local.
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
        }

        let nanos = now.tv_nsec as i64 + timeout.subsec_nanos() as i64;
        let deadline = libc::timespec {
            tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t + (nanos / 1_000_000_000),
            tv_nsec: (nanos % 1_000_000_000) as libc::c_long,
        };

        // SAFETY: caller holds the mutex, per the condvar contract.
        let rc = unsafe { libc::pthread_cond_timedwait(self.cond.get(), self.mutex.get(), &deadline) };
        rc == libc::ETIMEDOUT
    }

    /// Wakes every waiter. Emitted while the mutex is held so a waiter
    /// cannot slip past its predicate check.
    pub(crate) fn broadcast(&self) {
        // SAFETY: signalling an initialised condvar.
        unsafe {
            libc::pthread_cond_broadcast(self.cond.get());
        }
    }
}
