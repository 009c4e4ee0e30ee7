// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mutexes over the kernel mutex.
//!
//! The kernel mutex is reentrant; the non-recursive types here detect
//! re-entry with a "locked by me" flag that is only ever touched while the
//! kernel mutex is held. An owner locking a [`Mutex`] again gets
//! `DeadlockWouldOccur` instead of silent recursion; the timed flavor
//! additionally sleeps out the remaining deadline before reporting failure,
//! so an owner can never re-acquire its own mutex early through the timed
//! path.
//!
//! No priority inheritance -- see the crate docs.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::time::Duration;

use abi::WAIT_FOREVER;
use rtos::RawMutex;

use crate::atomic::{AtomicBool, Ordering};
use crate::error::{Error, ErrorCode, Result};
use crate::time::{self, Instant};

/// A non-recursive mutex protecting a value.
pub struct Mutex<T> {
    raw: RawMutex,
    /// Set while some task owns the lock. Read and written only with the
    /// kernel mutex held, which is what makes re-entry detection sound.
    owned: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawMutex::new(),
            owned: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Locks the mutex, blocking until it is available. Re-entry by the
    /// owner fails with `DeadlockWouldOccur` and leaves the mutex unlocked
    /// once the error is handled.
    pub fn lock(&self) -> Result<MutexGuard<'_, T>> {
        let status = self.raw.acquire(WAIT_FOREVER);
        if !status.is_ok() {
            return Err(Error::kernel(status));
        }
        self.guard_or_reentry()?
            .ok_or_else(|| Error::new(ErrorCode::DeadlockWouldOccur))
    }

    /// Locks the mutex if it is free right now. `Ok(None)` when contended
    /// *or* on owner re-entry (which releases the extra level again).
    pub fn try_lock(&self) -> Result<Option<MutexGuard<'_, T>>> {
        let status = self.raw.acquire(0);
        if status.is_timeout_like() {
            return Ok(None);
        }
        if !status.is_ok() {
            return Err(Error::kernel(status));
        }
        self.guard_or_reentry()
    }

    /// With the kernel mutex freshly acquired: either take ownership or
    /// undo the acquisition because this task already owns the lock.
    fn guard_or_reentry(&self) -> Result<Option<MutexGuard<'_, T>>> {
        if self.owned.load(Ordering::Relaxed) {
            let status = self.raw.release();
            if !status.is_ok() {
                return Err(Error::kernel(status));
            }
            return Ok(None);
        }
        self.owned.store(true, Ordering::Relaxed);
        Ok(Some(MutexGuard {
            lock: self,
            _not_send: PhantomData,
        }))
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// RAII ownership of a [`Mutex`] (or the inner mutex of a [`TimedMutex`]).
pub struct MutexGuard<'a, T> {
    lock: &'a Mutex<T>,
    // Lock ownership is per task; the guard must not migrate.
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> core::fmt::Debug for MutexGuard<'a, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MutexGuard").finish_non_exhaustive()
    }
}

impl<'a, T> MutexGuard<'a, T> {
    /// The mutex this guard locks; used by the condition variable to
    /// re-acquire after a wait.
    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.lock
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: as above, exclusively.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.owned.store(false, Ordering::Relaxed);
        let status = self.lock.raw.release();
        debug_assert!(status.is_ok());
    }
}

/// A non-recursive mutex with timed locking.
pub struct TimedMutex<T> {
    inner: Mutex<T>,
}

impl<T> TimedMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, T>> {
        self.inner.lock()
    }

    pub fn try_lock(&self) -> Result<Option<MutexGuard<'_, T>>> {
        self.inner.try_lock()
    }

    /// Tries to lock within `d`. `Ok(None)` on timeout.
    pub fn try_lock_for(&self, d: Duration) -> Result<Option<MutexGuard<'_, T>>> {
        self.try_lock_until(Instant::now() + d)
    }

    /// Tries to lock before `deadline`. `Ok(None)` on timeout; kernel waits
    /// longer than the kernel's timeout limit are covered by looping.
    pub fn try_lock_until(&self, deadline: Instant) -> Result<Option<MutexGuard<'_, T>>> {
        loop {
            let (status, timed_out) = match time::remaining_ms(deadline) {
                None => (self.inner.raw.acquire(0), true),
                Some(ms) => (self.inner.raw.acquire(ms), false),
            };

            if status.is_ok() {
                if !self.inner.owned.load(Ordering::Relaxed) {
                    self.inner.owned.store(true, Ordering::Relaxed);
                    return Ok(Some(MutexGuard {
                        lock: &self.inner,
                        _not_send: PhantomData,
                    }));
                }
                // The owner locked its own mutex again. Undo the extra
                // level, then hold the caller to its full deadline so the
                // failure cannot be used as an early retry.
                let status = self.inner.raw.release();
                if !status.is_ok() {
                    return Err(Error::kernel(status));
                }
                if !timed_out {
                    time::sleep_until(deadline)?;
                }
                return Ok(None);
            }

            if !status.is_timeout_like() {
                return Err(Error::kernel(status));
            }
            if timed_out {
                return Ok(None);
            }
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

/// A recursive mutex: a direct passthrough to the reentrant kernel mutex.
///
/// Carries no data -- handing out `&mut` through recursive acquisitions
/// would alias -- so it guards regions, not values.
pub struct RecursiveMutex {
    raw: RawMutex,
}

impl RecursiveMutex {
    pub const fn new() -> Self {
        Self {
            raw: RawMutex::new(),
        }
    }

    pub fn lock(&self) -> Result<RecursiveMutexGuard<'_>> {
        let status = self.raw.acquire(WAIT_FOREVER);
        if !status.is_ok() {
            return Err(Error::kernel(status));
        }
        Ok(RecursiveMutexGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    pub fn try_lock(&self) -> Result<Option<RecursiveMutexGuard<'_>>> {
        let status = self.raw.acquire(0);
        if status.is_ok() {
            return Ok(Some(RecursiveMutexGuard {
                lock: self,
                _not_send: PhantomData,
            }));
        }
        if status.is_timeout_like() {
            Ok(None)
        } else {
            Err(Error::kernel(status))
        }
    }
}

impl Default for RecursiveMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// One level of ownership of a [`RecursiveMutex`].
pub struct RecursiveMutexGuard<'a> {
    lock: &'a RecursiveMutex,
    _not_send: PhantomData<*const ()>,
}

impl Drop for RecursiveMutexGuard<'_> {
    fn drop(&mut self) {
        let status = self.lock.raw.release();
        debug_assert!(status.is_ok());
    }
}

/// A recursive mutex with timed locking.
pub struct RecursiveTimedMutex {
    inner: RecursiveMutex,
}

impl RecursiveTimedMutex {
    pub const fn new() -> Self {
        Self {
            inner: RecursiveMutex::new(),
        }
    }

    pub fn lock(&self) -> Result<RecursiveMutexGuard<'_>> {
        self.inner.lock()
    }

    pub fn try_lock(&self) -> Result<Option<RecursiveMutexGuard<'_>>> {
        self.inner.try_lock()
    }

    pub fn try_lock_for(&self, d: Duration) -> Result<Option<RecursiveMutexGuard<'_>>> {
        self.try_lock_until(Instant::now() + d)
    }

    pub fn try_lock_until(&self, deadline: Instant) -> Result<Option<RecursiveMutexGuard<'_>>> {
        loop {
            let (status, timed_out) = match time::remaining_ms(deadline) {
                None => (self.inner.raw.acquire(0), true),
                Some(ms) => (self.inner.raw.acquire(ms), false),
            };
            if status.is_ok() {
                return Ok(Some(RecursiveMutexGuard {
                    lock: &self.inner,
                    _not_send: PhantomData,
                }));
            }
            if !status.is_timeout_like() {
                return Err(Error::kernel(status));
            }
            if timed_out {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_guards_data() {
        let m = Mutex::new(1);
        {
            let mut g = m.lock().unwrap();
            *g += 1;
        }
        assert_eq!(*m.lock().unwrap(), 2);
    }

    #[test]
    fn reentry_is_a_deadlock_error_and_leaves_the_mutex_usable() {
        let m = Mutex::new(());
        let g = m.lock().unwrap();
        assert_eq!(m.lock().unwrap_err(), ErrorCode::DeadlockWouldOccur);
        drop(g);
        // The failed re-entry must not have leaked a level.
        let g = m.lock().unwrap();
        drop(g);
    }

    #[test]
    fn try_lock_reports_reentry_as_failure() {
        let m = Mutex::new(());
        let _g = m.lock().unwrap();
        assert!(m.try_lock().unwrap().is_none());
    }

    #[test]
    fn recursive_mutex_nests() {
        let m = RecursiveMutex::new();
        let a = m.lock().unwrap();
        let b = m.lock().unwrap();
        let c = m.try_lock().unwrap();
        assert!(c.is_some());
        drop(c);
        drop(b);
        drop(a);
    }

    #[test]
    fn timed_reentry_sleeps_out_the_deadline() {
        let m = TimedMutex::new(());
        let _g = m.lock().unwrap();
        let before = Instant::now();
        let got = m.try_lock_for(Duration::from_millis(50)).unwrap();
        assert!(got.is_none());
        assert!(before.elapsed() >= Duration::from_millis(50));
    }
}
