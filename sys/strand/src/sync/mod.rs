// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronization primitives: mutexes, semaphores, condition variables,
//! latches, and synchronics.

mod condvar;
mod latch;
mod mutex;
mod semaphore;
mod synchronic;

pub use condvar::{Condvar, CvStatus};
pub use latch::Latch;
pub use mutex::{
    Mutex, MutexGuard, RecursiveMutex, RecursiveMutexGuard, RecursiveTimedMutex,
    TimedMutex,
};
pub use semaphore::Semaphore;
pub use synchronic::{ExpectHint, NotifyHint, Synchronic};
