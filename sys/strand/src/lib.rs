// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Portable concurrency and synchronization layer for minimal RTOS kernels.
//!
//! The kernel underneath provides primitive tasks, mutexes, semaphores,
//! signal flags, a word queue and timer ticks (see the `strand-rtos`
//! adapter); this crate builds the modern vocabulary on top of it: threads
//! over caller-provided stacks, mutexes and semaphores with timeouts,
//! condition variables, latches, synchronics, futures/promises, per-thread
//! signal sets, and message queues. None of the hot paths allocate -- thread
//! and future shared state is placed into the stack memory the caller hands
//! over.
//!
//! The load-bearing piece is [`twq::WaitQueue`], a priority-ordered,
//! interrupt-safe list of waiting tasks; condition variables, latches,
//! synchronics and the blocking side of futures are all built on it.
//!
//! # Context rules
//!
//! Interrupt handlers may call exactly: [`sync::Semaphore::post`],
//! [`sync::Condvar::notify_one`]/[`sync::Condvar::notify_all`],
//! [`sync::Latch::count_down`], [`sync::Synchronic::notify`],
//! [`twq::WaitQueue::notify_one`]/[`twq::WaitQueue::notify_all`], and
//! [`thread::for_each_thread`]. Everything that blocks or allocates is task
//! context only.
//!
//! # Priorities
//!
//! Wait queues record the waiter's priority when it enrolls and wake in
//! descending priority order. Priority *inheritance* is not implemented: a
//! low-priority task holding a lock a high-priority task wants can still be
//! preempted by a middle-priority task. Plan lock ownership accordingly.

#![no_std]

#[cfg(feature = "stack-allocation")]
extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod atomic;
pub mod error;
pub mod future;
pub mod mq;
pub mod signal;
pub mod sync;
pub mod thread;
pub mod time;
pub mod twq;

pub use abi::{Priority, SignalSet, Status, TaskId, ALL_SIGNALS, MAX_SIGNALS};
pub use error::{Error, ErrorCode, Result};
