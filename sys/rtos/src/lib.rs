// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thin adapter over the minimal RTOS underneath the concurrency layer.
//!
//! The kernel this crate fronts provides only primitive tasks, mutexes,
//! semaphores, signal flags, a bounded word queue, and timer ticks. This
//! crate pins down the exact surface the portable layer is allowed to touch
//! and keeps everything target-specific behind it.
//!
//! # Backends
//!
//! Two backends implement the surface:
//!
//! - `arch::arm_m` (selected on `target_os = "none"`): `extern "C"`
//!   bindings to the kernel plus naked-asm supervisor-call stubs. Control
//!   blocks for mutexes, semaphores and queues are embedded in the wrapper
//!   objects and laid out exactly as the kernel expects, so constructing a
//!   primitive never calls into the kernel.
//! - `hosted` (any other target): a kernel simulation over `std`, used to
//!   run the layer's test suite on the build host. It reproduces the
//!   scheduling-visible behavior the layer relies on -- per-task
//!   priorities, signal-flag semantics, the serialized supervisor context --
//!   without pretending to be a real scheduler.
//!
//! # Supervisor calls
//!
//! [`svc::call1`]/[`svc::call2`]/[`svc::call4`] run a free function in
//! supervisor context so that list mutations are atomic against task
//! switching. Never use them from interrupt context; interrupt-context
//! callers must invoke the target function directly (the interrupt already
//! outranks the scheduler). Test with [`in_interrupt`] when a call site can
//! be reached from both contexts.

#![no_std]
#![cfg_attr(target_os = "none", feature(naked_functions))]

pub use abi::{Priority, SignalSet, Status, TaskId};

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        mod arch;
        use crate::arch::arm_m as imp;
    } else {
        extern crate std;
        pub mod hosted;
        use crate::hosted as imp;
    }
}

/// Entry point signature the kernel invokes for a new task.
pub type TaskEntry = unsafe extern "C" fn(usize);

/// Returns true when executing in interrupt context.
#[inline(always)]
pub fn in_interrupt() -> bool {
    imp::in_interrupt()
}

/// Id of the calling task.
#[inline(always)]
pub fn task_current() -> TaskId {
    imp::task_current()
}

/// Scheduling priority of a task. Callable from supervisor context.
#[inline(always)]
pub fn task_priority(task: TaskId) -> Priority {
    imp::task_priority(task)
}

/// Yields the processor to another ready task of the same priority.
#[inline(always)]
pub fn task_yield() {
    imp::task_yield()
}

/// Blocks the calling task for `ms` milliseconds. Raw single-shot delay;
/// callers needing deadlines beyond [`abi::MAX_TIMEOUT_MS`] loop.
#[inline(always)]
pub fn task_delay(ms: u32) -> Status {
    imp::task_delay(ms)
}

/// Asks the kernel to create a task running `entry(arg)` on the given stack.
///
/// On the bare-metal backend this also patches the task control block so the
/// kernel will not recycle the caller-owned stack when the task exits.
/// Returns `None` if the kernel refuses.
///
/// # Safety
///
/// `stack` must point to a region of `stack_size` bytes that stays valid and
/// unused by anything else until the task has terminated.
pub unsafe fn task_create(
    entry: TaskEntry,
    arg: usize,
    stack: *mut u8,
    stack_size: usize,
    priority: Priority,
) -> Option<TaskId> {
    imp::task_create(entry, arg, stack, stack_size, priority)
}

/// Terminates a task.
///
/// On the bare-metal backend this does not return when `task` is the caller.
/// The hosted backend cannot kill a thread, so there a self-terminating task
/// returns and is expected to fall off the end of its entry function
/// immediately afterwards.
///
/// # Safety
///
/// Terminating a task that holds kernel resources leaks them; callers must
/// sequence this after all handshakes that release such resources.
pub unsafe fn task_terminate(task: TaskId) {
    imp::task_terminate(task)
}

/// Sets signal flags on a task.
#[inline(always)]
pub fn signal_set(task: TaskId, flags: SignalSet) -> Status {
    imp::signal_set(task, flags)
}

/// Clears signal flags on a task.
#[inline(always)]
pub fn signal_clear(task: TaskId, flags: SignalSet) -> Status {
    imp::signal_clear(task, flags)
}

/// Outcome of [`signal_wait`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SignalWait {
    /// The wait was satisfied; these flags were observed and cleared.
    Signals(SignalSet),
    /// The timeout ran out (or, for a zero timeout, the condition did not
    /// hold right now).
    Timeout,
    /// The kernel refused the wait.
    Error(Status),
}

/// Waits on the calling task's signal flags.
///
/// With `flags == 0` the wait is satisfied by *any* flag becoming set; all
/// set flags are returned and cleared. With a non-zero mask the wait is
/// satisfied only when *all* requested flags are set; exactly those flags
/// are cleared. `timeout_ms` of zero polls; [`abi::WAIT_FOREVER`] blocks
/// indefinitely.
#[inline(always)]
pub fn signal_wait(flags: SignalSet, timeout_ms: u32) -> SignalWait {
    imp::signal_wait(flags, timeout_ms)
}

/// A binary/counting kernel semaphore with an embedded control block.
///
/// Constructing one is free; the kernel first sees the control block when a
/// task blocks on it. `post` is safe to call from interrupt context.
pub struct RawSemaphore {
    imp: imp::SemaphoreImpl,
}

unsafe impl Sync for RawSemaphore {}
unsafe impl Send for RawSemaphore {}

impl RawSemaphore {
    pub const fn new(initial: u16) -> Self {
        Self {
            imp: imp::SemaphoreImpl::new(initial),
        }
    }

    /// Releases one token. ISR-safe.
    #[inline]
    pub fn post(&self) {
        self.imp.post()
    }

    /// Acquires a token, blocking indefinitely.
    #[inline]
    pub fn wait(&self) {
        let ok = self.imp.wait(abi::WAIT_FOREVER);
        debug_assert!(ok);
    }

    /// Acquires a token if one is immediately available.
    #[inline]
    pub fn try_wait(&self) -> bool {
        self.imp.wait(0)
    }

    /// Acquires a token, giving up after `ms` milliseconds
    /// (`ms <= abi::MAX_TIMEOUT_MS`). Returns true if a token was taken.
    #[inline]
    pub fn wait_timeout(&self, ms: u32) -> bool {
        debug_assert!(ms <= abi::MAX_TIMEOUT_MS);
        self.imp.wait(ms)
    }

    /// Current token count, read from the control block.
    #[inline]
    pub fn value(&self) -> u16 {
        self.imp.value()
    }
}

/// The kernel mutex with an embedded control block.
///
/// The kernel mutex is reentrant and owner-tracked; the layered mutex types
/// build both recursive and non-recursive semantics on top of this one
/// primitive.
pub struct RawMutex {
    imp: imp::MutexImpl,
}

unsafe impl Sync for RawMutex {}
unsafe impl Send for RawMutex {}

impl RawMutex {
    pub const fn new() -> Self {
        Self {
            imp: imp::MutexImpl::new(),
        }
    }

    /// Acquires the mutex. `timeout_ms` of zero polls, `abi::WAIT_FOREVER`
    /// blocks. Returns `Status::Ok` on acquisition; the timeout-like
    /// statuses report contention.
    #[inline]
    pub fn acquire(&self, timeout_ms: u32) -> Status {
        self.imp.acquire(timeout_ms)
    }

    /// Releases one level of ownership.
    #[inline]
    pub fn release(&self) -> Status {
        self.imp.release()
    }
}

/// The kernel's bounded word queue with an embedded control block.
///
/// Carries bare machine words; the layered message queue bit-copies small
/// values and passes pool pointers for large ones.
pub struct RawQueue {
    imp: imp::QueueImpl,
}

unsafe impl Sync for RawQueue {}
unsafe impl Send for RawQueue {}

impl RawQueue {
    pub const fn new() -> Self {
        Self {
            imp: imp::QueueImpl::new(),
        }
    }

    /// Hands the queue its backing storage and capacity. Must be called
    /// exactly once, before the first `put`/`get`.
    ///
    /// # Safety
    ///
    /// `storage` must point to `capacity` words that stay valid and
    /// exclusively owned by this queue for as long as the queue is used.
    #[inline]
    pub unsafe fn init(&self, storage: *mut usize, capacity: usize) {
        self.imp.init(storage, capacity)
    }

    /// Enqueues one word. Returns `Status::Ok`, or a timeout-like status if
    /// the queue stayed full for the whole timeout.
    #[inline]
    pub fn put(&self, word: usize, timeout_ms: u32) -> Status {
        self.imp.put(word, timeout_ms)
    }

    /// Dequeues one word, or reports why not.
    #[inline]
    pub fn get(&self, timeout_ms: u32) -> Result<usize, Status> {
        self.imp.get(timeout_ms)
    }
}

/// Count-up value of the fast tick within the current coarse interval, in
/// system-clock cycles (0..=`abi::SYSTICK_RELOAD`).
#[inline(always)]
pub fn systick_value() -> u32 {
    imp::systick_value()
}

/// True when the fast tick has wrapped but the coarse counter has not yet
/// been advanced by the tick interrupt.
#[inline(always)]
pub fn systick_overflow_pending() -> bool {
    imp::systick_overflow_pending()
}

/// The kernel's coarse tick counter (wraps at 2^32).
#[inline(always)]
pub fn coarse_tick() -> u32 {
    imp::coarse_tick()
}

/// Full data memory barrier.
#[inline(always)]
pub fn data_memory_barrier() {
    imp::data_memory_barrier()
}

pub mod svc {
    //! Supervisor-call indirection.
    //!
    //! Each call raises a software interrupt; the kernel's SVC handler reads
    //! the target function out of `r12` and invokes it in privileged mode
    //! with the original `r0..r3` intact. Task-context only.

    use super::imp;

    /// Runs `f(a0)` in supervisor context.
    ///
    /// # Safety
    ///
    /// `f` must be safe to run in privileged mode with the given argument,
    /// and the caller must be in task context.
    #[inline(always)]
    pub unsafe fn call1(f: unsafe extern "C" fn(usize) -> usize, a0: usize) -> usize {
        imp::svc_call1(f, a0)
    }

    /// Runs `f(a0, a1)` in supervisor context.
    ///
    /// # Safety
    ///
    /// As [`call1`].
    #[inline(always)]
    pub unsafe fn call2(
        f: unsafe extern "C" fn(usize, usize) -> usize,
        a0: usize,
        a1: usize,
    ) -> usize {
        imp::svc_call2(f, a0, a1)
    }

    /// Runs `f(a0, a1, a2, a3)` in supervisor context.
    ///
    /// # Safety
    ///
    /// As [`call1`].
    #[inline(always)]
    pub unsafe fn call4(
        f: unsafe extern "C" fn(usize, usize, usize, usize) -> usize,
        a0: usize,
        a1: usize,
        a2: usize,
        a3: usize,
    ) -> usize {
        imp::svc_call4(f, a0, a1, a2, a3)
    }
}
