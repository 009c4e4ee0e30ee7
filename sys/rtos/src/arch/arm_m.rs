// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bare-metal backend for ARMv7-M / ARMv8-M.
//!
//! Binds the kernel's C entry points, embeds its control-block layouts, and
//! provides the supervisor-call stubs. The stubs follow the kernel's SVC
//! convention: the target function pointer travels in `r12`, arguments stay
//! in `r0..r3`, and the handler dispatches in privileged mode with the
//! argument registers untouched.

use core::cell::UnsafeCell;

use abi::{Priority, SignalSet, Status, TaskId};

use crate::{SignalWait, TaskEntry};

extern "C" {
    // Task services.
    fn krn_task_create(
        entry: TaskEntry,
        arg: usize,
        stack: *mut u8,
        prio_stksz: u32,
    ) -> u32;
    fn krn_task_terminate(id: u32) -> i32;
    fn krn_task_yield() -> i32;
    fn krn_task_current() -> u32;
    fn krn_task_priority(id: u32) -> i32;
    fn krn_task_delay(ms: u32) -> i32;
    /// Task control block for a live task id, for the post-create patches.
    fn krn_task_tcb(id: u32) -> *mut u8;

    // Semaphore, mutex and word-queue services. Each takes a pointer to a
    // control block embedded in the wrapper object.
    fn krn_sem_post(cb: *mut u32) -> i32;
    fn krn_sem_wait(cb: *mut u32, timeout_ms: u32) -> i32;
    fn krn_mutex_acquire(cb: *mut u32, timeout_ms: u32) -> i32;
    fn krn_mutex_release(cb: *mut u32) -> i32;
    fn krn_queue_init(cb: *mut u32, storage: *mut usize, capacity: usize) -> i32;
    fn krn_queue_put(cb: *mut u32, word: usize, timeout_ms: u32) -> i32;
    fn krn_queue_get(cb: *mut u32, out: *mut usize, timeout_ms: u32) -> i32;

    // Signal services.
    fn krn_signal_set(id: u32, flags: u32) -> i32;
    fn krn_signal_clear(id: u32, flags: u32) -> i32;
    fn krn_signal_wait(flags: u32, timeout_ms: u32, observed: *mut u32) -> i32;

    // The kernel's coarse tick counter, advanced by the tick interrupt.
    static KRN_TICK_COUNT: u32;
}

// Field offsets into the kernel's task control block. `priv_stack` is the
// size of the task-private stack the kernel would reclaim on exit; zeroing
// it keeps the kernel's hands off caller-owned memory. `ptask` is the entry
// function the debugger displays.
const TCB_PRIV_STACK: usize = 38;
const TCB_PTASK: usize = 48;

// SysTick registers.
const SYST_CSR: *const u32 = 0xE000_E010 as *const u32;
const SYST_CVR: *const u32 = 0xE000_E018 as *const u32;

#[inline(always)]
pub(crate) fn in_interrupt() -> bool {
    let ipsr: u32;
    unsafe {
        core::arch::asm!("mrs {}, IPSR", out(reg) ipsr, options(nomem, nostack));
    }
    ipsr != 0
}

#[inline(always)]
pub(crate) fn task_current() -> TaskId {
    TaskId(unsafe { krn_task_current() })
}

#[inline(always)]
pub(crate) fn task_priority(task: TaskId) -> Priority {
    let raw = unsafe { krn_task_priority(task.0) };
    debug_assert!((-3..=3).contains(&raw));
    Priority(raw as i8)
}

#[inline(always)]
pub(crate) fn task_yield() {
    let status = unsafe { krn_task_yield() };
    debug_assert!(Status::from_raw(status).is_ok());
}

#[inline(always)]
pub(crate) fn task_delay(ms: u32) -> Status {
    Status::from_raw(unsafe { krn_task_delay(ms) })
}

pub(crate) unsafe fn task_create(
    entry: TaskEntry,
    arg: usize,
    stack: *mut u8,
    stack_size: usize,
    priority: Priority,
) -> Option<TaskId> {
    // The create call packs the priority (rebased so idle is 1) into the low
    // byte and the stack size into the upper 24 bits.
    let prio_stksz =
        (priority.0 - Priority::IDLE.0 + 1) as u32 | ((stack_size as u32) << 8);
    let id = krn_task_create(entry, arg, stack, prio_stksz);
    if id == 0 {
        return None;
    }

    let tcb = krn_task_tcb(id);
    // The stack was not taken from the kernel's pool; zero the private stack
    // size so the kernel won't recycle the memory when the task exits.
    core::ptr::write_volatile(tcb.add(TCB_PRIV_STACK) as *mut u16, 0);
    // Point the debugger at the task's real entry function.
    core::ptr::write_volatile(tcb.add(TCB_PTASK) as *mut u32, entry as usize as u32);

    Some(TaskId(id))
}

pub(crate) unsafe fn task_terminate(task: TaskId) {
    krn_task_terminate(task.0);
}

#[inline(always)]
pub(crate) fn signal_set(task: TaskId, flags: SignalSet) -> Status {
    Status::from_raw(unsafe { krn_signal_set(task.0, flags as u32) })
}

#[inline(always)]
pub(crate) fn signal_clear(task: TaskId, flags: SignalSet) -> Status {
    Status::from_raw(unsafe { krn_signal_clear(task.0, flags as u32) })
}

pub(crate) fn signal_wait(flags: SignalSet, timeout_ms: u32) -> SignalWait {
    let mut observed: u32 = 0;
    let status =
        Status::from_raw(unsafe { krn_signal_wait(flags as u32, timeout_ms, &mut observed) });
    match status {
        Status::EventSignal => SignalWait::Signals(observed as SignalSet),
        Status::Ok | Status::EventTimeout => SignalWait::Timeout,
        other => SignalWait::Error(other),
    }
}

/// Control block of a kernel semaphore, embedded in [`crate::RawSemaphore`].
///
/// Required layout, word 0 low to high: `cb_type: u8`, one pad byte,
/// `tokens: u16`; word 1: wait-list link. The token count is readable
/// directly out of the block.
pub(crate) struct SemaphoreImpl {
    cb: UnsafeCell<[u32; 2]>,
}

const SEM_CB_TYPE: u32 = 2;

impl SemaphoreImpl {
    pub(crate) const fn new(initial: u16) -> Self {
        Self {
            cb: UnsafeCell::new([SEM_CB_TYPE | (initial as u32) << 16, 0]),
        }
    }

    #[inline]
    pub(crate) fn post(&self) {
        let status = unsafe { krn_sem_post(self.cb.get() as *mut u32) };
        debug_assert!(Status::from_raw(status).is_ok());
    }

    #[inline]
    pub(crate) fn wait(&self, timeout_ms: u32) -> bool {
        let status =
            Status::from_raw(unsafe { krn_sem_wait(self.cb.get() as *mut u32, timeout_ms) });
        debug_assert!(status.is_ok() || status.is_timeout_like());
        status.is_ok()
    }

    #[inline]
    pub(crate) fn value(&self) -> u16 {
        let word0 = unsafe { core::ptr::read_volatile(self.cb.get() as *const u32) };
        (word0 >> 16) as u16
    }
}

/// Control block of the kernel mutex, embedded in [`crate::RawMutex`].
///
/// Required layout: `cb_type: u8` and recursion level in word 0, wait-list
/// link, owner, and mutex-list link in the remaining words.
pub(crate) struct MutexImpl {
    cb: UnsafeCell<[u32; 4]>,
}

const MUTEX_CB_TYPE: u32 = 3;

impl MutexImpl {
    pub(crate) const fn new() -> Self {
        Self {
            cb: UnsafeCell::new([MUTEX_CB_TYPE, 0, 0, 0]),
        }
    }

    #[inline]
    pub(crate) fn acquire(&self, timeout_ms: u32) -> Status {
        Status::from_raw(unsafe { krn_mutex_acquire(self.cb.get() as *mut u32, timeout_ms) })
    }

    #[inline]
    pub(crate) fn release(&self) -> Status {
        Status::from_raw(unsafe { krn_mutex_release(self.cb.get() as *mut u32) })
    }
}

/// Control block of a kernel word queue, embedded in [`crate::RawQueue`].
pub(crate) struct QueueImpl {
    cb: UnsafeCell<[u32; 4]>,
}

impl QueueImpl {
    pub(crate) const fn new() -> Self {
        Self {
            cb: UnsafeCell::new([0; 4]),
        }
    }

    pub(crate) unsafe fn init(&self, storage: *mut usize, capacity: usize) {
        let status = krn_queue_init(self.cb.get() as *mut u32, storage, capacity);
        debug_assert!(Status::from_raw(status).is_ok());
    }

    #[inline]
    pub(crate) fn put(&self, word: usize, timeout_ms: u32) -> Status {
        Status::from_raw(unsafe { krn_queue_put(self.cb.get() as *mut u32, word, timeout_ms) })
    }

    #[inline]
    pub(crate) fn get(&self, timeout_ms: u32) -> Result<usize, Status> {
        let mut word: usize = 0;
        let status = Status::from_raw(unsafe {
            krn_queue_get(self.cb.get() as *mut u32, &mut word, timeout_ms)
        });
        match status {
            Status::EventMessage => Ok(word),
            other => Err(other),
        }
    }
}

#[inline(always)]
pub(crate) fn systick_value() -> u32 {
    // The hardware counts down from the reload value; the chained clock
    // wants a count-up within the interval.
    abi::SYSTICK_RELOAD - unsafe { core::ptr::read_volatile(SYST_CVR) }
}

#[inline(always)]
pub(crate) fn systick_overflow_pending() -> bool {
    // COUNTFLAG is clear-on-read; the consistent-pair retry loop in the
    // clock tolerates the occasional lost observation.
    unsafe { core::ptr::read_volatile(SYST_CSR) } & (1 << 16) != 0
}

#[inline(always)]
pub(crate) fn coarse_tick() -> u32 {
    unsafe { core::ptr::read_volatile(&KRN_TICK_COUNT) }
}

#[inline(always)]
pub(crate) fn data_memory_barrier() {
    cortex_m::asm::dmb();
}

/// Stub for single-argument supervisor calls.
#[naked]
pub(crate) unsafe extern "C" fn svc_call1(
    _f: unsafe extern "C" fn(usize) -> usize,
    _a0: usize,
) -> usize {
    cfg_if::cfg_if! {
        if #[cfg(any(armv7m, armv8m))] {
            core::arch::asm!("
                @ Target function travels in r12; shift the argument down.
                mov r12, r0
                mov r0, r1

                @ To the kernel!
                svc #0

                @ The handler leaves the return value in r0.
                bx lr
                ",
                options(noreturn),
            )
        } else {
            compile_error!("missing svc_call1 stub for ARM profile")
        }
    }
}

/// Stub for two-argument supervisor calls.
#[naked]
pub(crate) unsafe extern "C" fn svc_call2(
    _f: unsafe extern "C" fn(usize, usize) -> usize,
    _a0: usize,
    _a1: usize,
) -> usize {
    cfg_if::cfg_if! {
        if #[cfg(any(armv7m, armv8m))] {
            core::arch::asm!("
                @ Target function travels in r12; shift the arguments down.
                mov r12, r0
                mov r0, r1
                mov r1, r2

                @ To the kernel!
                svc #0

                bx lr
                ",
                options(noreturn),
            )
        } else {
            compile_error!("missing svc_call2 stub for ARM profile")
        }
    }
}

/// Stub for four-argument supervisor calls.
#[naked]
pub(crate) unsafe extern "C" fn svc_call4(
    _f: unsafe extern "C" fn(usize, usize, usize, usize) -> usize,
    _a0: usize,
    _a1: usize,
    _a2: usize,
    _a3: usize,
) -> usize {
    cfg_if::cfg_if! {
        if #[cfg(any(armv7m, armv8m))] {
            core::arch::asm!("
                @ Target function travels in r12; shift the register
                @ arguments down and fetch the fifth C-ABI argument from the
                @ stack (no prologue has run, so it sits at sp).
                mov r12, r0
                mov r0, r1
                mov r1, r2
                mov r2, r3
                ldr r3, [sp]

                @ To the kernel!
                svc #0

                bx lr
                ",
                options(noreturn),
            )
        } else {
            compile_error!("missing svc_call4 stub for ARM profile")
        }
    }
}
