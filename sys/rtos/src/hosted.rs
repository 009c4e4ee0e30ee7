// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hosted backend: a kernel simulation over `std`, for running the layer's
//! test suite on the build host.
//!
//! Tasks are plain OS threads with a registered priority; the supervisor
//! context becomes a process-wide lock, which gives supervisor-called
//! functions the same you-are-the-only-mutator guarantee the real kernel
//! gives them. The simulation makes no attempt at priority scheduling --
//! the layer's own ordering logic (the wait queue) is what the tests are
//! after, and it captures priorities itself.
//!
//! Two knobs exist purely for tests: [`set_coarse_tick_base`] repositions
//! the coarse tick counter so wrap behavior can be exercised in bounded
//! time, and [`with_interrupt_context`] runs a closure as if from an ISR
//! (interrupt flag set, scheduler held off).

use std::cell::Cell;
use std::collections::VecDeque;
use std::format;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};
use std::vec::Vec;

use abi::{Priority, SignalSet, Status, TaskId, WAIT_FOREVER};

use crate::{SignalWait, TaskEntry};

/// Locks without poison propagation; a panicking test thread must not take
/// the whole simulated kernel down with it.
fn plock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct SignalCell {
    state: Mutex<u16>,
    changed: Condvar,
}

struct TaskSlot {
    priority: Priority,
    signals: Arc<SignalCell>,
}

static TASKS: Mutex<Vec<TaskSlot>> = Mutex::new(Vec::new());

std::thread_local! {
    static CURRENT: Cell<u32> = const { Cell::new(0) };
    static IN_ISR: Cell<bool> = const { Cell::new(false) };
}

fn register(priority: Priority) -> u32 {
    let mut tasks = plock(&TASKS);
    tasks.push(TaskSlot {
        priority,
        signals: Arc::new(SignalCell {
            state: Mutex::new(0),
            changed: Condvar::new(),
        }),
    });
    tasks.len() as u32
}

fn current_id() -> u32 {
    CURRENT.with(|c| {
        if c.get() == 0 {
            // First contact from a thread the layer didn't create (the test
            // main thread, usually). Adopt it at normal priority.
            c.set(register(Priority::NORMAL));
        }
        c.get()
    })
}

fn signals_of(task: TaskId) -> Option<Arc<SignalCell>> {
    let tasks = plock(&TASKS);
    tasks
        .get((task.0 as usize).checked_sub(1)?)
        .map(|slot| Arc::clone(&slot.signals))
}

pub(crate) fn in_interrupt() -> bool {
    IN_ISR.with(|c| c.get())
}

pub(crate) fn task_current() -> TaskId {
    TaskId(current_id())
}

pub(crate) fn task_priority(task: TaskId) -> Priority {
    let tasks = plock(&TASKS);
    match (task.0 as usize).checked_sub(1).and_then(|i| tasks.get(i)) {
        Some(slot) => slot.priority,
        None => Priority::NORMAL,
    }
}

pub(crate) fn task_yield() {
    std::thread::yield_now();
}

pub(crate) fn task_delay(ms: u32) -> Status {
    std::thread::sleep(Duration::from_millis(ms as u64));
    Status::Ok
}

pub(crate) unsafe fn task_create(
    entry: TaskEntry,
    arg: usize,
    _stack: *mut u8,
    _stack_size: usize,
    priority: Priority,
) -> Option<TaskId> {
    let id = register(priority);
    let spawned = std::thread::Builder::new()
        .name(format!("task-{}", id))
        .spawn(move || {
            CURRENT.with(|c| c.set(id));
            // Safety: forwarded from our caller's contract.
            unsafe { entry(arg) }
        });
    match spawned {
        Ok(_) => Some(TaskId(id)),
        Err(_) => None,
    }
}

pub(crate) unsafe fn task_terminate(_task: TaskId) {
    // A hosted thread cannot be killed from outside. Self-terminating tasks
    // return from their entry function right after this call, which is the
    // hosted equivalent.
}

pub(crate) fn signal_set(task: TaskId, flags: SignalSet) -> Status {
    match signals_of(task) {
        Some(cell) => {
            *plock(&cell.state) |= flags;
            cell.changed.notify_all();
            Status::Ok
        }
        None => Status::ErrorParameter,
    }
}

pub(crate) fn signal_clear(task: TaskId, flags: SignalSet) -> Status {
    match signals_of(task) {
        Some(cell) => {
            *plock(&cell.state) &= !flags;
            Status::Ok
        }
        None => Status::ErrorParameter,
    }
}

pub(crate) fn signal_wait(flags: SignalSet, timeout_ms: u32) -> SignalWait {
    let cell = match signals_of(task_current()) {
        Some(cell) => cell,
        None => return SignalWait::Error(Status::ErrorParameter),
    };
    let deadline = deadline_from(timeout_ms);
    let mut state = plock(&cell.state);
    loop {
        if flags == 0 {
            if *state != 0 {
                let got = *state;
                *state = 0;
                return SignalWait::Signals(got);
            }
        } else if *state & flags == flags {
            *state &= !flags;
            return SignalWait::Signals(flags);
        }
        state = match wait_on(&cell.changed, state, deadline) {
            Some(guard) => guard,
            None => return SignalWait::Timeout,
        };
    }
}

/// Absolute deadline for a kernel timeout encoding. `None` is forever;
/// `Some(None)` is a poll.
fn deadline_from(timeout_ms: u32) -> Option<Option<Instant>> {
    match timeout_ms {
        WAIT_FOREVER => None,
        0 => Some(None),
        ms => Some(Some(Instant::now() + Duration::from_millis(ms as u64))),
    }
}

/// One round of condvar waiting against `deadline` (see [`deadline_from`]).
/// Returns the re-acquired guard, or `None` once the deadline has passed
/// (immediately for a zero timeout).
fn wait_on<'a, T>(
    cv: &Condvar,
    guard: MutexGuard<'a, T>,
    deadline: Option<Option<Instant>>,
) -> Option<MutexGuard<'a, T>> {
    match deadline {
        None => Some(cv.wait(guard).unwrap_or_else(|e| e.into_inner())),
        Some(None) => None,
        Some(Some(at)) => {
            let now = Instant::now();
            if now >= at {
                return None;
            }
            let (guard, _) = cv
                .wait_timeout(guard, at - now)
                .unwrap_or_else(|e| e.into_inner());
            Some(guard)
        }
    }
}

pub(crate) struct SemaphoreImpl {
    tokens: Mutex<u16>,
    available: Condvar,
}

impl SemaphoreImpl {
    pub(crate) const fn new(initial: u16) -> Self {
        Self {
            tokens: Mutex::new(initial),
            available: Condvar::new(),
        }
    }

    pub(crate) fn post(&self) {
        let mut tokens = plock(&self.tokens);
        *tokens = tokens.saturating_add(1);
        // Notify while still holding the lock: a woken waiter may be the
        // last reference holder and free the semaphore's memory as soon as
        // it reacquires the token mutex, so the condvar must not be touched
        // after the guard drops.
        self.available.notify_one();
    }

    pub(crate) fn wait(&self, timeout_ms: u32) -> bool {
        let deadline = deadline_from(timeout_ms);
        let mut tokens = plock(&self.tokens);
        loop {
            if *tokens > 0 {
                *tokens -= 1;
                return true;
            }
            tokens = match wait_on(&self.available, tokens, deadline) {
                Some(guard) => guard,
                None => return false,
            };
        }
    }

    pub(crate) fn value(&self) -> u16 {
        *plock(&self.tokens)
    }
}

struct MutexState {
    owner: u32,
    level: u32,
}

pub(crate) struct MutexImpl {
    state: Mutex<MutexState>,
    released: Condvar,
}

impl MutexImpl {
    pub(crate) const fn new() -> Self {
        Self {
            state: Mutex::new(MutexState { owner: 0, level: 0 }),
            released: Condvar::new(),
        }
    }

    pub(crate) fn acquire(&self, timeout_ms: u32) -> Status {
        let me = current_id();
        let deadline = deadline_from(timeout_ms);
        let mut state = plock(&self.state);
        loop {
            if state.owner == 0 {
                state.owner = me;
                state.level = 1;
                return Status::Ok;
            }
            if state.owner == me {
                // The kernel mutex is reentrant.
                state.level += 1;
                return Status::Ok;
            }
            state = match wait_on(&self.released, state, deadline) {
                Some(guard) => guard,
                None => {
                    return if timeout_ms == 0 {
                        Status::ErrorResource
                    } else {
                        Status::ErrorTimeoutResource
                    }
                }
            };
        }
    }

    pub(crate) fn release(&self) -> Status {
        let me = current_id();
        let mut state = plock(&self.state);
        if state.owner != me || state.level == 0 {
            return Status::ErrorResource;
        }
        state.level -= 1;
        if state.level == 0 {
            state.owner = 0;
            // Notify under the lock; see SemaphoreImpl::post.
            self.released.notify_one();
        }
        Status::Ok
    }
}

struct QueueState {
    items: VecDeque<usize>,
    capacity: usize,
}

pub(crate) struct QueueImpl {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl QueueImpl {
    pub(crate) const fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                capacity: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub(crate) unsafe fn init(&self, _storage: *mut usize, capacity: usize) {
        plock(&self.state).capacity = capacity;
    }

    pub(crate) fn put(&self, word: usize, timeout_ms: u32) -> Status {
        let deadline = deadline_from(timeout_ms);
        let mut state = plock(&self.state);
        if state.capacity == 0 {
            return Status::ErrorParameter;
        }
        loop {
            if state.items.len() < state.capacity {
                state.items.push_back(word);
                // Notify under the lock; see SemaphoreImpl::post.
                self.not_empty.notify_one();
                return Status::Ok;
            }
            state = match wait_on(&self.not_full, state, deadline) {
                Some(guard) => guard,
                None => {
                    return if timeout_ms == 0 {
                        Status::ErrorResource
                    } else {
                        Status::EventTimeout
                    }
                }
            };
        }
    }

    pub(crate) fn get(&self, timeout_ms: u32) -> Result<usize, Status> {
        let deadline = deadline_from(timeout_ms);
        let mut state = plock(&self.state);
        loop {
            if let Some(word) = state.items.pop_front() {
                // Notify under the lock; see SemaphoreImpl::post.
                self.not_full.notify_one();
                return Ok(word);
            }
            state = match wait_on(&self.not_empty, state, deadline) {
                Some(guard) => guard,
                None => {
                    return Err(if timeout_ms == 0 {
                        Status::ErrorResource
                    } else {
                        Status::EventTimeout
                    })
                }
            };
        }
    }
}

static TICK_BASE: AtomicU32 = AtomicU32::new(0);

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

fn cycles_now() -> u64 {
    let nanos = epoch().elapsed().as_nanos();
    (nanos * abi::SYSTEM_CLOCK_HZ as u128 / 1_000_000_000) as u64
}

pub(crate) fn systick_value() -> u32 {
    (cycles_now() % abi::TICKS_PER_INTERVAL as u64) as u32
}

pub(crate) fn systick_overflow_pending() -> bool {
    // The simulated coarse tick is always derived from the same cycle count
    // as the fast tick, so an overflow is never left pending.
    false
}

pub(crate) fn coarse_tick() -> u32 {
    let ticks = (cycles_now() / abi::TICKS_PER_INTERVAL as u64) as u32;
    TICK_BASE.load(Ordering::Relaxed).wrapping_add(ticks)
}

pub(crate) fn data_memory_barrier() {
    core::sync::atomic::fence(Ordering::SeqCst);
}

/// Test hook: offsets the coarse tick counter so its wrap can be reached in
/// bounded test time.
pub fn set_coarse_tick_base(base: u32) {
    TICK_BASE.store(base, Ordering::Relaxed);
}

static KERNEL: Mutex<()> = Mutex::new(());

pub(crate) unsafe fn svc_call1(f: unsafe extern "C" fn(usize) -> usize, a0: usize) -> usize {
    let _supervisor = plock(&KERNEL);
    f(a0)
}

pub(crate) unsafe fn svc_call2(
    f: unsafe extern "C" fn(usize, usize) -> usize,
    a0: usize,
    a1: usize,
) -> usize {
    let _supervisor = plock(&KERNEL);
    f(a0, a1)
}

pub(crate) unsafe fn svc_call4(
    f: unsafe extern "C" fn(usize, usize, usize, usize) -> usize,
    a0: usize,
    a1: usize,
    a2: usize,
    a3: usize,
) -> usize {
    let _supervisor = plock(&KERNEL);
    f(a0, a1, a2, a3)
}

/// Test hook: runs `f` as if from an interrupt handler. The interrupt flag
/// is visible through [`crate::in_interrupt`] and the supervisor lock is
/// held for the duration, which models an ISR firing while no task sits in
/// a supervisor call.
pub fn with_interrupt_context<R>(f: impl FnOnce() -> R) -> R {
    struct Restore;
    impl Drop for Restore {
        fn drop(&mut self) {
            IN_ISR.with(|c| c.set(false));
        }
    }

    let _supervisor = plock(&KERNEL);
    IN_ISR.with(|c| c.set(true));
    let _restore = Restore;
    f()
}
