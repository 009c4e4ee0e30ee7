// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Threads over caller-provided stack memory.
//!
//! A thread is created from an [`Attributes`] object (name, priority, stack)
//! and a callable. No heap is involved unless the caller asks for it: the
//! shared state that ties the handle to the running task is placed at the
//! base of the stack region itself, below the frames the task will use.
//!
//! # Lifecycle
//!
//! The shared state is reference counted, one reference for the handle and
//! one for the task. Two binary semaphores run the termination handshake:
//! the task posts `finished` when it is done, and the handle posts
//! `joined_or_detached` when its owner has decided the thread's fate. The
//! task stays alive until that decision -- so signals can still be
//! delivered to it -- and whichever side drops the last reference destroys
//! the state. The `finished` post and the task's termination happen inside
//! a single supervisor call, because the joiner may reuse the stack the
//! moment it observes the post.
//!
//! Dropping a handle that is still joinable is a bug and panics, as in the
//! standard threading model.
//!
//! # Stack usage inspection
//!
//! Unused stack is filled with a watermark before the task starts;
//! [`ThreadInfo::used_stack`] scans for the first surviving watermark word.
//! The measurement is probabilistic: a frame that legitimately stores the
//! watermark value fools it. Treat the number as an estimate.

use core::alloc::Layout;
use core::mem::{ManuallyDrop, MaybeUninit};
use core::ptr::{self, NonNull};

use abi::{Priority, SignalSet, TaskId, ALL_SIGNALS, MAX_STACK_SIZE, MIN_STACK_SIZE,
    STACK_ALIGN, STACK_WATERMARK};
use ringbuf::{ringbuf, ringbuf_entry};

use crate::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use crate::error::{Error, ErrorCode, Result};

#[derive(Copy, Clone, PartialEq)]
enum Trace {
    None,
    Spawned(u32),
    Exited(u32),
    CreateRefused,
}

ringbuf!(Trace, 16, Trace::None);

/// Identifier of a running thread.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ThreadId(pub(crate) TaskId);

impl PartialOrd for ThreadId {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ThreadId {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.0 .0.cmp(&other.0 .0)
    }
}

/// Returns the id of the calling thread.
pub fn current() -> ThreadId {
    ThreadId(rtos::task_current())
}

/// Triggers a rescheduling of the executing threads.
pub fn yield_now() {
    rtos::task_yield()
}

/// Number of threads that can run concurrently on this hardware.
pub fn hardware_concurrency() -> u32 {
    1
}

/// Aligned stack memory for a thread or async task.
///
/// ```ignore
/// static mut STACK: Stack<2048> = Stack::new();
/// ```
#[repr(align(8))]
pub struct Stack<const N: usize> {
    bytes: [MaybeUninit<u8>; N],
}

impl<const N: usize> Stack<N> {
    pub const fn new() -> Self {
        Self {
            bytes: [MaybeUninit::uninit(); N],
        }
    }

    /// The raw region to hand to [`Attributes::stack`].
    pub fn region(&mut self) -> &mut [MaybeUninit<u8>] {
        &mut self.bytes
    }
}

/// Thread attributes: name, priority, and stack.
///
/// The stack region, if given, must be `'static`: the thread may outlive
/// every frame of its creator, and the region stays in use until the thread
/// has been joined or has finished after a detach. Without a region, stack
/// memory comes from the heap -- if the `stack-allocation` feature is on
/// *and* [`set_stack_allocation_enabled`] has been called.
pub struct Attributes {
    name: &'static str,
    priority: Priority,
    stack: Option<&'static mut [MaybeUninit<u8>]>,
    stack_size: usize,
}

impl Attributes {
    pub const fn new() -> Self {
        Self {
            name: "",
            priority: Priority::NORMAL,
            stack: None,
            stack_size: 0,
        }
    }

    pub fn name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Provides the stack region the thread will run on.
    pub fn stack(mut self, region: &'static mut [MaybeUninit<u8>]) -> Self {
        self.stack = Some(region);
        self
    }

    /// Size of the heap-allocated stack used when no region is provided.
    /// Zero means "use the default size knob".
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub(crate) fn raw_name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn raw_priority(&self) -> Priority {
        self.priority
    }
}

impl Default for Attributes {
    fn default() -> Self {
        Self::new()
    }
}

// Runtime knobs for the heap-stack fallback, both off/zero by default.
static STACK_ALLOCATION_ENABLED: AtomicBool = AtomicBool::new(false);
static DEFAULT_STACK_SIZE: AtomicUsize = AtomicUsize::new(abi::DEFAULT_STACK_SIZE);

/// Allows or forbids heap allocation of thread stacks. Returns the previous
/// setting.
pub fn set_stack_allocation_enabled(enable: bool) -> bool {
    STACK_ALLOCATION_ENABLED.swap(enable, Ordering::SeqCst)
}

/// Sets the stack size used when neither the attributes nor the spawn call
/// specify one. Returns the previous value.
pub fn set_default_stack_size(size: usize) -> usize {
    DEFAULT_STACK_SIZE.swap(size, Ordering::SeqCst)
}

/// A stack region being carved up during thread construction. Owns the
/// backing memory if it came from the heap, until ownership is transferred
/// into the shared state.
pub(crate) struct RegionCursor {
    base: *mut u8,
    len: usize,
    initial_base: *mut u8,
    owned: Option<(*mut u8, Layout)>,
}

impl RegionCursor {
    pub(crate) fn resolve(attrs: &mut Attributes) -> Result<Self> {
        if let Some(region) = attrs.stack.take() {
            let base = region.as_mut_ptr() as *mut u8;
            return Ok(Self {
                base,
                len: region.len(),
                initial_base: base,
                owned: None,
            });
        }

        let mut size = attrs.stack_size;
        if size == 0 {
            size = DEFAULT_STACK_SIZE.load(Ordering::SeqCst);
        }
        if !STACK_ALLOCATION_ENABLED.load(Ordering::SeqCst) || size == 0 {
            return Err(Error::new(ErrorCode::NotEnoughMemory));
        }

        #[cfg(feature = "stack-allocation")]
        {
            let layout = Layout::from_size_align(size, STACK_ALIGN)
                .map_err(|_| Error::new(ErrorCode::InvalidArgument))?;
            // Safety: layout has non-zero size (checked above).
            let base = unsafe { alloc::alloc::alloc(layout) };
            if base.is_null() {
                return Err(Error::new(ErrorCode::NotEnoughMemory));
            }
            Ok(Self {
                base,
                len: size,
                initial_base: base,
                owned: Some((base, layout)),
            })
        }
        #[cfg(not(feature = "stack-allocation"))]
        {
            Err(Error::new(ErrorCode::NotEnoughMemory))
        }
    }

    pub(crate) fn initial_base(&self) -> *mut u8 {
        self.initial_base
    }

    pub(crate) fn remaining(&self) -> usize {
        self.len
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.base
    }

    fn align_to(&mut self, align: usize) -> bool {
        let addr = self.base as usize;
        let aligned = addr.wrapping_add(align - 1) & !(align - 1);
        let diff = aligned - addr;
        if self.len < diff {
            return false;
        }
        self.base = aligned as *mut u8;
        self.len -= diff;
        true
    }

    /// Aligns and reserves room for an object, returning its address and
    /// advancing past it.
    pub(crate) fn carve(&mut self, size: usize, align: usize) -> Result<*mut u8> {
        if !self.align_to(align) || self.len < size {
            return Err(Error::new(ErrorCode::NotEnoughMemory));
        }
        let at = self.base;
        self.base = unsafe { self.base.add(size) };
        self.len -= size;
        Ok(at)
    }

    /// Maximally aligns the remaining region for use as a task stack.
    pub(crate) fn max_align(&mut self) -> Result<()> {
        if self.align_to(STACK_ALIGN) {
            Ok(())
        } else {
            Err(Error::new(ErrorCode::NotEnoughMemory))
        }
    }

    /// Transfers ownership of heap-backed memory to the caller.
    pub(crate) fn take_owned(&mut self) -> (*mut u8, Layout) {
        match self.owned.take() {
            Some((p, layout)) => (p, layout),
            None => (ptr::null_mut(), Layout::new::<u8>()),
        }
    }
}

impl Drop for RegionCursor {
    fn drop(&mut self) {
        // Only reached on construction paths that failed before ownership
        // moved into a shared state.
        #[cfg(feature = "stack-allocation")]
        if let Some((p, layout)) = self.owned.take() {
            // Safety: we allocated it with this layout and nobody else has
            // seen it.
            unsafe { alloc::alloc::dealloc(p, layout) };
        }
    }
}

/// State shared between a thread handle and the running task. Placed at the
/// base of the task's stack region.
#[repr(C)]
pub(crate) struct ThreadState {
    /// Posted by the task when its function has returned; join blocks here.
    finished: rtos::RawSemaphore,
    /// Posted by the handle once join() or detach() has been called; the
    /// task blocks here to stay addressable (e.g. for signals).
    joined_or_detached: rtos::RawSemaphore,
    task: AtomicU32,
    /// One reference for the handle, one for the task (added when the task
    /// actually starts).
    refs: AtomicU32,
    /// Next state in the process-wide live-threads list. Mutated only in
    /// supervisor context.
    next: AtomicUsize,
    /// Heap memory this state owns and must free on destruction; null when
    /// the caller supplied the stack.
    owned_stack: *mut u8,
    owned_layout: Layout,
    /// Invoked after this state has been destroyed. The async launcher
    /// parks its region-release here: the region holds both its shared
    /// state and this thread state, so it can only be returned once the
    /// later of the two is gone.
    on_destroy: Option<(unsafe fn(usize), usize)>,
    /// Type-erased dispatch to the stored callable.
    run: unsafe fn(*mut ThreadState),
    // Cached attributes.
    name: &'static str,
    initial_stack_base: *mut u8,
    stack_begin: *mut u8,
    stack_size: usize,
    initial_priority: Priority,
}

/// The state header followed by the callable it dispatches to.
#[repr(C)]
struct ThreadPayload<F> {
    state: ThreadState,
    f: ManuallyDrop<F>,
}

fn run_plain<F: FnOnce()>(state: *mut ThreadState) {
    // Safety: `state` heads a ThreadPayload<F> (guaranteed by construction;
    // this function is only installed by create::<F>), and `run` is called
    // exactly once.
    let f = unsafe { ManuallyDrop::take(&mut (*(state as *mut ThreadPayload<F>)).f) };
    f();
}

#[cfg(feature = "fault-hook")]
static FAULT_HOOK: AtomicUsize = AtomicUsize::new(0);

/// Installs the hook that receives errors escaping fallible task bodies.
#[cfg(feature = "fault-hook")]
pub fn set_fault_hook(hook: fn(&Error)) {
    FAULT_HOOK.store(hook as usize, Ordering::SeqCst);
}

#[cfg(feature = "fault-hook")]
fn run_fallible<F: FnOnce() -> Result<()>>(state: *mut ThreadState) {
    // Safety: as in run_plain.
    let f = unsafe { ManuallyDrop::take(&mut (*(state as *mut ThreadPayload<F>)).f) };
    if let Err(e) = f() {
        let hook = FAULT_HOOK.load(Ordering::SeqCst);
        if hook != 0 {
            // Safety: only set_fault_hook stores here, always a fn(&Error).
            let hook: fn(&Error) = unsafe { core::mem::transmute(hook) };
            hook(&e);
        }
    }
}

// Head of the process-wide singly-linked list of live thread states.
// Mutated only in supervisor context.
static LIVE_THREADS: AtomicUsize = AtomicUsize::new(0);

/// Creates the kernel task and, on success, inserts the state at the head
/// of the live-threads list. Runs in supervisor context so creation and
/// registration are atomic against the scheduler.
unsafe extern "C" fn create_and_link(state: usize) -> usize {
    let st = &*(state as *const ThreadState);
    match rtos::task_create(
        task_entry,
        state,
        st.stack_begin,
        st.stack_size,
        st.initial_priority,
    ) {
        Some(id) => {
            st.task.store(id.0, Ordering::SeqCst);
            st.next.store(LIVE_THREADS.load(Ordering::SeqCst), Ordering::SeqCst);
            LIVE_THREADS.store(state, Ordering::SeqCst);
            ringbuf_entry!(Trace::Spawned(id.0));
            id.0 as usize
        }
        None => {
            ringbuf_entry!(Trace::CreateRefused);
            0
        }
    }
}

/// Removes a state from the live-threads list. Supervisor context only.
unsafe extern "C" fn unlink_state(state: usize) -> usize {
    if LIVE_THREADS.load(Ordering::SeqCst) == state {
        let next = (*(state as *const ThreadState)).next.load(Ordering::SeqCst);
        LIVE_THREADS.store(next, Ordering::SeqCst);
        return 0;
    }
    let mut iter = LIVE_THREADS.load(Ordering::SeqCst) as *const ThreadState;
    while !iter.is_null() {
        if (*iter).next.load(Ordering::SeqCst) == state {
            let next = (*(state as *const ThreadState)).next.load(Ordering::SeqCst);
            (*iter).next.store(next, Ordering::SeqCst);
            break;
        }
        iter = (*iter).next.load(Ordering::SeqCst) as *const ThreadState;
    }
    0
}

/// Posts the finished semaphore (if any) and terminates the task, in one
/// supervisor call. The two must be inseparable: the joiner may reuse this
/// task's stack the instant the post is observable.
unsafe extern "C" fn terminate_task(sema: usize, id: usize) -> usize {
    if sema != 0 {
        (*(sema as *const rtos::RawSemaphore)).post();
    }
    ringbuf_entry!(Trace::Exited(id as u32));
    rtos::task_terminate(TaskId(id as u32));
    0
}

/// Entry wrapper every task starts in. Runs the stored callable, holds the
/// task alive until the handle owner decides its fate, then performs the
/// refcount-decided half of the destruction handshake.
unsafe extern "C" fn task_entry(arg: usize) {
    let state = arg as *mut ThreadState;

    ((*state).run)(state);

    // Stay addressable until join() or detach().
    (*state).joined_or_detached.wait();

    let id = (*state).task.load(Ordering::SeqCst) as usize;
    if (*state).refs.fetch_sub(1, Ordering::AcqRel) == 1 {
        // The handle went first; this task destroys the state, then
        // terminates without posting.
        destroy(state);
        rtos::svc::call2(terminate_task, 0, id);
    } else {
        // The handle is still out there. Signal completion and terminate
        // together; the handle destroys the state.
        rtos::svc::call2(
            terminate_task,
            &(*state).finished as *const rtos::RawSemaphore as usize,
            id,
        );
    }
    // Hosted backend only: termination returns; fall straight off the
    // entry. The state must not be touched past this point.
}

/// Destroys a shared state: unregisters it, runs its destructor in place,
/// frees the owned stack if there is one, and fires the on-destroy hook.
unsafe fn destroy(state: *mut ThreadState) {
    rtos::svc::call1(unlink_state, state as usize);
    let owned = (*state).owned_stack;
    #[cfg(feature = "stack-allocation")]
    let layout = (*state).owned_layout;
    let hook = (*state).on_destroy;
    ptr::drop_in_place(state);
    #[cfg(feature = "stack-allocation")]
    if !owned.is_null() {
        // Safety: allocated in RegionCursor::resolve with this layout.
        alloc::alloc::dealloc(owned, layout);
    }
    #[cfg(not(feature = "stack-allocation"))]
    debug_assert!(owned.is_null());
    if let Some((f, arg)) = hook {
        f(arg);
    }
}

/// A thread handle.
///
/// The handle must be joined or detached before it is dropped; dropping a
/// joinable handle panics.
#[derive(Debug)]
pub struct Thread {
    state: Option<NonNull<ThreadState>>,
}

// Safety: the shared state is reference counted and all &self methods go
// through kernel services.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

/// Spawns a thread running `f`.
pub fn spawn<F>(attrs: Attributes, f: F) -> Result<Thread>
where
    F: FnOnce() + Send + 'static,
{
    create(attrs, f, run_plain::<F>)
}

/// Spawns a thread whose body may fail; an `Err` return is routed to the
/// installed fault hook.
#[cfg(feature = "fault-hook")]
pub fn spawn_fallible<F>(attrs: Attributes, f: F) -> Result<Thread>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    create(attrs, f, run_fallible::<F>)
}

/// Spawns a plain thread on an already-resolved stack region; the async
/// launcher uses this after carving its shared state out of the region.
/// `on_destroy` fires once the thread's shared state is gone.
pub(crate) fn spawn_in_region<F>(
    cursor: RegionCursor,
    name: &'static str,
    priority: Priority,
    on_destroy: Option<(unsafe fn(usize), usize)>,
    f: F,
) -> Result<Thread>
where
    F: FnOnce() + Send + 'static,
{
    create_in(cursor, name, priority, on_destroy, f, run_plain::<F>)
}

fn create<F>(mut attrs: Attributes, f: F, run: unsafe fn(*mut ThreadState)) -> Result<Thread> {
    let name = attrs.name;
    let priority = attrs.priority;
    let cursor = RegionCursor::resolve(&mut attrs)?;
    create_in(cursor, name, priority, None, f, run)
}

fn create_in<F>(
    mut cursor: RegionCursor,
    name: &'static str,
    priority: Priority,
    on_destroy: Option<(unsafe fn(usize), usize)>,
    f: F,
    run: unsafe fn(*mut ThreadState),
) -> Result<Thread> {
    // Invariant from here on: `on_destroy` fires exactly once -- at state
    // destruction on the success path, right here on failure.
    let payload = match cursor.carve(
        core::mem::size_of::<ThreadPayload<F>>(),
        core::mem::align_of::<ThreadPayload<F>>(),
    ) {
        Ok(p) => p as *mut ThreadPayload<F>,
        Err(e) => {
            if let Some((hook, arg)) = on_destroy {
                // Safety: the hook contract is the caller's; we only
                // guarantee the single invocation.
                unsafe { hook(arg) };
            }
            return Err(e);
        }
    };

    let initial_base = cursor.initial_base();
    let (owned_stack, owned_layout) = cursor.take_owned();

    // Safety: `payload` is properly aligned and sized for ThreadPayload<F>
    // (carve guarantees it) and unaliased.
    unsafe {
        ptr::write(
            payload,
            ThreadPayload {
                state: ThreadState {
                    finished: rtos::RawSemaphore::new(0),
                    joined_or_detached: rtos::RawSemaphore::new(0),
                    task: AtomicU32::new(0),
                    refs: AtomicU32::new(1),
                    next: AtomicUsize::new(0),
                    owned_stack,
                    owned_layout,
                    on_destroy,
                    run,
                    name,
                    initial_stack_base: initial_base,
                    stack_begin: ptr::null_mut(),
                    stack_size: 0,
                    initial_priority: priority,
                },
                f: ManuallyDrop::new(f),
            },
        );
    }

    let state = payload as *mut ThreadState;
    if let Err(e) = start_task(&mut cursor, state) {
        // Safety: the payload was fully written above and the callable was
        // never consumed; tear both down.
        unsafe {
            ManuallyDrop::drop(&mut (*payload).f);
            destroy(state);
        }
        return Err(e);
    }

    Ok(Thread {
        state: NonNull::new(state),
    })
}

/// Second half of construction: turns the rest of the region into the
/// task's stack and starts the task.
fn start_task(cursor: &mut RegionCursor, state: *mut ThreadState) -> Result<()> {
    cursor.max_align()?;

    if cursor.remaining() < MIN_STACK_SIZE || cursor.remaining() >= MAX_STACK_SIZE {
        return Err(Error::new(ErrorCode::InvalidArgument));
    }

    // Safety: `state` was placed by create(); the cursor now points past it.
    unsafe {
        (*state).stack_begin = cursor.base();
        (*state).stack_size = cursor.remaining();

        // Watermark the stack for later usage inspection.
        let words = cursor.remaining() / 4;
        let base = cursor.base() as *mut u32;
        for i in 0..words {
            base.add(i).write(STACK_WATERMARK);
        }

        let id = rtos::svc::call1(create_and_link, state as usize);
        if id == 0 {
            return Err(Error::new(ErrorCode::NoChildProcess));
        }

        // One reference for the handle, one for the task. The task cannot
        // have finished yet -- it blocks on joined_or_detached first -- so
        // this cannot race the task's own decrement.
        (*state).refs.fetch_add(1, Ordering::SeqCst);
    }
    Ok(())
}

impl Thread {
    /// True while the handle refers to a thread that has been neither
    /// joined nor detached.
    pub fn joinable(&self) -> bool {
        self.state.is_some()
    }

    /// Id of the thread, while joinable.
    pub fn id(&self) -> Option<ThreadId> {
        self.state.map(|s| {
            // Safety: joinable handle implies live state.
            let raw = unsafe { s.as_ref() }.task.load(Ordering::SeqCst);
            ThreadId(TaskId(raw))
        })
    }

    /// Blocks until the thread's function has returned, then releases the
    /// handle's reference.
    pub fn join(&mut self) -> Result<()> {
        let state = self
            .state
            .take()
            .ok_or_else(|| Error::new(ErrorCode::OperationNotPermitted))?;
        // Safety: we held a reference until this point.
        unsafe {
            let st = state.as_ptr();
            (*st).joined_or_detached.post();
            (*st).finished.wait();
            if (*st).refs.fetch_sub(1, Ordering::AcqRel) == 1 {
                destroy(st);
            }
        }
        Ok(())
    }

    /// Separates the running thread from this handle. The thread keeps
    /// running; whichever side finishes last frees the shared state.
    pub fn detach(&mut self) -> Result<()> {
        let state = self
            .state
            .take()
            .ok_or_else(|| Error::new(ErrorCode::OperationNotPermitted))?;
        // Safety: we held a reference until this point.
        unsafe {
            let st = state.as_ptr();
            (*st).joined_or_detached.post();
            if (*st).refs.fetch_sub(1, Ordering::AcqRel) == 1 {
                // The task finished first but still posts `finished` inside
                // its termination call; wait it out so destruction cannot
                // overlap the task's last steps.
                (*st).finished.wait();
                destroy(st);
            }
        }
        Ok(())
    }

    /// Sets signal flags on the thread.
    pub fn set_signals(&self, flags: SignalSet) -> Result<()> {
        debug_assert!(flags <= ALL_SIGNALS);
        let id = self
            .id()
            .ok_or_else(|| Error::new(ErrorCode::OperationNotPermitted))?;
        let status = rtos::signal_set(id.0, flags);
        if status.is_ok() {
            Ok(())
        } else {
            Err(Error::kernel(status))
        }
    }

    /// Clears signal flags on the thread.
    pub fn clear_signals(&self, flags: SignalSet) -> Result<()> {
        debug_assert!(flags <= ALL_SIGNALS);
        let id = self
            .id()
            .ok_or_else(|| Error::new(ErrorCode::OperationNotPermitted))?;
        let status = rtos::signal_clear(id.0, flags);
        if status.is_ok() {
            Ok(())
        } else {
            Err(Error::kernel(status))
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if self.state.is_some() {
            // As in the standard threading model: losing the last handle to
            // a running thread is unrecoverable.
            panic!("thread handle dropped while joinable");
        }
    }
}

/// A view of one live thread, yielded by [`for_each_thread`].
pub struct ThreadInfo<'a> {
    state: &'a ThreadState,
}

impl ThreadInfo<'_> {
    pub fn name(&self) -> &'static str {
        self.state.name
    }

    /// Base of the region the creator supplied (before alignment and the
    /// shared-state carve-out).
    pub fn stack_base(&self) -> *const u8 {
        self.state.initial_stack_base
    }

    /// Total stack bytes, measured from the supplied base.
    pub fn stack_size(&self) -> usize {
        self.state.stack_begin as usize + self.state.stack_size
            - self.state.initial_stack_base as usize
    }

    /// Estimated bytes of stack ever used, from the watermark scan. See the
    /// module docs for why this is a heuristic.
    pub fn used_stack(&self) -> usize {
        let begin = self.state.stack_begin as usize;
        let end = begin + self.state.stack_size;
        let mut iter = begin;
        // Safety: the state is on the live list, so the stack region is
        // still owned by the task.
        unsafe {
            while iter < end && *(iter as *const u32) == STACK_WATERMARK {
                iter += 4;
            }
        }
        let mut used = begin - self.state.initial_stack_base as usize;
        if iter < end {
            used += end - iter;
        }
        used
    }

    pub fn id(&self) -> ThreadId {
        ThreadId(TaskId(self.state.task.load(Ordering::SeqCst)))
    }

    pub fn priority(&self) -> Priority {
        rtos::task_priority(TaskId(self.state.task.load(Ordering::SeqCst)))
    }
}

struct ForEachCtx<'a> {
    f: &'a mut dyn FnMut(ThreadInfo<'_>) -> bool,
}

unsafe extern "C" fn iterate_states(ctx: usize) -> usize {
    let ctx = &mut *(ctx as *mut ForEachCtx<'_>);
    let mut iter = LIVE_THREADS.load(Ordering::SeqCst) as *const ThreadState;
    while !iter.is_null() {
        if !(ctx.f)(ThreadInfo { state: &*iter }) {
            break;
        }
        iter = (*iter).next.load(Ordering::SeqCst) as *const ThreadState;
    }
    0
}

/// Runs `f` on every live thread, stopping early when it returns false.
///
/// The walk happens in supervisor context so the list cannot change under
/// it; `f` therefore must not block (locking a mutex inside `f` is not an
/// option). Callable from an interrupt handler, where the walk runs
/// directly.
pub fn for_each_thread(mut f: impl FnMut(ThreadInfo<'_>) -> bool) {
    let mut ctx = ForEachCtx { f: &mut f };
    let p = &mut ctx as *mut ForEachCtx<'_> as usize;
    unsafe {
        if rtos::in_interrupt() {
            iterate_states(p);
        } else {
            rtos::svc::call1(iterate_states, p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;
    use std::sync::atomic::AtomicBool as StdAtomicBool;
    use std::sync::Arc;

    fn leaked_stack<const N: usize>() -> &'static mut [MaybeUninit<u8>] {
        Box::leak(Box::new(Stack::<N>::new())).region()
    }

    #[test]
    fn spawn_runs_and_joins() {
        let ran = Arc::new(StdAtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let mut t = spawn(
            Attributes::new().name("worker").stack(leaked_stack::<4096>()),
            move || flag.store(true, Ordering::SeqCst),
        )
        .unwrap();
        t.join().unwrap();
        assert!(ran.load(Ordering::SeqCst));
        assert!(!t.joinable());
        assert_eq!(t.join().unwrap_err(), ErrorCode::OperationNotPermitted);
    }

    #[test]
    fn spawn_without_stack_requires_the_knob() {
        let was = set_stack_allocation_enabled(false);
        let err = spawn(Attributes::new(), || {}).unwrap_err();
        assert_eq!(err, ErrorCode::NotEnoughMemory);
        set_stack_allocation_enabled(was);
    }

    #[test]
    fn tiny_stack_is_rejected() {
        let err = spawn(
            Attributes::new().stack(leaked_stack::<128>()),
            || {},
        )
        .unwrap_err();
        // After the shared state is carved out of 128 bytes there is less
        // than the 64-byte minimum left.
        assert!(
            err == ErrorCode::InvalidArgument || err == ErrorCode::NotEnoughMemory,
            "unexpected error {:?}",
            err.code()
        );
    }

    #[test]
    fn detach_releases_everything() {
        let mut t = spawn(Attributes::new().stack(leaked_stack::<4096>()), || {}).unwrap();
        t.detach().unwrap();
        assert!(!t.joinable());
    }

    #[test]
    fn live_list_sees_running_thread() {
        let hold = Arc::new(StdAtomicBool::new(true));
        let held = Arc::clone(&hold);
        let mut t = spawn(
            Attributes::new().name("listed").stack(leaked_stack::<4096>()),
            move || {
                while held.load(Ordering::SeqCst) {
                    std::thread::yield_now();
                }
            },
        )
        .unwrap();

        let mut found = false;
        for_each_thread(|info| {
            if info.name() == "listed" {
                found = true;
                assert!(info.stack_size() > 0);
                assert!(info.used_stack() <= info.stack_size());
                false
            } else {
                true
            }
        });
        assert!(found);

        hold.store(false, Ordering::SeqCst);
        t.join().unwrap();
    }
}
