// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Futures, promises, and the one-shot shared state behind them.
//!
//! A shared state is a reference-counted object common to a producer (a
//! [`Promise`] or an async worker task) and a consumer (a [`Future`]). It
//! holds either a value or an error, published exactly once; `READY` is the
//! publication barrier. [`spawn`] places the state into the base of the
//! worker's stack region -- the same no-heap placement discipline threads
//! use for their own shared state -- and returns the future referring to
//! it.
//!
//! Errors take the place of exceptions throughout: the producer stores an
//! [`Error`], and [`Future::get`] returns it instead of rethrowing.

use core::alloc::Layout;
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::mem::MaybeUninit;
use core::ptr::{self, NonNull};
use core::time::Duration;

use bitflags::bitflags;
use rtos::RawSemaphore;

use crate::atomic::{AtomicU32, Ordering};
use crate::error::{Error, ErrorCode, Result};
use crate::thread::{self, Attributes, RegionCursor};
use crate::time::{self, Instant};

bitflags! {
    struct StateFlags: u32 {
        /// A future has been handed out for this state.
        const FUTURE_ATTACHED = 0x01;
        /// Some producer has begun storing the result.
        const BEING_SATISFIED = 0x02;
        /// The value slot holds a live value that must be dropped.
        const VALUE_CONSTRUCTED = 0x04;
        /// The result (value or error) is published.
        const READY = 0x08;
    }
}

/// Outcome of a timed wait on a future.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FutureStatus {
    Ready,
    Timeout,
}

/// One-shot wake-up: the producer posts once, and every wait re-posts so
/// later waiters (and the destroy path) get through too.
struct OneshotNotifier {
    sema: RawSemaphore,
}

impl OneshotNotifier {
    const fn new() -> Self {
        Self {
            sema: RawSemaphore::new(0),
        }
    }

    fn notify(&self) {
        self.sema.post();
    }

    fn wait(&self) {
        self.sema.wait();
        self.sema.post();
    }

    fn wait_until(&self, deadline: Instant) -> bool {
        loop {
            match time::remaining_ms(deadline) {
                None => {
                    if self.sema.try_wait() {
                        self.sema.post();
                        return true;
                    }
                    return false;
                }
                Some(ms) => {
                    if self.sema.wait_timeout(ms) {
                        self.sema.post();
                        return true;
                    }
                }
            }
        }
    }
}

/// Where a shared state's memory came from, hence how to give it back.
#[derive(Copy, Clone, Eq, PartialEq)]
enum Placement {
    /// Its own heap allocation (promise-created states).
    Heap,
    /// Placed into a stack region; the region itself is owned iff
    /// `owned_stack` is non-null.
    InPlace,
}

/// Type-erased head of every shared state.
#[repr(C)]
struct SharedHeader {
    /// One reference for each attached endpoint (initially the creator).
    refs: AtomicU32,
    flags: AtomicU32,
    /// Error slot; written under `BEING_SATISFIED` exclusivity.
    err: UnsafeCell<Option<Error>>,
    ready: OneshotNotifier,
    /// Stack memory this state owns and frees on destruction (async states
    /// whose region came from the heap).
    owned_stack: *mut u8,
    owned_layout: Layout,
    placement: Placement,
    /// Async states must synchronize with the producer's final post before
    /// the state (and the semaphore in it) can be torn down.
    wait_before_destroy: bool,
    /// Monomorphized destructor for the full `SharedState<T>`.
    destroy: unsafe fn(*mut SharedHeader),
}

/// A shared state for values of type `T`.
#[repr(C)]
struct SharedState<T> {
    h: SharedHeader,
    value: UnsafeCell<MaybeUninit<T>>,
}

unsafe fn destroy_state<T>(h: *mut SharedHeader) {
    let s = h as *mut SharedState<T>;
    if (*h).flags.load(Ordering::Acquire) & StateFlags::VALUE_CONSTRUCTED.bits() != 0 {
        ptr::drop_in_place((*s).value.get() as *mut T);
    }
    let placement = (*h).placement;
    let owned = (*h).owned_stack;
    #[cfg(feature = "stack-allocation")]
    let owned_layout = (*h).owned_layout;
    ptr::drop_in_place(s);
    match placement {
        Placement::Heap => {
            #[cfg(feature = "stack-allocation")]
            // Safety: heap states are allocated in Promise::new with
            // exactly this layout.
            alloc::alloc::dealloc(s as *mut u8, Layout::new::<SharedState<T>>());
            #[cfg(not(feature = "stack-allocation"))]
            unreachable!();
        }
        Placement::InPlace => {
            #[cfg(feature = "stack-allocation")]
            if !owned.is_null() {
                // Safety: allocated by RegionCursor::resolve.
                alloc::alloc::dealloc(owned, owned_layout);
            }
            #[cfg(not(feature = "stack-allocation"))]
            debug_assert!(owned.is_null());
        }
    }
}

/// Drops one reference; the last one destroys the state.
unsafe fn release_ref(h: *mut SharedHeader) {
    if (*h).refs.fetch_sub(1, Ordering::AcqRel) == 1 {
        if (*h).wait_before_destroy {
            // Ride the semaphore even if READY is already visible: this is
            // what guarantees the producer has fully left the notifier.
            (*h).ready.wait();
        }
        ((*h).destroy)(h);
    }
}

impl<T> SharedState<T> {
    /// Claims the right to satisfy the state.
    fn start_setting(&self) -> Result<()> {
        let mut flags = self.h.flags.load(Ordering::Acquire);
        loop {
            if flags & StateFlags::BEING_SATISFIED.bits() != 0 {
                return Err(Error::new(ErrorCode::PromiseAlreadySatisfied));
            }
            match self.h.flags.compare_exchange(
                flags,
                flags | StateFlags::BEING_SATISFIED.bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => flags = observed,
            }
        }
    }

    /// Marks the single allowed future as handed out.
    fn attach_future(&self) -> Result<()> {
        let mut flags = self.h.flags.load(Ordering::Acquire);
        loop {
            if flags & StateFlags::FUTURE_ATTACHED.bits() != 0 {
                return Err(Error::new(ErrorCode::FutureAlreadyRetrieved));
            }
            match self.h.flags.compare_exchange(
                flags,
                flags | StateFlags::FUTURE_ATTACHED.bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => flags = observed,
            }
        }
    }

    fn set_value(&self, value: T) -> Result<()> {
        self.start_setting()?;
        // Safety: BEING_SATISFIED gives us exclusive write access, and no
        // reader looks before READY.
        unsafe {
            (*self.value.get()).write(value);
        }
        self.h.flags.fetch_or(
            (StateFlags::VALUE_CONSTRUCTED | StateFlags::READY).bits(),
            Ordering::Release,
        );
        self.h.ready.notify();
        Ok(())
    }

    fn set_error(&self, e: Error) -> Result<()> {
        self.start_setting()?;
        // Safety: as in set_value.
        unsafe {
            *self.h.err.get() = Some(e);
        }
        self.h
            .flags
            .fetch_or(StateFlags::READY.bits(), Ordering::Release);
        self.h.ready.notify();
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.h.flags.load(Ordering::Acquire) & StateFlags::READY.bits() != 0
    }

    fn wait(&self) {
        if !self.is_ready() {
            self.h.ready.wait();
        }
    }

    fn wait_until(&self, deadline: Instant) -> FutureStatus {
        if self.is_ready() || self.h.ready.wait_until(deadline) {
            FutureStatus::Ready
        } else {
            FutureStatus::Timeout
        }
    }

    /// Waits for the result and moves it out.
    fn take(&self) -> Result<T> {
        self.wait();
        // Safety: READY published either the error or the value.
        unsafe {
            if let Some(e) = *self.h.err.get() {
                return Err(e);
            }
            debug_assert!(
                self.h.flags.load(Ordering::Acquire) & StateFlags::VALUE_CONSTRUCTED.bits()
                    != 0
            );
            // The value moves out; clear the flag so destruction does not
            // drop it a second time.
            self.h.flags.fetch_and(
                !StateFlags::VALUE_CONSTRUCTED.bits(),
                Ordering::AcqRel,
            );
            Ok(ptr::read((*self.value.get()).as_ptr()))
        }
    }
}

fn new_header<T>(
    placement: Placement,
    owned_stack: *mut u8,
    owned_layout: Layout,
    wait_before_destroy: bool,
    attached: bool,
) -> SharedHeader {
    SharedHeader {
        refs: AtomicU32::new(1),
        flags: AtomicU32::new(if attached {
            StateFlags::FUTURE_ATTACHED.bits()
        } else {
            0
        }),
        err: UnsafeCell::new(None),
        ready: OneshotNotifier::new(),
        owned_stack,
        owned_layout,
        placement,
        wait_before_destroy,
        destroy: destroy_state::<T>,
    }
}

/// The producing half of a future/promise pair.
///
/// Dropping a promise that never supplied a result, while its future is
/// still out there, publishes `BrokenPromise` to the consumer.
pub struct Promise<T> {
    state: Option<NonNull<SharedState<T>>>,
}

unsafe impl<T: Send> Send for Promise<T> {}

#[cfg(feature = "stack-allocation")]
impl<T> Promise<T> {
    /// Creates a promise with a fresh (heap-allocated) shared state.
    pub fn new() -> Self {
        let layout = Layout::new::<SharedState<T>>();
        // Safety: the layout is non-zero (the header alone is not empty).
        let p = unsafe { alloc::alloc::alloc(layout) } as *mut SharedState<T>;
        let Some(state) = NonNull::new(p) else {
            alloc::alloc::handle_alloc_error(layout);
        };
        unsafe {
            ptr::write(
                state.as_ptr(),
                SharedState {
                    h: new_header::<T>(
                        Placement::Heap,
                        ptr::null_mut(),
                        Layout::new::<u8>(),
                        false,
                        false,
                    ),
                    value: UnsafeCell::new(MaybeUninit::uninit()),
                },
            );
        }
        Self { state: Some(state) }
    }
}

#[cfg(feature = "stack-allocation")]
impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    /// Returns the future for this promise. Works exactly once.
    pub fn future(&mut self) -> Result<Future<T>> {
        let state = self
            .state
            .ok_or_else(|| Error::new(ErrorCode::NoState))?;
        let s = unsafe { state.as_ref() };
        s.attach_future()?;
        s.h.refs.fetch_add(1, Ordering::AcqRel);
        Ok(Future { state: Some(state) })
    }

    /// Publishes the value.
    pub fn set_value(&mut self, value: T) -> Result<()> {
        let state = self
            .state
            .ok_or_else(|| Error::new(ErrorCode::NoState))?;
        unsafe { state.as_ref() }.set_value(value)
    }

    /// Publishes an error instead of a value.
    pub fn set_error(&mut self, e: Error) -> Result<()> {
        let state = self
            .state
            .ok_or_else(|| Error::new(ErrorCode::NoState))?;
        unsafe { state.as_ref() }.set_error(e)
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            unsafe {
                let s = state.as_ref();
                let unsatisfied = s.h.flags.load(Ordering::Acquire)
                    & StateFlags::BEING_SATISFIED.bits()
                    == 0;
                if unsatisfied && s.h.refs.load(Ordering::Acquire) > 1 {
                    let _ = s.set_error(Error::new(ErrorCode::BrokenPromise));
                }
                release_ref(state.as_ptr() as *mut SharedHeader);
            }
        }
    }
}

/// The consuming half: a one-shot handle to a value being produced
/// elsewhere.
impl<T> core::fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Future").field("state", &self.state).finish()
    }
}

pub struct Future<T> {
    state: Option<NonNull<SharedState<T>>>,
}

unsafe impl<T: Send> Send for Future<T> {}

impl<T> Future<T> {
    /// True while the future refers to a shared state.
    pub fn valid(&self) -> bool {
        self.state.is_some()
    }

    /// True once the result is available.
    pub fn is_ready(&self) -> bool {
        self.state
            .map(|s| unsafe { s.as_ref() }.is_ready())
            .unwrap_or(false)
    }

    /// Waits for the result and consumes the future: the produced value, or
    /// the producer's error (including `BrokenPromise`).
    pub fn get(mut self) -> Result<T> {
        let state = self
            .state
            .take()
            .ok_or_else(|| Error::new(ErrorCode::NoState))?;
        let result = unsafe { state.as_ref() }.take();
        unsafe { release_ref(state.as_ptr() as *mut SharedHeader) };
        result
    }

    /// Blocks until the result is available.
    pub fn wait(&self) -> Result<()> {
        let state = self
            .state
            .ok_or_else(|| Error::new(ErrorCode::NoState))?;
        unsafe { state.as_ref() }.wait();
        Ok(())
    }

    /// Blocks up to `d` for the result.
    pub fn wait_for(&self, d: Duration) -> Result<FutureStatus> {
        self.wait_until(Instant::now() + d)
    }

    /// Blocks until the result is available or `deadline` passes.
    pub fn wait_until(&self, deadline: Instant) -> Result<FutureStatus> {
        let state = self
            .state
            .ok_or_else(|| Error::new(ErrorCode::NoState))?;
        Ok(unsafe { state.as_ref() }.wait_until(deadline))
    }
}

impl<T> Drop for Future<T> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            unsafe { release_ref(state.as_ptr() as *mut SharedHeader) };
        }
    }
}

/// Wrapper that lets the worker closure carry the raw state pointer.
struct StatePtr<T>(NonNull<SharedState<T>>, PhantomData<*const T>);

// Safety: the state is reference counted and its publication API is the
// thread-safe surface above.
unsafe impl<T: Send> Send for StatePtr<T> {}

/// Launches `f` on a new detached worker task and returns the future for
/// its result.
///
/// The shared state is placed at the base of the attributes' stack region
/// and the worker's own thread state right after it; the worker publishes
/// `f`'s return through `set_value`/`set_error`. The region must outlive
/// both, which the reference counts arrange.
pub fn spawn<T, F>(mut attrs: Attributes, f: F) -> Result<Future<T>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let name = attrs.raw_name();
    let priority = attrs.raw_priority();

    let mut cursor = RegionCursor::resolve(&mut attrs)?;
    let state_ptr = cursor.carve(
        core::mem::size_of::<SharedState<T>>(),
        core::mem::align_of::<SharedState<T>>(),
    )? as *mut SharedState<T>;
    let (owned_stack, owned_layout) = cursor.take_owned();

    // Safety: carve aligned and sized the spot for us.
    unsafe {
        ptr::write(
            state_ptr,
            SharedState {
                h: new_header::<T>(
                    Placement::InPlace,
                    owned_stack,
                    owned_layout,
                    true,
                    true,
                ),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            },
        );
    }
    let state = unsafe { NonNull::new_unchecked(state_ptr) };

    // Two references up front: one for the future, one released through
    // the worker's thread-state destruction. The region (shared state plus
    // the worker's own state and stack) is only returned by whichever
    // release comes second, so neither side can pull it out from under the
    // other.
    unsafe {
        (*state_ptr).h.refs.store(2, Ordering::SeqCst);
    }

    let carried = StatePtr(state, PhantomData);
    let spawned = thread::spawn_in_region(
        cursor,
        name,
        priority,
        Some((release_ref_hook, state_ptr as usize)),
        move || {
            let carried = carried;
            let s = unsafe { carried.0.as_ref() };
            match f() {
                Ok(v) => {
                    let _ = s.set_value(v);
                }
                Err(e) => {
                    let _ = s.set_error(e);
                }
            }
        },
    );

    match spawned {
        Ok(mut worker) => {
            worker.detach()?;
            Ok(Future { state: Some(state) })
        }
        Err(e) => {
            // The spawn failed, so its hook has already dropped the worker
            // reference; no worker will ever publish. Drop ours without
            // waiting on the never-posted notifier.
            unsafe {
                (*state_ptr).h.wait_before_destroy = false;
                release_ref(state_ptr as *mut SharedHeader);
            }
            Err(e)
        }
    }
}

/// Thread-state destruction hook carrying the worker's reference.
unsafe fn release_ref_hook(arg: usize) {
    release_ref(arg as *mut SharedHeader);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "stack-allocation")]
    #[test]
    fn promise_delivers_value() {
        let mut p = Promise::new();
        let f = p.future().unwrap();
        p.set_value(49u32).unwrap();
        assert!(f.is_ready());
        assert_eq!(f.get().unwrap(), 49);
    }

    #[cfg(feature = "stack-allocation")]
    #[test]
    fn promise_delivers_error() {
        let mut p = Promise::<u32>::new();
        let f = p.future().unwrap();
        p.set_error(Error::new(ErrorCode::InvalidArgument)).unwrap();
        assert_eq!(f.get().unwrap_err(), ErrorCode::InvalidArgument);
    }

    #[cfg(feature = "stack-allocation")]
    #[test]
    fn second_future_is_refused() {
        let mut p = Promise::<u32>::new();
        let _f = p.future().unwrap();
        assert_eq!(
            p.future().unwrap_err(),
            ErrorCode::FutureAlreadyRetrieved
        );
    }

    #[cfg(feature = "stack-allocation")]
    #[test]
    fn second_satisfaction_is_refused() {
        let mut p = Promise::new();
        p.set_value(1u32).unwrap();
        assert_eq!(
            p.set_value(2u32).unwrap_err(),
            ErrorCode::PromiseAlreadySatisfied
        );
    }

    #[cfg(feature = "stack-allocation")]
    #[test]
    fn dropping_an_unsatisfied_promise_breaks_it() {
        let mut p = Promise::<u32>::new();
        let f = p.future().unwrap();
        drop(p);
        assert_eq!(f.get().unwrap_err(), ErrorCode::BrokenPromise);
    }

    #[cfg(feature = "stack-allocation")]
    #[test]
    fn timed_wait_reports_timeout_then_value() {
        let mut p = Promise::new();
        let f = p.future().unwrap();
        assert_eq!(
            f.wait_for(Duration::from_millis(10)).unwrap(),
            FutureStatus::Timeout
        );
        p.set_value(5u32).unwrap();
        assert_eq!(
            f.wait_for(Duration::from_millis(10)).unwrap(),
            FutureStatus::Ready
        );
        assert_eq!(f.get().unwrap(), 5);
    }
}
