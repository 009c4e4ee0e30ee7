// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded FIFO message queues.
//!
//! The implementation is picked per element type at compile time:
//!
//! - **Small elements** (word-sized, word-aligned, no destructor) are
//!   bit-copied straight through the kernel's word queue. This is the
//!   common case -- enum tags, indices, small structs -- and involves no
//!   pool bookkeeping at all.
//! - **Large elements** go through an internal pool of `N` slots: `send`
//!   acquires the producer-throttle semaphore (initialized to `N`), moves
//!   the element into a free slot, and passes the slot through the word
//!   queue; `receive` moves the element out and returns the slot.
//!
//! Senders block when the queue is full, receivers when it is empty; the
//! `try_*` forms poll, and the `_for` forms bound the wait.

use core::cell::UnsafeCell;
use core::mem::{self, MaybeUninit};
use core::ptr;
use core::time::Duration;

use abi::WAIT_FOREVER;
use rtos::{RawQueue, RawSemaphore};

use crate::atomic::{AtomicU32, AtomicUsize, Ordering};
use crate::error::{Error, Result};
use crate::time::{self, Instant};

const UNINIT: u32 = 0;
const INITIALIZING: u32 = 1;
const READY: u32 = 2;

/// Runs `f` exactly once per queue, before first use. The kernel queue
/// needs its storage address, which is only stable once the owning object
/// sits at its final location -- hence lazy, not in `new()`.
fn ensure_init(state: &AtomicU32, f: impl FnOnce()) {
    if state.load(Ordering::Acquire) == READY {
        return;
    }
    match state.compare_exchange(
        UNINIT,
        INITIALIZING,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => {
            f();
            state.store(READY, Ordering::Release);
        }
        Err(_) => {
            while state.load(Ordering::Acquire) != READY {
                rtos::task_yield();
            }
        }
    }
}

struct SmallQueue<const N: usize> {
    queue: RawQueue,
    storage: UnsafeCell<[usize; N]>,
    init: AtomicU32,
}

impl<const N: usize> SmallQueue<N> {
    const fn new() -> Self {
        Self {
            queue: RawQueue::new(),
            storage: UnsafeCell::new([0; N]),
            init: AtomicU32::new(UNINIT),
        }
    }

    fn queue(&self) -> &RawQueue {
        ensure_init(&self.init, || unsafe {
            self.queue.init(self.storage.get() as *mut usize, N);
        });
        &self.queue
    }
}

/// Lock-free pool of `N` element slots, free list threaded through
/// per-slot links. The head carries a modification tag above the index
/// bits so a pop cannot be fooled by a concurrent pop/push pair.
struct Pool<T, const N: usize> {
    slots: [UnsafeCell<MaybeUninit<T>>; N],
    next: [AtomicU32; N],
    head: AtomicUsize,
}

const INDEX_MASK: usize = 0xFFFF;
const TAG_STEP: usize = 0x1_0000;

impl<T, const N: usize> Pool<T, N> {
    const fn new() -> Self {
        Self {
            slots: [const { UnsafeCell::new(MaybeUninit::uninit()) }; N],
            next: [const { AtomicU32::new(0) }; N],
            head: AtomicUsize::new(0),
        }
    }

    /// Chains every slot onto the free list. Called once from ensure_init.
    fn prime(&self) {
        for i in 0..N {
            let link = if i + 1 < N { i as u32 + 2 } else { 0 };
            self.next[i].store(link, Ordering::Relaxed);
        }
        self.head.store(1, Ordering::Release);
    }

    fn allocate(&self) -> Option<usize> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let idx1 = head & INDEX_MASK;
            if idx1 == 0 {
                return None;
            }
            let idx = idx1 - 1;
            let next = self.next[idx].load(Ordering::Acquire) as usize;
            let new = (head & !INDEX_MASK).wrapping_add(TAG_STEP) | next;
            if self
                .head
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(idx);
            }
        }
    }

    fn free(&self, idx: usize) {
        loop {
            let head = self.head.load(Ordering::Acquire);
            self.next[idx].store((head & INDEX_MASK) as u32, Ordering::Release);
            let new = (head & !INDEX_MASK).wrapping_add(TAG_STEP) | (idx + 1);
            if self
                .head
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    fn slot(&self, idx: usize) -> *mut T {
        self.slots[idx].get() as *mut T
    }
}

struct LargeQueue<T, const N: usize> {
    /// Carries indices of occupied pool slots, in FIFO order.
    indices: RawQueue,
    storage: UnsafeCell<[usize; N]>,
    init: AtomicU32,
    /// Producer throttle: one token per free pool slot.
    available: RawSemaphore,
    pool: Pool<T, N>,
}

impl<T, const N: usize> LargeQueue<T, N> {
    const fn new() -> Self {
        Self {
            indices: RawQueue::new(),
            storage: UnsafeCell::new([0; N]),
            init: AtomicU32::new(UNINIT),
            available: RawSemaphore::new(N as u16),
            pool: Pool::new(),
        }
    }

    fn ready(&self) -> &Self {
        ensure_init(&self.init, || {
            self.pool.prime();
            unsafe {
                self.indices.init(self.storage.get() as *mut usize, N);
            }
        });
        self
    }
}

enum Repr<T, const N: usize> {
    Small(SmallQueue<N>),
    Large(LargeQueue<T, N>),
}

/// A bounded FIFO of `N` elements of type `T`. See the module docs for the
/// small/large dispatch.
///
/// The queue must not be moved after its first use: the kernel keeps a
/// reference to the embedded storage.
pub struct MessageQueue<T, const N: usize> {
    repr: Repr<T, N>,
}

unsafe impl<T: Send, const N: usize> Send for MessageQueue<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for MessageQueue<T, N> {}

impl<T, const N: usize> MessageQueue<T, N> {
    /// True when elements travel through the word queue directly.
    pub const IS_SMALL: bool = mem::size_of::<T>() <= mem::size_of::<usize>()
        && mem::align_of::<T>() <= mem::align_of::<usize>()
        && !mem::needs_drop::<T>();

    pub fn new() -> Self {
        // The pool index format caps the capacity well above anything a
        // control block can hold anyway.
        assert!(N > 0 && N < INDEX_MASK);
        Self {
            repr: if Self::IS_SMALL {
                Repr::Small(SmallQueue::new())
            } else {
                Repr::Large(LargeQueue::new())
            },
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    fn encode(value: T) -> usize {
        debug_assert!(Self::IS_SMALL);
        let mut word = 0usize;
        // Safety: the small predicate guarantees the value fits a word and
        // has no destructor, so a bit-copy is a complete move.
        unsafe {
            ptr::copy_nonoverlapping(
                &value as *const T as *const u8,
                &mut word as *mut usize as *mut u8,
                mem::size_of::<T>(),
            );
        }
        mem::forget(value);
        word
    }

    /// # Safety
    ///
    /// `word` must come from [`Self::encode`] and be consumed exactly once.
    unsafe fn decode(word: usize) -> T {
        ptr::read(&word as *const usize as *const T)
    }

    /// Sends an element, blocking while the queue is full.
    pub fn send(&self, value: T) -> Result<()> {
        match &self.repr {
            Repr::Small(small) => {
                let word = Self::encode(value);
                let status = small.queue().put(word, WAIT_FOREVER);
                if status.is_ok() {
                    Ok(())
                } else {
                    Err(Error::kernel(status))
                }
            }
            Repr::Large(large) => {
                let large = large.ready();
                large.available.wait();
                let idx = match large.pool.allocate() {
                    Some(idx) => idx,
                    // Can't happen: the semaphore counts free slots.
                    None => return Err(Error::kernel(abi::Status::ErrorOs)),
                };
                // Safety: the slot is ours until the index is enqueued.
                unsafe { ptr::write(large.pool.slot(idx), value) };
                let status = large.indices.put(idx, WAIT_FOREVER);
                debug_assert!(status.is_ok());
                Ok(())
            }
        }
    }

    /// Sends without blocking; gives the element back if the queue is full.
    pub fn try_send(&self, value: T) -> core::result::Result<(), T> {
        match &self.repr {
            Repr::Small(small) => {
                let word = Self::encode(value);
                if small.queue().put(word, 0).is_ok() {
                    Ok(())
                } else {
                    // Safety: the word was never enqueued; reconstitute.
                    Err(unsafe { Self::decode(word) })
                }
            }
            Repr::Large(large) => {
                let large = large.ready();
                if !large.available.try_wait() {
                    return Err(value);
                }
                let idx = match large.pool.allocate() {
                    Some(idx) => idx,
                    None => {
                        large.available.post();
                        return Err(value);
                    }
                };
                unsafe { ptr::write(large.pool.slot(idx), value) };
                let status = large.indices.put(idx, WAIT_FOREVER);
                debug_assert!(status.is_ok());
                Ok(())
            }
        }
    }

    /// Sends, giving up once `d` has elapsed with the queue still full.
    pub fn try_send_for(&self, value: T, d: Duration) -> core::result::Result<(), T> {
        let deadline = Instant::now() + d;
        match &self.repr {
            Repr::Small(small) => {
                let q = small.queue();
                let word = Self::encode(value);
                loop {
                    match time::remaining_ms(deadline) {
                        None => {
                            return if q.put(word, 0).is_ok() {
                                Ok(())
                            } else {
                                Err(unsafe { Self::decode(word) })
                            }
                        }
                        Some(ms) => {
                            if q.put(word, ms).is_ok() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
            Repr::Large(large) => {
                let large = large.ready();
                loop {
                    match time::remaining_ms(deadline) {
                        None => {
                            if large.available.try_wait() {
                                break;
                            }
                            return Err(value);
                        }
                        Some(ms) => {
                            if large.available.wait_timeout(ms) {
                                break;
                            }
                        }
                    }
                }
                let idx = match large.pool.allocate() {
                    Some(idx) => idx,
                    None => {
                        large.available.post();
                        return Err(value);
                    }
                };
                unsafe { ptr::write(large.pool.slot(idx), value) };
                let status = large.indices.put(idx, WAIT_FOREVER);
                debug_assert!(status.is_ok());
                Ok(())
            }
        }
    }

    /// Receives the oldest element, blocking while the queue is empty.
    pub fn receive(&self) -> Result<T> {
        match &self.repr {
            Repr::Small(small) => match small.queue().get(WAIT_FOREVER) {
                Ok(word) => Ok(unsafe { Self::decode(word) }),
                Err(status) => Err(Error::kernel(status)),
            },
            Repr::Large(large) => {
                let large = large.ready();
                match large.indices.get(WAIT_FOREVER) {
                    Ok(idx) => Ok(unsafe { self.take_slot(large, idx) }),
                    Err(status) => Err(Error::kernel(status)),
                }
            }
        }
    }

    /// Receives without blocking.
    pub fn try_receive(&self) -> Option<T> {
        match &self.repr {
            Repr::Small(small) => small
                .queue()
                .get(0)
                .ok()
                .map(|word| unsafe { Self::decode(word) }),
            Repr::Large(large) => {
                let large = large.ready();
                large
                    .indices
                    .get(0)
                    .ok()
                    .map(|idx| unsafe { self.take_slot(large, idx) })
            }
        }
    }

    /// Receives, giving up once `d` has elapsed with the queue still empty.
    pub fn try_receive_for(&self, d: Duration) -> Option<T> {
        let deadline = Instant::now() + d;
        loop {
            let ms = match time::remaining_ms(deadline) {
                None => return self.try_receive(),
                Some(ms) => ms,
            };
            match &self.repr {
                Repr::Small(small) => {
                    if let Ok(word) = small.queue().get(ms) {
                        return Some(unsafe { Self::decode(word) });
                    }
                }
                Repr::Large(large) => {
                    let large = large.ready();
                    if let Ok(idx) = large.indices.get(ms) {
                        return Some(unsafe { self.take_slot(large, idx) });
                    }
                }
            }
        }
    }

    /// Moves the element out of a pool slot and recycles the slot.
    ///
    /// # Safety
    ///
    /// `idx` must have been dequeued from the index queue (so the slot
    /// holds an initialized element nobody else will touch).
    unsafe fn take_slot(&self, large: &LargeQueue<T, N>, idx: usize) -> T {
        let value = ptr::read(large.pool.slot(idx));
        large.pool.free(idx);
        large.available.post();
        value
    }
}

impl<T, const N: usize> Drop for MessageQueue<T, N> {
    fn drop(&mut self) {
        if let Repr::Large(large) = &self.repr {
            if large.init.load(Ordering::Acquire) != READY {
                return;
            }
            // Elements still enqueued were never moved out; drop them.
            while let Ok(idx) = large.indices.get(0) {
                unsafe { ptr::drop_in_place(large.pool.slot(idx)) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::{String, ToString};
    use std::sync::Arc;

    #[test]
    fn small_elements_take_the_word_path() {
        assert!(MessageQueue::<u32, 4>::IS_SMALL);
        assert!(!MessageQueue::<[u64; 4], 4>::IS_SMALL);
        assert!(!MessageQueue::<String, 4>::IS_SMALL);
    }

    #[test]
    fn small_queue_round_trips_in_order() {
        let q: MessageQueue<u32, 4> = MessageQueue::new();
        q.send(1).unwrap();
        q.send(2).unwrap();
        q.send(3).unwrap();
        assert_eq!(q.receive().unwrap(), 1);
        assert_eq!(q.receive().unwrap(), 2);
        assert_eq!(q.receive().unwrap(), 3);
        assert!(q.try_receive().is_none());
    }

    #[test]
    fn small_queue_reports_full() {
        let q: MessageQueue<u8, 2> = MessageQueue::new();
        assert!(q.try_send(1).is_ok());
        assert!(q.try_send(2).is_ok());
        assert_eq!(q.try_send(3), Err(3));
        assert_eq!(q.receive().unwrap(), 1);
        assert!(q.try_send(3).is_ok());
    }

    #[test]
    fn large_queue_round_trips() {
        let q: MessageQueue<String, 2> = MessageQueue::new();
        q.send("alpha".to_string()).unwrap();
        q.send("beta".to_string()).unwrap();
        match q.try_send("gamma".to_string()) {
            Err(v) => assert_eq!(v, "gamma"),
            Ok(()) => panic!("queue should be full"),
        }
        assert_eq!(q.receive().unwrap(), "alpha");
        assert_eq!(q.receive().unwrap(), "beta");
    }

    #[test]
    fn large_queue_drops_leftovers() {
        let payload = Arc::new(());
        let q: MessageQueue<Arc<()>, 2> = MessageQueue::new();
        q.send(Arc::clone(&payload)).unwrap();
        q.send(Arc::clone(&payload)).unwrap();
        drop(q);
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    fn blocked_receiver_is_fed_by_sender() {
        let q = Arc::new(MessageQueue::<u32, 2>::new());
        let receiver = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || q.receive().unwrap())
        };
        std::thread::sleep(Duration::from_millis(5));
        q.send(17).unwrap();
        assert_eq!(receiver.join().unwrap(), 17);
    }

    #[test]
    fn timed_receive_times_out() {
        let q: MessageQueue<u32, 2> = MessageQueue::new();
        assert!(q.try_receive_for(Duration::from_millis(10)).is_none());
    }
}
