// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The thread-wait queue: a priority-ordered, interrupt-safe list of
//! waiting tasks.
//!
//! This is the substrate under condition variables, latches, synchronics
//! and the blocking side of futures. A queue is a single atomic head
//! pointer; every waiter node lives in the stack frame of the blocking call
//! and carries a binary semaphore that is posted exactly once to wake it.
//!
//! # List discipline
//!
//! The list is singly linked through each waiter's `state` word, which
//! packs the next-pointer with two low status bits (`WOKEN`, `UNLINKED`);
//! waiter nodes are word-aligned so the bits are free. The list is ordered
//! by descending priority, FIFO within one priority, with the priority
//! captured from the kernel at enroll time (no priority inheritance -- see
//! the crate docs).
//!
//! Mutations run either inside a supervisor call (task context) or directly
//! from an interrupt handler, so there is at most one task-context mutator
//! at a time; the CAS loops exist because an interrupt-context notification
//! can still sweep through mid-mutation. A traversal that finds `UNLINKED`
//! on its reference node restarts from the head.
//!
//! After a notifier posts a waiter's semaphore it must not touch the node
//! again: the waiter's stack frame may be gone the instant the post is
//! observable.

use core::marker::PhantomData;
use core::time::Duration;

use abi::Status;

use crate::atomic::{AtomicI8, AtomicUsize, Ordering};
use crate::error::{Error, Result};
use crate::time::{self, Instant};

const WOKEN: usize = 1;
const UNLINKED: usize = 2;
const BITS: usize = WOKEN | UNLINKED;
const PTR_MASK: usize = !BITS;

/// A queue of waiting tasks. See the module docs.
pub struct WaitQueue {
    head: AtomicUsize,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            head: AtomicUsize::new(0),
        }
    }

    /// Wakes the highest-priority waiter, if any. ISR-safe.
    pub fn notify_one(&self) {
        if self.head.load(Ordering::SeqCst) == 0 {
            return;
        }
        let q = self as *const WaitQueue as usize;
        unsafe {
            if rtos::in_interrupt() {
                twq_notify(q, 0);
            } else {
                rtos::svc::call2(twq_notify, q, 0);
            }
        }
    }

    /// Wakes every waiter. ISR-safe.
    pub fn notify_all(&self) {
        if self.head.load(Ordering::SeqCst) == 0 {
            return;
        }
        let q = self as *const WaitQueue as usize;
        unsafe {
            if rtos::in_interrupt() {
                twq_notify(q, 1);
            } else {
                rtos::svc::call2(twq_notify, q, 1);
            }
        }
    }

    /// Enrolls the calling task and runs `f` with the waiter token.
    ///
    /// The token is linked into the queue before `f` runs and unlinked when
    /// `f` returns, however it returns. Blocking APIs are built as: enroll,
    /// re-check the condition, then [`Waiter::wait`] -- the enroll-first
    /// order is what makes the recheck race-free against notifiers.
    ///
    /// Fails in interrupt context: enrolling implies the ability to block.
    pub fn with_waiter<R>(&self, f: impl FnOnce(&Waiter<'_>) -> R) -> Result<R> {
        if rtos::in_interrupt() {
            return Err(Error::kernel(Status::ErrorIsr));
        }

        let waiter = Waiter {
            queue: self,
            sema: rtos::RawSemaphore::new(0),
            state: AtomicUsize::new(0),
            priority: AtomicI8::new(0),
            _not_send: PhantomData,
        };
        unsafe {
            rtos::svc::call2(
                twq_link,
                self as *const WaitQueue as usize,
                &waiter as *const Waiter<'_> as usize,
            );
        }
        Ok(f(&waiter))
        // `waiter` drops here and unlinks itself.
    }

    #[cfg(test)]
    fn head_is_null(&self) -> bool {
        self.head.load(Ordering::SeqCst) == 0
    }
}

/// One enrolled waiter. Lives on the stack of the blocking call; created
/// only through [`WaitQueue::with_waiter`].
pub struct Waiter<'q> {
    queue: &'q WaitQueue,
    sema: rtos::RawSemaphore,
    state: AtomicUsize,
    priority: AtomicI8,
    // The node's address is on the queue; the token must stay on this
    // task's stack frame.
    _not_send: PhantomData<*const ()>,
}

impl Waiter<'_> {
    /// Blocks until notified.
    pub fn wait(&self) {
        self.sema.wait();
    }

    /// Blocks until notified or `d` has elapsed. True iff notified.
    ///
    /// On false the caller must [`Waiter::unlink`] and honor its result: a
    /// signal that raced the timeout still counts.
    pub fn wait_for(&self, d: Duration) -> bool {
        self.wait_until(Instant::now() + d)
    }

    /// Blocks until notified or `deadline` is reached. True iff notified.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        loop {
            match time::remaining_ms(deadline) {
                // One final poll catches a post that landed right at the
                // deadline.
                None => return self.sema.try_wait(),
                Some(ms) => {
                    if self.sema.wait_timeout(ms) {
                        return true;
                    }
                }
            }
        }
    }

    /// Takes this waiter off the queue. Returns true if a notification had
    /// already claimed it -- the wake still counts and the caller must
    /// treat the operation as signaled.
    pub fn unlink(&self) -> bool {
        let v = self.state.load(Ordering::SeqCst);
        if v & UNLINKED != 0 {
            return v & WOKEN != 0;
        }
        unsafe {
            rtos::svc::call2(
                twq_unlink,
                self.queue as *const WaitQueue as usize,
                self as *const Waiter<'_> as usize,
            );
        }
        self.state.load(Ordering::SeqCst) & WOKEN != 0
    }

    /// True once a notification has claimed this waiter.
    pub fn was_woken(&self) -> bool {
        self.state.load(Ordering::SeqCst) & WOKEN != 0
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.unlink();
    }
}

// The three list mutators. Task-context callers reach them through the SVC
// thunk; interrupt-context callers invoke them directly. All state words
// use sequentially-consistent ordering: the operations are rare, short, and
// the publication edge that matters (waiter wake-up) rides on the semaphore
// post anyway.

/// Links `t` into `q` in priority order (FIFO within equal priority).
unsafe extern "C" fn twq_link(q: usize, t: usize) -> usize {
    let q = &*(q as *const WaitQueue);
    let t = &*(t as *const Waiter<'_>);
    let t_addr = t as *const Waiter<'_> as usize;
    debug_assert_eq!(t_addr & BITS, 0);

    let p = rtos::task_priority(rtos::task_current()).0;
    t.priority.store(p, Ordering::SeqCst);

    let mut i: *const Waiter<'_> = core::ptr::null();
    loop {
        if i.is_null() {
            // Try to become the head. If someone is there, walk from them.
            let mut cur = 0usize;
            loop {
                match q.head.compare_exchange_weak(
                    cur,
                    t_addr,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => return 0,
                    Err(observed) => {
                        cur = observed;
                        if observed != 0 {
                            break;
                        }
                    }
                }
            }
            i = cur as *const Waiter<'_>;
        }

        let iv = (*i).state.load(Ordering::SeqCst);
        if iv & UNLINKED != 0 {
            // A notification swept past our reference node; start over.
            i = core::ptr::null();
            continue;
        }

        let next = (iv & PTR_MASK) as *const Waiter<'_>;
        if !next.is_null() && (*next).priority.load(Ordering::SeqCst) >= p {
            // Equal priorities enqueue behind existing waiters.
            i = next;
            continue;
        }

        // Insert between i and next.
        t.state.store(next as usize, Ordering::SeqCst);
        let mut cur_iv = iv;
        loop {
            match (*i).state.compare_exchange_weak(
                cur_iv,
                t_addr | (cur_iv & BITS),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return 0,
                Err(observed) => {
                    cur_iv = observed;
                    if observed & UNLINKED != 0 {
                        break;
                    }
                }
            }
        }
        // The reference node got claimed under us; start over.
        i = core::ptr::null();
    }
}

/// Splices `t` out of `q` and marks it unlinked.
unsafe extern "C" fn twq_unlink(q: usize, t: usize) -> usize {
    let q = &*(q as *const WaitQueue);
    let t = &*(t as *const Waiter<'_>);
    let t_addr = t as *const Waiter<'_> as usize;
    let t_next = t.state.load(Ordering::SeqCst) & PTR_MASK;

    // Fast path: t is the head.
    let mut observed = t_addr;
    let mut popped = false;
    loop {
        match q
            .head
            .compare_exchange_weak(observed, t_next, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                popped = true;
                break;
            }
            Err(cur) => {
                if cur != t_addr {
                    observed = cur;
                    break;
                }
                // Spurious failure; retry with the same expectation.
            }
        }
    }
    if popped || observed == 0 {
        t.state.fetch_or(UNLINKED, Ordering::SeqCst);
        return 0;
    }

    // Walk to t's predecessor and point it past t. If t is nowhere to be
    // found a notifier already took it; just mark it.
    let mut i = observed as *const Waiter<'_>;
    loop {
        let iv = (*i).state.load(Ordering::SeqCst);
        let next = iv & PTR_MASK;
        if next == 0
            || (next == t_addr
                && (*i)
                    .state
                    .compare_exchange_weak(
                        iv,
                        t_next | (iv & BITS),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok())
        {
            t.state.fetch_or(UNLINKED, Ordering::SeqCst);
            return 0;
        }
        if next != t_addr {
            i = next as *const Waiter<'_>;
        }
    }
}

/// Wakes the head waiter (`all == 0`) or the entire list (`all != 0`).
unsafe extern "C" fn twq_notify(q: usize, all: usize) -> usize {
    let q = &*(q as *const WaitQueue);

    if all != 0 {
        // Claim the whole list, then wake it node by node. Read each node's
        // next-pointer before posting: the post may free the node.
        let mut i = q.head.swap(0, Ordering::SeqCst) as *const Waiter<'_>;
        while !i.is_null() {
            let iv = (*i).state.load(Ordering::SeqCst);
            (*i).state.store(iv | BITS, Ordering::SeqCst);
            (*i).sema.post();
            i = (iv & PTR_MASK) as *const Waiter<'_>;
        }
    } else {
        // Pop the head (the highest-priority waiter, by the list invariant).
        let mut cur = q.head.load(Ordering::SeqCst);
        let mut iv;
        loop {
            if cur == 0 {
                return 0;
            }
            iv = (*(cur as *const Waiter<'_>)).state.load(Ordering::SeqCst);
            match q.head.compare_exchange_weak(
                cur,
                iv & PTR_MASK,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
        let w = &*(cur as *const Waiter<'_>);
        w.state.store(iv | BITS, Ordering::SeqCst);
        w.sema.post();
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Arc;
    use std::vec::Vec;

    #[test]
    fn notify_on_empty_queue_is_harmless() {
        let q = WaitQueue::new();
        q.notify_one();
        q.notify_all();
        assert!(q.head_is_null());
    }

    #[test]
    fn timed_wait_without_notification_times_out() {
        let q = WaitQueue::new();
        let got = q
            .with_waiter(|w| {
                let notified = w.wait_for(Duration::from_millis(20)) || w.unlink();
                notified
            })
            .unwrap();
        assert!(!got);
        assert!(q.head_is_null());
    }

    #[test]
    fn isr_notification_wakes_waiter() {
        let q = WaitQueue::new();
        let got = q
            .with_waiter(|w| {
                rtos::hosted::with_interrupt_context(|| q.notify_one());
                w.wait_for(Duration::from_millis(500)) || w.unlink()
            })
            .unwrap();
        assert!(got);
        assert!(q.head_is_null());
    }

    #[test]
    fn isr_notify_all_drains_queue() {
        let q = Arc::new(WaitQueue::new());
        let enrolled = Arc::new(StdAtomicUsize::new(0));
        let woken = Arc::new(StdAtomicUsize::new(0));

        let mut joins = Vec::new();
        for _ in 0..4 {
            let q = Arc::clone(&q);
            let enrolled = Arc::clone(&enrolled);
            let woken = Arc::clone(&woken);
            joins.push(std::thread::spawn(move || {
                q.with_waiter(|w| {
                    enrolled.fetch_add(1, Ordering::SeqCst);
                    w.wait();
                    woken.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }));
        }

        while enrolled.load(Ordering::SeqCst) < 4 {
            std::thread::yield_now();
        }
        rtos::hosted::with_interrupt_context(|| q.notify_all());

        for j in joins {
            j.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), 4);
        assert!(q.head_is_null());
    }

    #[test]
    fn signal_between_timeout_and_unlink_is_not_lost() {
        // Reconciliation rule: when the timed wait reports timeout but a
        // notification lands before the unlink, the unlink must report the
        // wake and the caller treats the wait as signaled.
        let q = WaitQueue::new();
        q.with_waiter(|w| {
            let timed = w.wait_for(Duration::from_millis(1));
            assert!(!timed);
            // The racing signal arrives after the timeout, before unlink.
            q.notify_one();
            assert!(w.unlink());
            assert!(w.was_woken());
        })
        .unwrap();
        assert!(q.head_is_null());
    }

    #[test]
    fn unlink_without_signal_reports_no_wake() {
        let q = WaitQueue::new();
        q.with_waiter(|w| {
            assert!(!w.wait_for(Duration::from_millis(1)));
            assert!(!w.unlink());
            assert!(!w.was_woken());
        })
        .unwrap();
        assert!(q.head_is_null());
    }
}
