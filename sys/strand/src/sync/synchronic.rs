// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronics: blocking on the value of an atomic object.
//!
//! A [`Synchronic`] pairs an externally owned atomic with a wait queue.
//! Updaters go through [`Synchronic::notify`] so waiters learn about the
//! change; waiters use [`Synchronic::expect`] / [`Synchronic::expect_update`]
//! to block until the value matches (or leaves) an expectation.
//!
//! The enroll-recheck-wait order inside the expect loops is what makes
//! them race-free: a notification between the load and the wait finds the
//! waiter already on the queue.

use crate::atomic::{AtomicValue, Ordering};
use crate::error::Result;
use crate::twq::WaitQueue;

/// Whether a notification should wake one waiter or all of them.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NotifyHint {
    All,
    One,
}

/// The caller's guess whether the expected update is imminent or distant.
/// Accepted for interface compatibility; the implementation currently waits
/// the same way in both cases.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExpectHint {
    Urgent,
    Delay,
}

/// A wait queue keyed to an atomic object. See the module docs.
pub struct Synchronic {
    tq: WaitQueue,
}

impl Synchronic {
    pub const fn new() -> Self {
        Self {
            tq: WaitQueue::new(),
        }
    }

    /// Stores `value` into `object` with `order`, then wakes waiters
    /// according to `hint`. ISR-safe.
    pub fn notify<A: AtomicValue>(
        &self,
        object: &A,
        value: A::Prim,
        order: Ordering,
        hint: NotifyHint,
    ) {
        object.store(value, order);
        match hint {
            NotifyHint::All => self.tq.notify_all(),
            NotifyHint::One => self.tq.notify_one(),
        }
    }

    /// Applies an arbitrary update through `f`, then wakes waiters.
    pub fn notify_with<A: AtomicValue>(
        &self,
        _object: &A,
        f: impl FnOnce(),
        hint: NotifyHint,
    ) {
        f();
        match hint {
            NotifyHint::All => self.tq.notify_all(),
            NotifyHint::One => self.tq.notify_one(),
        }
    }

    /// Blocks until `object`'s value equals `desired`.
    pub fn expect<A: AtomicValue>(
        &self,
        object: &A,
        desired: A::Prim,
        order: Ordering,
        _hint: ExpectHint,
    ) -> Result<()> {
        loop {
            let done = self.tq.with_waiter(|w| {
                if object.load(order) == desired {
                    true
                } else {
                    w.wait();
                    false
                }
            })?;
            if done {
                return Ok(());
            }
        }
    }

    /// Blocks until `pred()` returns true.
    pub fn expect_that(&self, mut pred: impl FnMut() -> bool, _hint: ExpectHint) -> Result<()> {
        loop {
            let done = self.tq.with_waiter(|w| {
                if pred() {
                    true
                } else {
                    w.wait();
                    false
                }
            })?;
            if done {
                return Ok(());
            }
        }
    }

    /// Blocks while `object`'s value still equals `current`.
    pub fn expect_update<A: AtomicValue>(
        &self,
        object: &A,
        current: A::Prim,
        order: Ordering,
        _hint: ExpectHint,
    ) -> Result<()> {
        loop {
            let done = self.tq.with_waiter(|w| {
                if object.load(order) != current {
                    true
                } else {
                    w.wait();
                    false
                }
            })?;
            if done {
                return Ok(());
            }
        }
    }
}

impl Default for Synchronic {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn expect_returns_immediately_on_match() {
        let s = Synchronic::new();
        let v = AtomicU32::new(7);
        s.expect(&v, 7, Ordering::SeqCst, ExpectHint::Urgent).unwrap();
    }

    #[test]
    fn expect_blocks_until_notified_value_matches() {
        struct Shared {
            s: Synchronic,
            v: AtomicU32,
        }
        let shared = Arc::new(Shared {
            s: Synchronic::new(),
            v: AtomicU32::new(0),
        });

        let waiter = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                shared
                    .s
                    .expect(&shared.v, 3, Ordering::SeqCst, ExpectHint::Urgent)
                    .unwrap();
                shared.v.load(Ordering::SeqCst)
            })
        };

        std::thread::sleep(core::time::Duration::from_millis(5));
        shared.s.notify(&shared.v, 1, Ordering::SeqCst, NotifyHint::All);
        std::thread::sleep(core::time::Duration::from_millis(5));
        shared.s.notify(&shared.v, 3, Ordering::SeqCst, NotifyHint::All);

        assert_eq!(waiter.join().unwrap(), 3);
    }

    #[test]
    fn expect_update_returns_when_value_moves_on() {
        struct Shared {
            s: Synchronic,
            v: AtomicU32,
        }
        let shared = Arc::new(Shared {
            s: Synchronic::new(),
            v: AtomicU32::new(5),
        });

        let waiter = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                shared
                    .s
                    .expect_update(&shared.v, 5, Ordering::SeqCst, ExpectHint::Delay)
                    .unwrap();
            })
        };

        std::thread::sleep(core::time::Duration::from_millis(5));
        shared.s.notify(&shared.v, 6, Ordering::SeqCst, NotifyHint::One);
        waiter.join().unwrap();
    }
}
