// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A latch: a single-use downward counter threads can block on.

use crate::atomic::{AtomicIsize, Ordering};
use crate::error::Result;
use crate::twq::WaitQueue;

/// A downward counter, initialized once. Threads block until it reaches
/// zero; it cannot be reset.
///
/// The destructor notifies all remaining waiters; callers must not invoke
/// [`Latch::wait`] on a latch that may be destroyed underneath them.
pub struct Latch {
    count: AtomicIsize,
    tq: WaitQueue,
}

impl Latch {
    /// Creates a latch whose counter is set to `count` (>= 0).
    pub const fn new(count: isize) -> Self {
        Self {
            count: AtomicIsize::new(count),
            tq: WaitQueue::new(),
        }
    }

    /// Decrements the counter by one, then blocks until the latch is
    /// triggered. The waiter enrolls *before* decrementing, so the final
    /// arriver's notification cannot slip past anyone.
    pub fn count_down_and_wait(&self) -> Result<()> {
        self.tq.with_waiter(|w| {
            if self.count.fetch_sub(1, Ordering::AcqRel) - 1 > 0 {
                w.wait();
            } else {
                self.tq.notify_all();
            }
        })
    }

    /// Decrements the counter by `n` (0 <= n <= counter); releases all
    /// waiters if it reaches zero. ISR-safe.
    pub fn count_down(&self, n: isize) {
        let mut c = self.count.load(Ordering::SeqCst);
        let mut d;
        loop {
            debug_assert!(n >= 0 && n <= c);
            d = c - n;
            match self
                .count
                .compare_exchange_weak(c, d, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(observed) => c = observed,
            }
        }
        if d == 0 {
            self.tq.notify_all();
        }
    }

    /// True once the counter has reached zero.
    pub fn is_ready(&self) -> bool {
        self.count.load(Ordering::SeqCst) == 0
    }

    /// Blocks until the counter reaches zero; a no-op if it already has.
    pub fn wait(&self) -> Result<()> {
        self.tq.with_waiter(|w| {
            if self.count.load(Ordering::SeqCst) > 0 {
                w.wait();
            }
        })
    }
}

impl Drop for Latch {
    fn drop(&mut self) {
        self.tq.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_latch_is_ready_immediately() {
        let l = Latch::new(0);
        assert!(l.is_ready());
        l.wait().unwrap();
    }

    #[test]
    fn count_down_reaches_ready() {
        let l = Latch::new(3);
        l.count_down(1);
        assert!(!l.is_ready());
        l.count_down(2);
        assert!(l.is_ready());
        l.wait().unwrap();
    }

    #[test]
    fn isr_count_down_releases_waiter() {
        use std::sync::Arc;

        let l = Arc::new(Latch::new(1));
        let waiter = {
            let l = Arc::clone(&l);
            std::thread::spawn(move || l.wait().unwrap())
        };
        // Give the waiter time to enroll, then trip the latch from
        // interrupt context.
        std::thread::sleep(core::time::Duration::from_millis(10));
        rtos::hosted::with_interrupt_context(|| l.count_down(1));
        waiter.join().unwrap();
        assert!(l.is_ready());
    }
}
