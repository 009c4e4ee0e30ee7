// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A counting semaphore.

use core::time::Duration;

use rtos::RawSemaphore;

use crate::time::{self, Instant};

/// A counting semaphore with a 16-bit value.
///
/// [`Semaphore::post`] is safe to call from interrupt context. Posting a
/// semaphore that is already at its maximum value is a usage error.
pub struct Semaphore {
    raw: RawSemaphore,
}

impl Semaphore {
    /// Creates a semaphore holding `value` tokens.
    pub const fn new(value: u16) -> Self {
        Self {
            raw: RawSemaphore::new(value),
        }
    }

    /// Releases one token. ISR-safe.
    pub fn post(&self) {
        self.raw.post();
    }

    /// Acquires a token, blocking until one is available.
    pub fn wait(&self) {
        self.raw.wait();
    }

    /// Acquires a token if one is available right now.
    pub fn try_wait(&self) -> bool {
        self.raw.try_wait()
    }

    /// Acquires a token within `d`. True iff a token was taken.
    pub fn try_wait_for(&self, d: Duration) -> bool {
        self.try_wait_until(Instant::now() + d)
    }

    /// Acquires a token before `deadline`. Deadlines beyond the kernel's
    /// single-wait limit are covered by looping.
    pub fn try_wait_until(&self, deadline: Instant) -> bool {
        loop {
            match time::remaining_ms(deadline) {
                // Final poll catches a token posted right at the deadline.
                None => return self.raw.try_wait(),
                Some(ms) => {
                    if self.raw.wait_timeout(ms) {
                        return true;
                    }
                }
            }
        }
    }

    /// Current token count, read from the kernel's control block.
    pub fn value(&self) -> u16 {
        self.raw.value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_counted() {
        let s = Semaphore::new(2);
        assert_eq!(s.value(), 2);
        assert!(s.try_wait());
        assert!(s.try_wait());
        assert!(!s.try_wait());
        s.post();
        assert_eq!(s.value(), 1);
        assert!(s.try_wait());
    }

    #[test]
    fn timed_wait_times_out_empty() {
        let s = Semaphore::new(0);
        let before = Instant::now();
        assert!(!s.try_wait_for(Duration::from_millis(20)));
        assert!(before.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn isr_post_wakes_waiter() {
        use std::sync::Arc;

        let s = Arc::new(Semaphore::new(0));
        let waiter = {
            let s = Arc::clone(&s);
            std::thread::spawn(move || s.wait())
        };
        std::thread::sleep(Duration::from_millis(5));
        rtos::hosted::with_interrupt_context(|| s.post());
        waiter.join().unwrap();
    }
}
