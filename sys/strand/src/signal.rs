// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Waiting on the calling thread's signal flags.
//!
//! Every thread carries up to `MAX_SIGNALS` (at most 16) flag bits. Setting
//! and clearing flags on *another* thread goes through its handle
//! ([`crate::thread::Thread::set_signals`]); this module is the receiving
//! side, operating on the calling thread only.
//!
//! The any-signal family is satisfied by one or more flags, returns all
//! flags that were set and clears them. The all-signals family is satisfied
//! only by the complete requested mask and clears exactly those bits,
//! leaving others pending. Set-before-wait ordering is guaranteed by the
//! kernel's signal service.

use core::time::Duration;

use abi::{SignalSet, ALL_SIGNALS, WAIT_FOREVER};
use rtos::SignalWait;

use crate::error::{Error, Result};
use crate::time::{self, Instant};

/// Blocks until at least one signal flag is set; returns and clears all
/// set flags.
pub fn wait_for_any_signal() -> Result<SignalSet> {
    match rtos::signal_wait(0, WAIT_FOREVER) {
        SignalWait::Signals(s) => Ok(s),
        SignalWait::Timeout => Ok(0),
        SignalWait::Error(status) => Err(Error::kernel(status)),
    }
}

/// Returns and clears any set signal flags, without blocking. Zero when
/// none were set.
pub fn try_wait_for_any_signal() -> Result<SignalSet> {
    match rtos::signal_wait(0, 0) {
        SignalWait::Signals(s) => Ok(s),
        SignalWait::Timeout => Ok(0),
        SignalWait::Error(status) => Err(Error::kernel(status)),
    }
}

/// Waits up to `d` for any signal. Zero on timeout.
pub fn try_wait_for_any_signal_for(d: Duration) -> Result<SignalSet> {
    try_wait_for_any_signal_until(Instant::now() + d)
}

/// Waits until any signal arrives or `deadline` is reached. Zero on
/// timeout.
pub fn try_wait_for_any_signal_until(deadline: Instant) -> Result<SignalSet> {
    loop {
        let (timeout_ms, last) = match time::remaining_ms(deadline) {
            None => (0, true),
            Some(ms) => (ms, false),
        };
        match rtos::signal_wait(0, timeout_ms) {
            SignalWait::Signals(s) => return Ok(s),
            SignalWait::Timeout => {
                if last {
                    return Ok(0);
                }
            }
            SignalWait::Error(status) => return Err(Error::kernel(status)),
        }
    }
}

/// Blocks until every flag in `flags` is set, then clears exactly those
/// flags.
pub fn wait_for_all_signals(flags: SignalSet) -> Result<()> {
    debug_assert!(flags > 0 && flags <= ALL_SIGNALS);
    match rtos::signal_wait(flags, WAIT_FOREVER) {
        SignalWait::Signals(_) => Ok(()),
        SignalWait::Timeout => Ok(()),
        SignalWait::Error(status) => Err(Error::kernel(status)),
    }
}

/// True (clearing the flags) if every flag in `flags` is currently set;
/// false without touching anything otherwise.
pub fn try_wait_for_all_signals(flags: SignalSet) -> Result<bool> {
    debug_assert!(flags > 0 && flags <= ALL_SIGNALS);
    match rtos::signal_wait(flags, 0) {
        SignalWait::Signals(_) => Ok(true),
        SignalWait::Timeout => Ok(false),
        SignalWait::Error(status) => Err(Error::kernel(status)),
    }
}

/// Waits up to `d` for the complete mask.
pub fn try_wait_for_all_signals_for(flags: SignalSet, d: Duration) -> Result<bool> {
    try_wait_for_all_signals_until(flags, Instant::now() + d)
}

/// Waits until the complete mask is set or `deadline` is reached.
pub fn try_wait_for_all_signals_until(flags: SignalSet, deadline: Instant) -> Result<bool> {
    debug_assert!(flags > 0 && flags <= ALL_SIGNALS);
    loop {
        let (timeout_ms, last) = match time::remaining_ms(deadline) {
            None => (0, true),
            Some(ms) => (ms, false),
        };
        match rtos::signal_wait(flags, timeout_ms) {
            SignalWait::Signals(_) => return Ok(true),
            SignalWait::Timeout => {
                if last {
                    return Ok(false);
                }
            }
            SignalWait::Error(status) => return Err(Error::kernel(status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::TaskId;

    #[test]
    fn try_wait_sees_nothing_when_nothing_is_set() {
        assert_eq!(try_wait_for_any_signal().unwrap(), 0);
        assert!(!try_wait_for_all_signals(0x0003).unwrap());
    }

    #[test]
    fn self_set_signals_are_observed_and_cleared() {
        let me: TaskId = rtos::task_current();
        rtos::signal_set(me, 0x0005);
        assert_eq!(try_wait_for_any_signal().unwrap(), 0x0005);
        assert_eq!(try_wait_for_any_signal().unwrap(), 0);
    }

    #[test]
    fn all_signals_clear_only_the_requested_bits() {
        let me: TaskId = rtos::task_current();
        rtos::signal_set(me, 0x0007);
        assert!(try_wait_for_all_signals(0x0003).unwrap());
        // Bit 2 is still pending.
        assert_eq!(try_wait_for_any_signal().unwrap(), 0x0004);
    }

    #[test]
    fn timed_wait_for_all_times_out() {
        let got =
            try_wait_for_all_signals_for(0x0008, Duration::from_millis(10)).unwrap();
        assert!(!got);
    }
}
