// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Monotonic clocks and sleeping.
//!
//! The kernel exposes two counters: a coarse 32-bit tick incremented at
//! `SYSTICK_HZ`, and the fast SysTick count-up within the current tick
//! interval. Neither alone makes a usable timestamp -- the coarse one wraps
//! in under 50 days at 1 kHz and the fast one wraps every interval -- so
//! [`chained_ticks`] fuses them with a shared overflow word into one
//! monotonic 64-bit count of system-clock cycles since boot.
//!
//! [`SystemClock`] reports that count scaled down to coarse ticks;
//! [`HighResClock`] reports it raw.
//!
//! Monotonicity across coarse-counter wraps holds as long as *some* task
//! reads the clock at least once every 2^28 coarse intervals. Any
//! periodically running task satisfies this; give one that job if the
//! application can go quiet for weeks.

use core::time::Duration;

use abi::{MAX_TIMEOUT_MS, SYSTICK_HZ, SYSTICK_RELOAD, TICKS_PER_INTERVAL};

use crate::atomic::{fence, AtomicU32, Ordering};
use crate::error::{Error, Result};

// Tracks overflows of the coarse tick. The top nibble of the last observed
// tick value is stored with a 28-bit overflow counter:
//
//   +----------------+------------------+
//   | tick[31:28]    | overflow counter |
//   |    (4 bit)     |     (28 bit)     |
//   +----------------+------------------+
//
// Shared memory, updated from every clock reader via CAS.
static OVERFLOW_DATA: AtomicU32 = AtomicU32::new(0);

/// Fused 64-bit count of system-clock cycles since boot.
pub(crate) fn chained_ticks() -> u64 {
    // Step 1: get a consistent (fast, coarse) pair. The loop can be
    // preempted anywhere; retry until the fast count advanced without
    // wrapping and the coarse count stood still.
    let mut ticks;
    let mut time;
    loop {
        fence(Ordering::SeqCst);
        ticks = rtos::systick_value();
        time = adjusted_coarse_tick();
        fence(Ordering::SeqCst);
        let ticks_again = rtos::systick_value();
        let time_again = adjusted_coarse_tick();
        if ticks_again > ticks && time == time_again {
            break;
        }
    }

    // Step 2: account for coarse-counter overflows.
    let high_bits = time & 0xF000_0000;
    let mut overflows;
    loop {
        let data = OVERFLOW_DATA.load(Ordering::SeqCst);
        let prev_high_bits = data & 0xF000_0000;
        overflows = data & 0x0FFF_FFFF;

        if high_bits == prev_high_bits {
            // The likely case: the top bits have not moved.
            break;
        }
        // The top bits changed. If the counter also wrapped, bump the
        // overflow count, then publish; on interference start over.
        if high_bits < prev_high_bits {
            overflows += 1;
        }
        if OVERFLOW_DATA
            .compare_exchange_weak(
                data,
                high_bits | overflows,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            break;
        }
    }

    (((overflows as u64) << 32) | time as u64) * (SYSTICK_RELOAD as u64 + 1)
        + ticks as u64
}

fn adjusted_coarse_tick() -> u32 {
    let tick = rtos::coarse_tick();
    if rtos::systick_overflow_pending() {
        tick.wrapping_add(1)
    } else {
        tick
    }
}

/// The steady clock ticking at the coarse tick frequency (`SYSTICK_HZ`).
pub struct SystemClock;

impl SystemClock {
    pub const FREQUENCY: u32 = SYSTICK_HZ;

    pub fn now() -> Instant {
        Instant {
            ticks: chained_ticks() / TICKS_PER_INTERVAL as u64,
        }
    }
}

/// The steady clock ticking at the system-clock frequency.
pub struct HighResClock;

impl HighResClock {
    pub const FREQUENCY: u32 = abi::SYSTEM_CLOCK_HZ;

    /// Cycles since boot.
    pub fn now() -> u64 {
        chained_ticks()
    }
}

/// A point on [`SystemClock`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Instant {
    ticks: u64,
}

impl Instant {
    pub fn now() -> Self {
        SystemClock::now()
    }

    /// Raw tick count since boot.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn duration_since(&self, earlier: Instant) -> Duration {
        duration_from_ticks(self.ticks.saturating_sub(earlier.ticks))
    }

    pub fn elapsed(&self) -> Duration {
        Self::now().duration_since(*self)
    }

    pub fn checked_add(&self, d: Duration) -> Option<Instant> {
        self.ticks
            .checked_add(ticks_from_duration(d))
            .map(|ticks| Instant { ticks })
    }
}

impl core::ops::Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, d: Duration) -> Instant {
        Instant {
            ticks: self.ticks.saturating_add(ticks_from_duration(d)),
        }
    }
}

impl core::ops::Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, earlier: Instant) -> Duration {
        self.duration_since(earlier)
    }
}

/// Duration to coarse ticks, rounding up so a wait never ends early.
pub(crate) fn ticks_from_duration(d: Duration) -> u64 {
    let nanos = d.as_nanos();
    let per_tick = 1_000_000_000u128 / SYSTICK_HZ as u128;
    ((nanos + per_tick - 1) / per_tick) as u64
}

fn duration_from_ticks(ticks: u64) -> Duration {
    Duration::from_nanos(ticks.saturating_mul(1_000_000_000 / SYSTICK_HZ as u64))
}

/// Milliseconds left until `deadline`, clamped into the 1..=0xFFFE window a
/// single kernel wait accepts. `None` once the deadline has passed.
///
/// Deadline loops call this once per iteration: wait one clamped chunk,
/// re-evaluate, repeat.
pub(crate) fn remaining_ms(deadline: Instant) -> Option<u32> {
    let now = Instant::now();
    if deadline <= now {
        return None;
    }
    let ms = deadline.duration_since(now).as_millis();
    Some((ms.clamp(1, MAX_TIMEOUT_MS as u128)) as u32)
}

/// Blocks the calling thread for at least `d`.
pub fn sleep_for(d: Duration) -> Result<()> {
    if d.is_zero() {
        return Ok(());
    }

    // A one-tick delay only blocks until the next tick boundary, and part of
    // the current tick has already passed; round up one extra tick so the
    // caller never sleeps short.
    let mut ms = d.as_millis().saturating_add(1);

    while ms > 0 {
        let chunk = ms.min(MAX_TIMEOUT_MS as u128) as u32;
        ms -= chunk as u128;
        let status = rtos::task_delay(chunk);
        if !status.is_ok() && !status.is_timeout_like() {
            return Err(Error::kernel(status));
        }
    }
    Ok(())
}

/// Blocks the calling thread until `deadline` has been reached.
pub fn sleep_until(deadline: Instant) -> Result<()> {
    while let Some(ms) = remaining_ms(deadline) {
        let status = rtos::task_delay(ms);
        if !status.is_ok() && !status.is_timeout_like() {
            return Err(Error::kernel(status));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chained_ticks_is_monotonic() {
        let mut prev = chained_ticks();
        for _ in 0..10_000 {
            let next = chained_ticks();
            assert!(next >= prev);
            prev = next;
        }
    }

    #[test]
    fn tick_conversions_round_up() {
        // At 1 kHz, 1.5 ms is two ticks.
        assert_eq!(ticks_from_duration(Duration::from_micros(1500)), 2);
        assert_eq!(ticks_from_duration(Duration::from_millis(1)), 1);
        assert_eq!(ticks_from_duration(Duration::ZERO), 0);
    }

    #[test]
    fn sleep_for_sleeps_at_least_that_long() {
        let before = Instant::now();
        sleep_for(Duration::from_millis(20)).unwrap();
        assert!(before.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn instant_arithmetic() {
        let t = Instant::now();
        let later = t + Duration::from_millis(50);
        assert!(later > t);
        assert_eq!(later.duration_since(t), Duration::from_millis(50));
        assert_eq!(later - t, Duration::from_millis(50));
    }
}
