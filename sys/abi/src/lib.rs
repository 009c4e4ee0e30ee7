// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the RTOS adapter and the portable
//! concurrency layer.
//!
//! Everything in this crate mirrors a contract of the underlying kernel: task
//! identifiers, scheduling priorities, status codes, the signal-flag budget,
//! and the timeout encoding of the blocking services. The portable layer
//! never talks to the kernel in any vocabulary other than this one.

#![no_std]

use serde::{Deserialize, Serialize};
use zerocopy::{AsBytes, FromBytes, Unaligned};

pub use num_derive::{FromPrimitive, ToPrimitive};
pub use num_traits::{FromPrimitive, ToPrimitive};

// Build-time port configuration (clock frequencies, signal budget). See
// `build.rs` for the environment variables and defaults.
include!(concat!(env!("OUT_DIR"), "/config.rs"));

/// Number of fast-clock ticks in one coarse systick interval.
pub const TICKS_PER_INTERVAL: u32 = SYSTEM_CLOCK_HZ / SYSTICK_HZ;

/// Reload value of the SysTick countdown. The counter runs from this value
/// down to zero once per coarse tick, so the chained clock multiplies coarse
/// ticks by `SYSTICK_RELOAD + 1`.
pub const SYSTICK_RELOAD: u32 = TICKS_PER_INTERVAL - 1;

/// Names a task known to the kernel.
///
/// This is an opaque handle produced by `task_create` / `task_current`. Zero
/// is reserved and never names a live task.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskId(pub u32);

impl TaskId {
    /// Reserved id meaning "no task".
    pub const INVALID: Self = Self(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

/// Scheduling priority of a task.
///
/// Priorities follow the kernel's convention: numerically *greater* values
/// are more important, `0` is the normal priority, and the full range runs
/// from `Priority::IDLE` (-3) to `Priority::REALTIME` (3). Use
/// [`Priority::is_more_important_than`] instead of comparing raw values so
/// the direction of the scale stays out of call sites.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, AsBytes, Unaligned, Default,
    Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Priority(pub i8);

impl Priority {
    pub const IDLE: Self = Self(-3);
    pub const LOW: Self = Self(-2);
    pub const BELOW_NORMAL: Self = Self(-1);
    pub const NORMAL: Self = Self(0);
    pub const ABOVE_NORMAL: Self = Self(1);
    pub const HIGH: Self = Self(2);
    pub const REALTIME: Self = Self(3);

    /// Checks if `self` is strictly more important than `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 > other.0
    }
}

/// Status codes returned by the kernel services.
///
/// The numeric values are part of the kernel ABI; the adapter converts raw
/// `i32` returns with `Status::from_i32` and treats anything unknown as
/// `Status::ErrorOs`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive, ToPrimitive)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    EventSignal = 0x08,
    EventMessage = 0x10,
    EventTimeout = 0x40,
    ErrorParameter = 0x80,
    ErrorResource = 0x81,
    ErrorTimeoutResource = 0xC1,
    ErrorIsr = 0x82,
    ErrorIsrRecursive = 0x83,
    ErrorPriority = 0x84,
    ErrorNoMemory = 0x85,
    ErrorValue = 0x86,
    ErrorOs = 0xFF,
}

impl Status {
    /// Maps a raw kernel return to a `Status`, folding values the ABI does
    /// not name into `ErrorOs`.
    pub fn from_raw(raw: i32) -> Self {
        num_traits::FromPrimitive::from_i32(raw).unwrap_or(Status::ErrorOs)
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// True for the two "the resource was busy / the wait ran out" codes
    /// that timed waits treat as retries rather than failures.
    pub fn is_timeout_like(&self) -> bool {
        matches!(
            self,
            Status::EventTimeout | Status::ErrorResource | Status::ErrorTimeoutResource
        )
    }
}

/// A set of per-task signal flags, one bit per signal.
///
/// Only the low `MAX_SIGNALS` bits are usable; `ALL_SIGNALS` is the mask of
/// every usable bit.
pub type SignalSet = u16;

/// Mask of every configured signal bit.
pub const ALL_SIGNALS: SignalSet = (((1u32 << MAX_SIGNALS) - 1) & 0xFFFF) as SignalSet;

/// Timeout encoding of the blocking kernel services, in milliseconds.
pub const WAIT_FOREVER: u32 = 0xFFFF_FFFF;

/// Largest timeout a single kernel wait accepts. Deadlines beyond this are
/// covered by looping; the value is a kernel limit, not a layer choice.
pub const MAX_TIMEOUT_MS: u32 = 0xFFFE;

/// Smallest stack a task may be given, not counting the shared-state object
/// placed into it.
pub const MIN_STACK_SIZE: usize = 64;

/// Stack sizes must stay below this bound (the kernel packs the size into a
/// 24-bit field of the create call).
pub const MAX_STACK_SIZE: usize = 1 << 24;

/// Alignment every stack region is brought to before use.
pub const STACK_ALIGN: usize = 8;

/// Sentinel written into unused stack words so stack usage can be inspected
/// after the fact by scanning for the first non-watermark word.
pub const STACK_WATERMARK: u32 = 0xE25A_2EA5;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_direction() {
        assert!(Priority::HIGH.is_more_important_than(Priority::NORMAL));
        assert!(!Priority::IDLE.is_more_important_than(Priority::LOW));
    }

    #[test]
    fn status_mapping() {
        assert_eq!(Status::from_raw(0), Status::Ok);
        assert_eq!(Status::from_raw(0xC1), Status::ErrorTimeoutResource);
        assert_eq!(Status::from_raw(0x7777), Status::ErrorOs);
        assert!(Status::ErrorResource.is_timeout_like());
        assert!(!Status::ErrorIsr.is_timeout_like());
    }

    #[test]
    fn signal_mask_covers_configured_bits() {
        assert_eq!(ALL_SIGNALS.count_ones(), MAX_SIGNALS);
    }
}
