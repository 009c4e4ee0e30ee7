// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Atomics and fences.
//!
//! Word-sized atomics are the language's own and are re-exported here.
//! What this module adds:
//!
//! - [`fence`], whose sequentially-consistent flavor is guaranteed to emit a
//!   full data memory barrier (the chained clock depends on this);
//! - double-word atomics ([`AtomicU64`], [`AtomicI64`]) for targets whose
//!   load-linked/store-conditional primitives stop at one word: every
//!   operation serializes on one process-wide kernel mutex, and
//!   `is_lock_free()` reports `false`;
//! - the [`AtomicValue`] trait, the seam [`crate::sync::Synchronic`] is
//!   generic over.

use core::cell::UnsafeCell;

pub use core::sync::atomic::{
    AtomicBool, AtomicI16, AtomicI32, AtomicI8, AtomicIsize, AtomicU16, AtomicU32,
    AtomicU8, AtomicUsize, Ordering,
};

use rtos::RawMutex;

/// Memory fence. `SeqCst` emits a full data memory barrier; the weaker
/// orderings compile down to the language fence.
#[inline]
pub fn fence(order: Ordering) {
    match order {
        Ordering::SeqCst => rtos::data_memory_barrier(),
        other => core::sync::atomic::fence(other),
    }
}

// One process-wide lock serializes every double-word atomic operation. Held
// strictly for the duration of a single operation.
static WIDE_LOCK: RawMutex = RawMutex::new();

fn with_wide_lock<R>(f: impl FnOnce() -> R) -> R {
    let status = WIDE_LOCK.acquire(abi::WAIT_FOREVER);
    debug_assert!(status.is_ok());
    let result = f();
    let status = WIDE_LOCK.release();
    debug_assert!(status.is_ok());
    result
}

macro_rules! wide_atomic {
    ($(#[$attr:meta])* $name:ident, $prim:ty) => {
        $(#[$attr])*
        pub struct $name {
            v: UnsafeCell<$prim>,
        }

        // Safety: all access is serialized on WIDE_LOCK.
        unsafe impl Sync for $name {}
        unsafe impl Send for $name {}

        impl $name {
            pub const fn new(v: $prim) -> Self {
                Self {
                    v: UnsafeCell::new(v),
                }
            }

            /// Always false; these types serialize on a mutex.
            pub fn is_lock_free(&self) -> bool {
                false
            }

            pub fn load(&self, _order: Ordering) -> $prim {
                with_wide_lock(|| unsafe { *self.v.get() })
            }

            pub fn store(&self, val: $prim, _order: Ordering) {
                with_wide_lock(|| unsafe { *self.v.get() = val })
            }

            pub fn swap(&self, val: $prim, _order: Ordering) -> $prim {
                with_wide_lock(|| unsafe {
                    let old = *self.v.get();
                    *self.v.get() = val;
                    old
                })
            }

            pub fn compare_exchange(
                &self,
                current: $prim,
                new: $prim,
                _success: Ordering,
                _failure: Ordering,
            ) -> core::result::Result<$prim, $prim> {
                with_wide_lock(|| unsafe {
                    let old = *self.v.get();
                    if old == current {
                        *self.v.get() = new;
                        Ok(old)
                    } else {
                        Err(old)
                    }
                })
            }

            /// The lock makes the weak form as strong as the strong one.
            pub fn compare_exchange_weak(
                &self,
                current: $prim,
                new: $prim,
                success: Ordering,
                failure: Ordering,
            ) -> core::result::Result<$prim, $prim> {
                self.compare_exchange(current, new, success, failure)
            }

            pub fn fetch_add(&self, val: $prim, _order: Ordering) -> $prim {
                with_wide_lock(|| unsafe {
                    let old = *self.v.get();
                    *self.v.get() = old.wrapping_add(val);
                    old
                })
            }

            pub fn fetch_sub(&self, val: $prim, _order: Ordering) -> $prim {
                with_wide_lock(|| unsafe {
                    let old = *self.v.get();
                    *self.v.get() = old.wrapping_sub(val);
                    old
                })
            }

            pub fn fetch_and(&self, val: $prim, _order: Ordering) -> $prim {
                with_wide_lock(|| unsafe {
                    let old = *self.v.get();
                    *self.v.get() = old & val;
                    old
                })
            }

            pub fn fetch_or(&self, val: $prim, _order: Ordering) -> $prim {
                with_wide_lock(|| unsafe {
                    let old = *self.v.get();
                    *self.v.get() = old | val;
                    old
                })
            }

            pub fn fetch_xor(&self, val: $prim, _order: Ordering) -> $prim {
                with_wide_lock(|| unsafe {
                    let old = *self.v.get();
                    *self.v.get() = old ^ val;
                    old
                })
            }
        }
    };
}

wide_atomic! {
    /// A 64-bit atomic integer backed by the process-wide wide-atomic lock.
    AtomicU64, u64
}
wide_atomic! {
    /// Signed companion of [`AtomicU64`].
    AtomicI64, i64
}

/// The operations a synchronic needs from an atomic object.
///
/// Implemented for every lock-free atomic type and for the wide fallback
/// types above, so the same waiting code serves both.
pub trait AtomicValue {
    type Prim: Copy + PartialEq;

    fn load(&self, order: Ordering) -> Self::Prim;
    fn store(&self, val: Self::Prim, order: Ordering);
    fn swap(&self, val: Self::Prim, order: Ordering) -> Self::Prim;
}

macro_rules! impl_atomic_value {
    ($($prim:ident),* $(,)?) => {
        $(
            paste::paste! {
                impl AtomicValue for [<Atomic $prim:camel>] {
                    type Prim = $prim;

                    #[inline]
                    fn load(&self, order: Ordering) -> $prim {
                        Self::load(self, order)
                    }

                    #[inline]
                    fn store(&self, val: $prim, order: Ordering) {
                        Self::store(self, val, order)
                    }

                    #[inline]
                    fn swap(&self, val: $prim, order: Ordering) -> $prim {
                        Self::swap(self, val, order)
                    }
                }
            }
        )*
    };
}

impl_atomic_value!(bool, u8, u16, u32, usize, i8, i16, i32, isize, u64, i64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_atomic_basics() {
        let a = AtomicU64::new(1 << 40);
        assert!(!a.is_lock_free());
        assert_eq!(a.load(Ordering::SeqCst), 1 << 40);
        assert_eq!(a.fetch_add(2, Ordering::SeqCst), 1 << 40);
        assert_eq!(a.load(Ordering::SeqCst), (1 << 40) + 2);
        assert_eq!(a.swap(7, Ordering::SeqCst), (1 << 40) + 2);
        assert_eq!(
            a.compare_exchange(7, 9, Ordering::SeqCst, Ordering::SeqCst),
            Ok(7)
        );
        assert_eq!(
            a.compare_exchange(7, 11, Ordering::SeqCst, Ordering::SeqCst),
            Err(9)
        );
    }

    #[test]
    fn atomic_value_is_object_agnostic() {
        fn probe<A: AtomicValue>(a: &A, expect: A::Prim) -> bool {
            a.load(Ordering::SeqCst) == expect
        }

        let narrow = AtomicU32::new(5);
        let wide = AtomicU64::new(5);
        assert!(probe(&narrow, 5));
        assert!(probe(&wide, 5));
    }
}
