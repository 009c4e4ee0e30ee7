// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed trace ring buffers.
//!
//! A ring buffer declared with [`ringbuf!`] records fixed-size typed entries
//! with the source line and a repeat count, so a tight loop recording the
//! same event does not flush the interesting history out of the buffer. The
//! buffers are static and can be read out of a memory dump by the debug
//! tooling; nothing ever formats on the recording path.
//!
//! Recording is not interrupt-reentrant: a buffer shared between task and
//! interrupt context must only be recorded to from one of them.

#![no_std]

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Declares a ring buffer in the current module or context.
///
/// `ringbuf!(NAME, Type, N, expr)` makes a ring buffer named `NAME` with
/// room for `N` entries of payload type `Type`, all initialized to `expr`.
///
/// The resulting buffer is static, so `NAME` should be uppercase. To support
/// the common case of one buffer per module, omitting the name declares
/// `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[used]
        static $name: $crate::StaticCell<$crate::Ringbuf<$t, $n>> =
            $crate::StaticCell::new($crate::Ringbuf {
                last: None,
                buffer: [$crate::RingbufEntry {
                    line: 0,
                    generation: 0,
                    count: 0,
                    payload: $init,
                }; $n],
            });
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: ($t, usize) = ($init, $n);
    };
    ($t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: ($t, usize) = ($init, $n);
    };
}

/// Inserts data into a ring buffer declared with [`ringbuf!`].
///
/// `ringbuf_entry!(NAME, expr)` inserts `expr` into `NAME`; the one-argument
/// form records into the module's unnamed `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        $crate::StaticCell::borrow_mut(&$buf).entry(line!() as u16, $payload);
    }};
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let _ = &$payload;
    }};
    ($payload:expr) => {{
        let _ = &$payload;
    }};
}

/// One recorded event.
#[derive(Debug, Copy, Clone)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    /// Source line of the recording site.
    pub line: u16,
    /// Wrap count of the buffer when this entry was written; distinguishes a
    /// fresh entry from a stale one at the same index.
    pub generation: u16,
    /// Number of consecutive times this payload was recorded from this line.
    pub count: u32,
    pub payload: T,
}

/// A ring buffer of parameterized payload type and size. In practice,
/// instantiating this directly is strange -- see the [`ringbuf!`] macro.
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, { N }> {
    pub fn entry(&mut self, line: u16, payload: T) {
        // Coalesce a repeat of the previous event into its count.
        if let Some(last) = self.last {
            let ent = &mut self.buffer[last];
            if ent.line == line && ent.payload == payload {
                ent.count = ent.count.saturating_add(1);
                return;
            }
        }

        let ndx = match self.last {
            None => 0,
            Some(last) => {
                if last + 1 >= self.buffer.len() {
                    0
                } else {
                    last + 1
                }
            }
        };

        let generation = self.buffer[ndx].generation.wrapping_add(1);
        self.buffer[ndx] = RingbufEntry {
            line,
            generation,
            count: 1,
            payload,
        };
        self.last = Some(ndx);
    }
}

/// A cell for sharing a static ring buffer between recording sites.
///
/// Claims are checked: two simultaneous `borrow_mut` calls panic rather than
/// alias. The expected use is short single-threaded claims from recording
/// macros.
pub struct StaticCell<T> {
    claimed: AtomicBool,
    cell: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for StaticCell<T> {}

impl<T> StaticCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            claimed: AtomicBool::new(false),
            cell: UnsafeCell::new(value),
        }
    }

    pub fn borrow_mut(&self) -> StaticRef<'_, T> {
        let already = self.claimed.swap(true, Ordering::Acquire);
        if already {
            panic!();
        }
        StaticRef { cell: self }
    }
}

pub struct StaticRef<'a, T> {
    cell: &'a StaticCell<T>,
}

impl<T> Deref for StaticRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the claim flag gives us exclusive access for the lifetime
        // of this guard.
        unsafe { &*self.cell.cell.get() }
    }
}

impl<T> DerefMut for StaticRef<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: as above.
        unsafe { &mut *self.cell.cell.get() }
    }
}

impl<T> Drop for StaticRef<'_, T> {
    fn drop(&mut self) {
        self.cell.claimed.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_repeats() {
        let mut buf: Ringbuf<u8, 4> = Ringbuf {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: 0,
            }; 4],
        };
        buf.entry(10, 7);
        buf.entry(10, 7);
        buf.entry(10, 7);
        assert_eq!(buf.last, Some(0));
        assert_eq!(buf.buffer[0].count, 3);

        buf.entry(11, 7);
        assert_eq!(buf.last, Some(1));
        assert_eq!(buf.buffer[1].count, 1);
    }

    #[test]
    fn wraps_and_bumps_generation() {
        let mut buf: Ringbuf<u8, 2> = Ringbuf {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: 0,
            }; 2],
        };
        for i in 0..5 {
            buf.entry(i as u16, i);
        }
        assert_eq!(buf.last, Some(0));
        // Index 0 was written by entries 0, 2 and 4.
        assert_eq!(buf.buffer[0].generation, 3);
    }

    #[test]
    fn static_cell_claims() {
        static CELL: StaticCell<u32> = StaticCell::new(1);
        {
            let mut v = CELL.borrow_mut();
            *v += 1;
        }
        assert_eq!(*CELL.borrow_mut(), 2);
    }
}
