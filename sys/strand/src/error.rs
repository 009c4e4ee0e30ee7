// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error reporting for the layer.
//!
//! Every blocking and constructing API returns `Result<_, Error>`. An
//! [`Error`] is an [`ErrorCode`] plus the source location of the call that
//! raised it, captured through `#[track_caller]` -- cheap enough to carry
//! everywhere and enough to find the failing call in a crash dump.
//!
//! Timeouts are deliberately *not* errors; timed waits report them through
//! their return values.

use core::fmt;
use core::panic::Location;

use abi::Status;

/// What went wrong.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    /// A non-recursive mutex would have deadlocked on its own owner.
    DeadlockWouldOccur,
    /// Join/detach attempted on a thread handle that has none to give.
    OperationNotPermitted,
    /// Stack size out of range.
    InvalidArgument,
    /// Stack too small for the shared state, or stack allocation disabled
    /// when it would have been needed.
    NotEnoughMemory,
    /// The kernel refused to create the task.
    NoChildProcess,
    /// The promise side went away without supplying a value.
    BrokenPromise,
    /// A second future was requested from the same promise.
    FutureAlreadyRetrieved,
    /// The promise was satisfied twice.
    PromiseAlreadySatisfied,
    /// The future or promise has no shared state.
    NoState,
    /// A kernel service failed; the status passes through.
    Kernel(Status),
}

/// An error code decorated with the location that raised it.
#[derive(Copy, Clone, Debug)]
pub struct Error {
    code: ErrorCode,
    location: &'static Location<'static>,
}

impl Error {
    #[track_caller]
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            location: Location::caller(),
        }
    }

    /// Wraps a kernel status that indicates failure.
    #[track_caller]
    pub(crate) fn kernel(status: Status) -> Self {
        Self {
            code: ErrorCode::Kernel(status),
            location: Location::caller(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        // Two errors are the same error regardless of where they were
        // raised; the location is diagnostic payload.
        self.code == other.code
    }
}

impl PartialEq<ErrorCode> for Error {
    fn eq(&self, other: &ErrorCode) -> bool {
        self.code == *other
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self.code {
            ErrorCode::DeadlockWouldOccur => "resource deadlock would occur",
            ErrorCode::OperationNotPermitted => "operation not permitted",
            ErrorCode::InvalidArgument => "invalid argument",
            ErrorCode::NotEnoughMemory => "not enough memory",
            ErrorCode::NoChildProcess => "no child process",
            ErrorCode::BrokenPromise => "broken promise",
            ErrorCode::FutureAlreadyRetrieved => "future already retrieved",
            ErrorCode::PromiseAlreadySatisfied => "promise already satisfied",
            ErrorCode::NoState => "no state",
            ErrorCode::Kernel(status) => {
                return write!(
                    f,
                    "kernel error {:?} (at {}:{})",
                    status,
                    self.location.file(),
                    self.location.line()
                )
            }
        };
        write!(
            f,
            "{} (at {}:{})",
            text,
            self.location.file(),
            self.location.line()
        )
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_compare_by_code() {
        let a = Error::new(ErrorCode::NoState);
        let b = Error::new(ErrorCode::NoState);
        assert_eq!(a, b);
        assert_eq!(a, ErrorCode::NoState);
        assert_ne!(a, Error::new(ErrorCode::BrokenPromise));
    }

    #[test]
    fn location_points_at_raiser() {
        let e = Error::new(ErrorCode::InvalidArgument);
        assert!(e.location().file().ends_with("error.rs"));
    }
}
