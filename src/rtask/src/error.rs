//! The error type shared by every fallible operation in this crate.
use core::fmt;

pub type Result<T> = core::result::Result<T, Error>;

/// Why a task or timer operation failed.
///
/// The first five variants are the crate's own validation and precondition
/// failures; [`Error::Os`] carries a failure reported by the underlying
/// threading or clock layer verbatim. [`Error::as_neg_errno`] maps every
/// variant back to the conventional negated `errno` value for callers that
/// bridge into C-style status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A parameter failed validation.
    InvalidArgument,
    /// The target task is in the wrong state for the operation.
    WouldBlock,
    /// No target task was given and the calling thread does not run one.
    NotPermitted,
    /// A periodic release deadline was missed.
    TimedOut,
    /// The task has been asked to stop.
    Canceled,
    /// A failure reported by the OS, unchanged.
    Os(errno::Errno),
}

impl Error {
    /// The negated `errno` value corresponding to this error.
    pub fn as_neg_errno(self) -> i32 {
        -match self {
            Self::InvalidArgument => libc::EINVAL,
            Self::WouldBlock => libc::EWOULDBLOCK,
            Self::NotPermitted => libc::EPERM,
            Self::TimedOut => libc::ETIMEDOUT,
            Self::Canceled => libc::ECANCELED,
            Self::Os(errno::Errno(code)) => code,
        }
    }

    /// Does this error wrap the OS error `code`?
    pub fn is_os(self, code: i32) -> bool {
        self == Self::Os(errno::Errno(code))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => f.write_str("invalid argument"),
            Self::WouldBlock => f.write_str("not allowed in the task's current state"),
            Self::NotPermitted => f.write_str("no target task"),
            Self::TimedOut => f.write_str("release deadline missed"),
            Self::Canceled => f.write_str("stop requested"),
            Self::Os(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

impl From<errno::Errno> for Error {
    fn from(e: errno::Errno) -> Self {
        Self::Os(e)
    }
}
