//! Error taxonomy shared by the pipe, router, and channel layers.

use std::io;

use thiserror::Error;

/// Fallback errno for I/O failures that carry no OS error code.
const EIO: i32 = 5;

/// Errors surfaced by the routing core.
///
/// Values are `Copy`/`PartialEq` so a completion error can travel inside a
/// `ChannelEnd` frame and be compared in tests. I/O failures carry the raw
/// OS errno rather than an `io::Error` for the same reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum RouteError {
    /// Malformed input: a bad connection string, an oversized or malformed
    /// frame, or an undecodable envelope or payload.
    #[error("invalid argument")]
    InvalidArgument,
    /// Send attempted before the handshake completed or after disconnect.
    #[error("not connected")]
    NotConnected,
    /// Duplicate channel factory registration.
    #[error("already exists")]
    AlreadyExists,
    /// Explicit cancellation or router teardown.
    #[error("canceled")]
    Canceled,
    /// OS syscall failure, identified by errno.
    #[error("I/O error (errno {0})")]
    Io(i32),
    /// Error code received from the peer that maps to nothing local.
    #[error("error code {0}")]
    Other(i32),
}

impl RouteError {
    /// Wire representation carried in `ChannelEnd.error_code`.
    ///
    /// `0` is reserved for "no error". Positive values are OS errnos and
    /// negative values are the semantic codes; this function never returns
    /// `0`.
    #[must_use]
    pub fn to_wire(self) -> i32 {
        match self {
            Self::Canceled => -1,
            Self::InvalidArgument => -2,
            Self::NotConnected => -3,
            Self::AlreadyExists => -4,
            Self::Io(errno) => errno.max(1),
            Self::Other(code) if code != 0 => code,
            Self::Other(_) => -2,
        }
    }

    /// Inverse of [`to_wire`](Self::to_wire). `0` decodes to `None`.
    #[must_use]
    pub fn from_wire(code: i32) -> Option<Self> {
        match code {
            0 => None,
            -1 => Some(Self::Canceled),
            -2 => Some(Self::InvalidArgument),
            -3 => Some(Self::NotConnected),
            -4 => Some(Self::AlreadyExists),
            errno if errno > 0 => Some(Self::Io(errno)),
            other => Some(Self::Other(other)),
        }
    }
}

impl From<io::Error> for RouteError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => Self::InvalidArgument,
            io::ErrorKind::NotConnected => Self::NotConnected,
            _ => Self::Io(err.raw_os_error().unwrap_or(EIO)),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RouteError>;
