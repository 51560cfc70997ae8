//! Error types for the proxy engine.

use std::fmt;
use std::io;

/// Proxy engine errors.
#[derive(Debug)]
pub enum Error {
    /// A protocol invariant was violated: payload size mismatch, impossible
    /// branch, or an unsupported mode (cross-process recv proxy, non-x86
    /// inline flush).
    Internal(&'static str),
    /// An OS call failed (shm, map, IPC open).
    System(io::Error),
    /// The fabric provider reported failure.
    Net(fabric::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
            Error::System(e) => write!(f, "system error: {}", e),
            Error::Net(e) => write!(f, "fabric error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::System(e) => Some(e),
            Error::Net(e) => Some(e),
            Error::Internal(_) => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::System(e)
    }
}

impl From<fabric::Error> for Error {
    fn from(e: fabric::Error) -> Self {
        Error::Net(e)
    }
}

/// Result type for proxy engine operations.
pub type Result<T> = std::result::Result<T, Error>;
