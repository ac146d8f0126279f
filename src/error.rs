//! Custom error types for the crate.
//!
//! Two kinds of failure flow through `iio-link` and they are deliberately kept apart:
//!
//! - **Backend failures** are plain negative error codes. A command that fails stores
//!   `-errno` in its result slot and completes normally; nothing is escalated. [`Errno`]
//!   is the typed form of that code while it travels through the backend traits.
//! - **Crate errors** ([`LinkError`]) cover everything that is not a hardware call:
//!   context creation failing in `open()`, misuse of [`crate::outcome::Outcome`],
//!   tickets whose entry was dropped, configuration and worker-pool problems.
//!
//! By using `#[from]`, `LinkError` can be created from underlying error types with `?`.

use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type LinkResult<T> = std::result::Result<T, LinkError>;

/// Positive backend error number (errno numbering).
///
/// Commands store the negated value as their return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub i32);

impl Errno {
    /// No such file or directory.
    pub const ENOENT: Errno = Errno(2);
    /// Input/output error. Also used for commands that panicked.
    pub const EIO: Errno = Errno(5);
    /// Bad file descriptor. Returned for operations on a cancelled buffer.
    pub const EBADF: Errno = Errno(9);
    /// No such device. Returned once a connection's handle has been released.
    pub const ENODEV: Errno = Errno(19);
    /// Invalid argument.
    pub const EINVAL: Errno = Errno(22);
    /// Operation not supported by the backend.
    pub const ENOSYS: Errno = Errno(38);
    /// Connection timed out.
    pub const ETIMEDOUT: Errno = Errno(110);

    /// Build from a raw code of either sign.
    pub fn from_code(code: i32) -> Self {
        Errno(code.saturating_abs())
    }

    /// The negative return code a command stores for this error.
    pub fn as_code(self) -> i32 {
        -self.0
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let os = std::io::Error::from_raw_os_error(self.0);
        write!(f, "{} (errno {})", os, self.0)
    }
}

impl std::error::Error for Errno {}

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Failed to create context for '{uri}': {errno}")]
    ContextCreation { uri: String, errno: Errno },

    #[error("No open connection for '{0}'")]
    NotOpen(String),

    #[error("Connection for '{0}' is being torn down by this thread")]
    Closing(String),

    #[error("Usage error: {0}")]
    Usage(&'static str),

    #[error("Command entry was superseded by a newer overwrite command")]
    Superseded,

    #[error("Command entry was dropped before it finished")]
    QueueDropped,

    #[error("Worker pool error: {0}")]
    WorkerPool(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl LinkError {
    /// Backend errno behind this error, if there is one.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            LinkError::ContextCreation { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}
