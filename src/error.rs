//! The error type shared by both acquisition engines.
//!
//! The host framework distinguishes a fixed set of failure classes and maps
//! them to its own error codes, so every error this crate produces carries
//! one of those classes rather than a free-form message alone.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A configuration value was out of range or malformed.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// The request is well-formed but this device or mode cannot express it.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// A USB read, write or control transfer failed outright.
    #[error("USB I/O failed: {0}")]
    Io(String),

    /// An operation did not complete within its deadline.
    #[error("timed out: {0}")]
    Timeout(&'static str),

    /// The device answered, but not with anything we recognize.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A firmware resource was missing or unusable.
    #[error("resource error: {0}")]
    Resource(String),

    /// The device lacks the requested capability.
    #[error("not available: {0}")]
    NotAvailable(&'static str),

    /// Internal invariant violation; not recoverable at run time.
    #[error("internal error: {0}")]
    Bug(&'static str),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
