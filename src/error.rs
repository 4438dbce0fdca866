//! Unified error type.

use std::fmt;

/// Returned by [`Server::serve`](crate::Server::serve) when the listener
/// cannot be bound (address in use, permission denied, ...).
///
/// Accept failures on a running listener are logged and skipped, not
/// returned. Nothing on the request path produces an `Error` either:
/// unroutable requests become `404` results, unreadable bodies `400` results,
/// and an unresolvable client address or status is logged as `-`.
#[derive(Debug)]
pub struct Error(std::io::Error);

impl Error {
    /// The I/O kind behind the failure, e.g. `AddrInUse`.
    pub fn kind(&self) -> std::io::ErrorKind {
        self.0.kind()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to bind listener: {}", self.0)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self(e)
    }
}
