//! Outcome codes and fatal errors for session operations.
//!
//! Every caller-facing operation completes with a [`CastStatus`]
//! delivered through the session's event stream. Only developer misuse
//! surfaces as a [`SessionError`]; all protocol and transport failures
//! are recoverable and reported as statuses.

use std::io;
use thiserror::Error;

/// Completion status for session and channel operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastStatus {
    /// Operation succeeded
    Ok,
    /// Transport connect/read/write failure
    NetworkError,
    /// Heartbeat or request deadline exceeded
    Timeout,
    /// Distinguished socket-level authentication failure
    AuthenticationFailed,
    /// Malformed local call, e.g. missing destination endpoint
    InvalidRequest,
    /// Payload exceeds the wire size cap
    MessageTooLarge,
    /// Receiver reports the application is not installed
    ApplicationNotFound,
    /// Receiver reports the application is not running
    ApplicationNotRunning,
    /// Media command rejected in the current player state
    InvalidPlayerState,
    /// Media load failed
    LoadFailed,
    /// Media load preempted by another load
    LoadCancelled,
    /// Unclassified receiver-side failure
    Internal,
}

impl CastStatus {
    /// Whether this status reports success
    pub fn is_ok(self) -> bool {
        self == CastStatus::Ok
    }

    /// Classify a transport error into a disconnect status.
    ///
    /// A small class of socket errors is surfaced as an authentication
    /// failure; everything else is a generic network error.
    pub fn from_transport_error(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied | io::ErrorKind::ConnectionAborted => {
                CastStatus::AuthenticationFailed
            }
            _ => CastStatus::NetworkError,
        }
    }
}

/// Unrecoverable local misuse of the session API.
///
/// This is the only error class that propagates as a `Result`; it
/// never originates from the transport or the receiver.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session task is gone; the handle is stale
    #[error("session task is no longer running")]
    Detached,

    /// Operation rejected before any I/O was attempted
    #[error("request rejected: {0:?}")]
    Rejected(CastStatus),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_classification() {
        let auth = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(
            CastStatus::from_transport_error(&auth),
            CastStatus::AuthenticationFailed
        );

        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(
            CastStatus::from_transport_error(&refused),
            CastStatus::NetworkError
        );
    }
}
