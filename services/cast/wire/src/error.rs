//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Incomplete frame (need more data)
    #[error("incomplete frame")]
    Incomplete,

    /// Payload size limit exceeded
    #[error("message too large: {size} bytes (limit {limit})")]
    TooLarge {
        /// Offending payload size
        size: usize,
        /// Applicable limit
        limit: usize,
    },

    /// Frame length prefix exceeds the frame cap
    #[error("frame too large: {0} bytes")]
    FrameSize(usize),

    /// Zero-length namespace
    #[error("empty namespace")]
    EmptyNamespace,

    /// Namespace longer than the allowed maximum
    #[error("namespace too long: {0} bytes")]
    NamespaceLength(usize),

    /// Envelope carries no payload field matching its type
    #[error("missing payload")]
    MissingPayload,

    /// Binary payload is not valid base64
    #[error("invalid base64 payload")]
    Base64,

    /// Envelope is not valid JSON or has the wrong shape
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
}
