//! Message envelope, framing, and payload types for the cast protocol.
//!
//! This crate provides the low-level wire layer shared by the session
//! engine and the discovery prober: the namespace-scoped message
//! envelope, length-prefixed JSON framing, and the typed payload
//! bodies exchanged on the built-in namespaces.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 frame_len        | length of bytes that follow|
//! +----------------------+----------------------------+
//! | JSON envelope        | type, protocolVersion,     |
//! |                      | sourceId, destinationId,   |
//! |                      | namespace,                 |
//! |                      | payloadUtf8 | payloadBinary|
//! +----------------------+----------------------------+
//! ```
//!
//! Request/response correlation on the built-in namespaces uses an
//! integer `requestId` inside the JSON payload body, distinct from any
//! transport-level identifier.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod control;
pub mod error;
pub mod media;
pub mod message;
pub mod namespaces;
pub mod receiver;

// Re-export main types
pub use codec::{encode_message, FrameDecoder, LENGTH_PREFIX_SIZE};
pub use control::{ConnectionControl, Heartbeat, SenderInfo};
pub use error::WireError;
pub use media::{
    MediaInformation, MediaRequest, MediaStatus, MediaStatusMessage, PlayerState, ResumeState,
    StreamType,
};
pub use message::{message_type, CastMessage, Payload};
pub use namespaces::{
    ENDPOINT_BROADCAST, ENDPOINT_RECEIVER, ENDPOINT_SENDER, MAX_BINARY_PAYLOAD, MAX_FRAME_SIZE,
    MAX_NAMESPACE_LEN, MAX_TEXT_PAYLOAD, NS_CONNECTION, NS_HEARTBEAT, NS_MEDIA, NS_RECEIVER,
    PROTOCOL_VERSION,
};
pub use receiver::{
    AppAvailabilityResponse, ApplicationInfo, ErrorResponse, NamespaceEntry, ReceiverRequest,
    ReceiverStatus, ReceiverStatusMessage, ReceiverVolume,
};
