//! Fixed protocol constants that should NOT be changed.
//!
//! These values are defined by the receiver protocol and changing them
//! would break compatibility with deployed devices.

/// Wire protocol version carried in every message envelope.
pub const PROTOCOL_VERSION: u32 = 0;

/// Namespace for the virtual-connection handshake (CONNECT/CLOSE).
pub const NS_CONNECTION: &str = "urn:x-cast:com.google.cast.tp.connection";

/// Namespace for the keep-alive channel (PING/PONG).
pub const NS_HEARTBEAT: &str = "urn:x-cast:com.google.cast.tp.heartbeat";

/// Namespace for receiver application lifecycle and volume control.
pub const NS_RECEIVER: &str = "urn:x-cast:com.google.cast.receiver";

/// Namespace for media playback control.
pub const NS_MEDIA: &str = "urn:x-cast:com.google.cast.media";

/// Well-known endpoint id of the device-side receiver runtime.
pub const ENDPOINT_RECEIVER: &str = "receiver-0";

/// Default endpoint id used as the sender side of every message.
pub const ENDPOINT_SENDER: &str = "sender-0";

/// Broadcast destination addressed by unsolicited status pushes.
pub const ENDPOINT_BROADCAST: &str = "*";

/// Maximum UTF-8 text payload size in bytes (64 KiB).
///
/// A payload of exactly this size is still valid; one byte more is the
/// distinct "message too large" condition.
pub const MAX_TEXT_PAYLOAD: usize = 64 * 1024;

/// Maximum binary payload size in bytes (128 KiB).
pub const MAX_BINARY_PAYLOAD: usize = 128 * 1024;

/// Maximum encoded frame size (length prefix + JSON envelope).
///
/// Large enough for a maximal binary payload after base64 expansion.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Maximum length of a namespace string in bytes.
pub const MAX_NAMESPACE_LEN: usize = 128;
