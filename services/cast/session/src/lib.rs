//! Device session engine for the cast protocol.
//!
//! This crate implements the client side of a remote-receiver session:
//! a per-device connection state machine multiplexing logical channels
//! (connection handshake, heartbeat, receiver control, media control)
//! over one TCP transport, with request/response tracking, timeouts,
//! and a windowed reconnection policy.
//!
//! ## Concurrency model
//!
//! Every session is an actor: one tokio task owns all session state
//! and serializes commands, timer firings, and channel callbacks. The
//! transport read loop runs on a separate task and hands decoded
//! messages to the session task, never touching state directly.
//!
//! ## Example
//!
//! ```rust,no_run
//! use cast_session::{DeviceSession, SessionConfig, SessionEvent};
//!
//! # async fn example() {
//! let addr = "192.168.1.40:8009".parse().unwrap();
//! let (session, mut events) = DeviceSession::spawn(addr, SessionConfig::default());
//! session.connect().unwrap();
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SessionEvent::Connected => {
//!             session.launch_application("CC1AD845", None, false).unwrap();
//!         }
//!         SessionEvent::ApplicationConnected { app } => {
//!             println!("connected to {}", app.app_id);
//!         }
//!         SessionEvent::Disconnected { status } => {
//!             println!("disconnected: {:?}", status);
//!             break;
//!         }
//!         _ => {}
//!     }
//! }
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod connection;
pub mod heartbeat;
pub mod media;
pub mod receiver;
pub mod reconnect;
pub mod session;
pub mod status;
pub mod tracker;
pub mod transport;

// Re-export main types
pub use channel::{CastChannel, ChannelEvent, MessageSender};
pub use connection::ConnectionChannel;
pub use heartbeat::{HeartbeatChannel, HEARTBEAT_TICK};
pub use media::{MediaControlChannel, MediaOp, MediaUpdateMask};
pub use receiver::{ReceiverControlChannel, ReceiverOp};
pub use reconnect::{ReconnectStrategy, RetryDecision, MAX_RECONNECT_WINDOW, RETRY_SPACING};
pub use session::{
    ConnectionState, DeviceSession, ProtocolProfile, SessionConfig, SessionEvent,
};
pub use status::{CastStatus, SessionError};
pub use tracker::{RequestTracker, TrackerCallback};
pub use transport::{connect_tcp, recv_message, send_message, SendError};
