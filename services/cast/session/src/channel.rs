//! Channel abstraction and the sender capability channels are bound to.
//!
//! A channel is a namespace-scoped handler mounted into a session. It
//! builds requests, parses replies for its own namespace, and never
//! sees another channel's traffic. Outbound messages and channel
//! events travel over queues owned by the session actor, which keeps
//! every channel single-threaded.

use crate::media::{MediaOp, MediaUpdateMask};
use crate::status::CastStatus;
use bytes::Bytes;
use cast_wire::{CastMessage, WireError};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// A namespace-scoped protocol handler mounted into a session
pub trait CastChannel: Send {
    /// Namespace this channel owns
    fn namespace(&self) -> &str;

    /// Handle an inbound text message on this namespace
    fn on_text_message(&mut self, message: &CastMessage);

    /// Handle an inbound binary message on this namespace
    fn on_binary_message(&mut self, message: &CastMessage) {
        debug!(
            "Dropping binary message on {} ({} bytes)",
            self.namespace(),
            message.payload.len()
        );
    }

    /// Notify that an outbound request failed before reaching the wire
    fn on_send_failed(&mut self, _request_id: i64, _status: CastStatus) {}

    /// Clear in-flight trackers on disconnect, without callbacks
    fn reset(&mut self);

    /// Expire overdue trackers; returns whether any timeout fired
    fn sweep(&mut self, _now: std::time::Instant) -> bool {
        false
    }

    /// Whether any tracker is outstanding
    fn has_outstanding(&self) -> bool {
        false
    }
}

/// Sending capability handed to a channel when it is mounted.
///
/// Messages are queued to the owning session's writer; the queue is
/// drained on the session task, so sends never block the channel.
#[derive(Clone)]
pub struct MessageSender {
    source_id: String,
    outbound: mpsc::UnboundedSender<CastMessage>,
    next_request_id: Arc<AtomicI64>,
}

impl MessageSender {
    /// Create a sender writing into the session's outbound queue
    pub fn new(source_id: impl Into<String>, outbound: mpsc::UnboundedSender<CastMessage>) -> Self {
        Self {
            source_id: source_id.into(),
            outbound,
            next_request_id: Arc::new(AtomicI64::new(1)),
        }
    }

    /// Endpoint id used as the source of every message
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Allocate the next payload-level request id
    pub fn next_request_id(&self) -> i64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue a text message after validating its bounds
    pub fn send_text(
        &self,
        namespace: &str,
        destination_id: &str,
        body: impl Into<String>,
    ) -> Result<(), WireError> {
        let message = CastMessage::text(self.source_id.as_str(), destination_id, namespace, body);
        message.validate()?;
        // The queue only closes when the session is tearing down.
        let _ = self.outbound.send(message);
        Ok(())
    }

    /// Queue a binary message after validating its bounds
    pub fn send_binary(
        &self,
        namespace: &str,
        destination_id: &str,
        payload: Bytes,
    ) -> Result<(), WireError> {
        let message = CastMessage::binary(self.source_id.as_str(), destination_id, namespace, payload);
        message.validate()?;
        let _ = self.outbound.send(message);
        Ok(())
    }
}

/// Events channels hand back to the owning session
#[derive(Debug)]
pub enum ChannelEvent {
    /// Event from the connection channel
    Connection(ConnectionEvent),
    /// Event from the receiver control channel
    Receiver(ReceiverEvent),
    /// Event from the media control channel
    Media(MediaEvent),
}

/// Events from the connection channel
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The peer closed its side of a virtual connection
    PeerClosed {
        /// Endpoint id that went away
        endpoint: String,
    },
}

/// Events from the receiver control channel
#[derive(Debug)]
pub enum ReceiverEvent {
    /// A status push or reply arrived
    StatusUpdated {
        /// The reported status
        status: cast_wire::ReceiverStatus,
    },
    /// The targeted application is running and addressable
    ApplicationConnected {
        /// Application metadata; `transport_id` is guaranteed present
        app: cast_wire::ApplicationInfo,
    },
    /// The targeted or connected application is gone
    ApplicationGone {
        /// Why the application is unreachable
        status: CastStatus,
    },
    /// The caller asked to detach from the connected application
    LeaveRequested {
        /// Transport endpoint to close
        transport_id: String,
    },
    /// A tracked receiver operation completed
    Operation {
        /// Which operation slot completed
        op: crate::receiver::ReceiverOp,
        /// Correlation id of the request
        request_id: i64,
        /// Completion status
        status: CastStatus,
    },
}

/// Events from the media control channel
#[derive(Debug)]
pub enum MediaEvent {
    /// The media status snapshot changed
    StatusUpdated {
        /// Which parts of the snapshot changed
        mask: MediaUpdateMask,
    },
    /// The loaded media's metadata changed
    MetadataUpdated,
    /// A tracked media operation completed
    Operation {
        /// Which operation slot completed
        op: MediaOp,
        /// Correlation id of the request
        request_id: i64,
        /// Completion status
        status: CastStatus,
    },
}
