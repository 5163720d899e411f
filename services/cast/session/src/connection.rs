//! Virtual-connection handshake channel.
//!
//! A CONNECT must be sent to an endpoint before any other channel may
//! address it, and a CLOSE when the endpoint is released. Both are
//! fire-and-forget with best-effort error logging; there is no request
//! tracking on this namespace.

use crate::channel::{CastChannel, ChannelEvent, ConnectionEvent, MessageSender};
use cast_wire::control::{TYPE_CLOSE, TYPE_CONNECT};
use cast_wire::{message_type, CastMessage, ConnectionControl, SenderInfo};
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Virtual-connection channel
pub struct ConnectionChannel {
    namespace: String,
    sender_info: SenderInfo,
    sender: Option<MessageSender>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    connected: HashSet<String>,
}

impl ConnectionChannel {
    /// Create a connection channel with the given sender identity
    pub fn new(
        namespace: impl Into<String>,
        sender_info: SenderInfo,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            sender_info,
            sender: None,
            events,
            connected: HashSet::new(),
        }
    }

    /// Bind the sending capability
    pub fn bind(&mut self, sender: MessageSender) {
        self.sender = Some(sender);
    }

    /// Drop the sending capability
    pub fn unbind(&mut self) {
        self.sender = None;
        self.reset();
    }

    /// Open a virtual connection to `endpoint` (idempotent)
    pub fn connect_to(&mut self, endpoint: &str) {
        if self.connected.contains(endpoint) {
            return;
        }
        let Some(sender) = &self.sender else {
            warn!("CONNECT to {} requested while unbound", endpoint);
            return;
        };
        let connect = ConnectionControl::Connect {
            origin: serde_json::json!({}),
            sender_info: self.sender_info.clone(),
        };
        let body = serde_json::to_string(&connect).expect("connect body serializes");
        match sender.send_text(&self.namespace, endpoint, body) {
            Ok(()) => {
                self.connected.insert(endpoint.to_string());
                debug!("Sent CONNECT to {}", endpoint);
            }
            Err(e) => warn!("Failed to queue CONNECT to {}: {}", endpoint, e),
        }
    }

    /// Close the virtual connection to `endpoint`
    pub fn close(&mut self, endpoint: &str) {
        if !self.connected.remove(endpoint) {
            return;
        }
        let Some(sender) = &self.sender else {
            return;
        };
        let body = serde_json::to_string(&ConnectionControl::Close).expect("close body serializes");
        if let Err(e) = sender.send_text(&self.namespace, endpoint, body) {
            warn!("Failed to queue CLOSE to {}: {}", endpoint, e);
        } else {
            debug!("Sent CLOSE to {}", endpoint);
        }
    }

    /// Whether a CONNECT has been sent to `endpoint`
    pub fn is_connected_to(&self, endpoint: &str) -> bool {
        self.connected.contains(endpoint)
    }
}

impl CastChannel for ConnectionChannel {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn on_text_message(&mut self, message: &CastMessage) {
        let Some(body) = message.body() else {
            return;
        };
        match message_type(body).as_deref() {
            Some(TYPE_CLOSE) => {
                self.connected.remove(&message.source_id);
                let _ = self.events.send(ChannelEvent::Connection(ConnectionEvent::PeerClosed {
                    endpoint: message.source_id.clone(),
                }));
            }
            Some(TYPE_CONNECT) => {
                debug!("Unexpected CONNECT from {}", message.source_id);
            }
            other => {
                debug!("Unrecognized connection message type {:?}", other);
            }
        }
    }

    fn reset(&mut self) {
        self.connected.clear();
    }
}
