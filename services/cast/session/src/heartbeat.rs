//! Keep-alive channel with PING/PONG and activity tracking.
//!
//! The owning session ticks this channel once per [`HEARTBEAT_TICK`]
//! while connected. Any inbound traffic on any namespace counts as
//! activity, not just heartbeat replies.

use crate::channel::{CastChannel, MessageSender};
use cast_wire::{message_type, CastMessage, Heartbeat};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Fixed interval between heartbeat ticks
pub const HEARTBEAT_TICK: Duration = Duration::from_millis(1000);

/// Keep-alive channel
pub struct HeartbeatChannel {
    namespace: String,
    destination: String,
    sender: Option<MessageSender>,
    last_activity: Instant,
}

impl HeartbeatChannel {
    /// Create a heartbeat channel addressing the given endpoint
    pub fn new(namespace: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            destination: destination.into(),
            sender: None,
            last_activity: Instant::now(),
        }
    }

    /// Bind the sending capability and restart the activity clock
    pub fn bind(&mut self, sender: MessageSender) {
        self.sender = Some(sender);
        self.last_activity = Instant::now();
    }

    /// Drop the sending capability
    pub fn unbind(&mut self) {
        self.sender = None;
        self.reset();
    }

    /// Send one keep-alive ping
    pub fn send_ping(&mut self) {
        let Some(sender) = &self.sender else {
            return;
        };
        let body = serde_json::to_string(&Heartbeat::Ping).expect("ping body serializes");
        if let Err(e) = sender.send_text(&self.namespace, &self.destination, body) {
            warn!("Failed to queue PING: {}", e);
        }
    }

    /// Record inbound traffic at `now`
    pub fn note_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Whether the link has been silent for at least `timeout`
    pub fn is_timeout(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_activity) >= timeout
    }
}

impl CastChannel for HeartbeatChannel {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn on_text_message(&mut self, message: &CastMessage) {
        let Some(body) = message.body() else {
            return;
        };
        match serde_json::from_str::<Heartbeat>(body) {
            Ok(Heartbeat::Ping) => {
                // Answer the device's own keep-alive probe.
                if let Some(sender) = &self.sender {
                    let pong = serde_json::to_string(&Heartbeat::Pong).expect("pong body serializes");
                    if let Err(e) = sender.send_text(&self.namespace, &message.source_id, pong) {
                        warn!("Failed to queue PONG: {}", e);
                    }
                }
            }
            Ok(Heartbeat::Pong) => {
                debug!("Received PONG from {}", message.source_id);
            }
            Err(_) => {
                debug!(
                    "Unrecognized heartbeat message type {:?}",
                    message_type(body)
                );
            }
        }
    }

    fn reset(&mut self) {
        self.last_activity = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cast_wire::{ENDPOINT_RECEIVER, ENDPOINT_SENDER, NS_HEARTBEAT};
    use tokio::sync::mpsc;

    fn bound_channel() -> (HeartbeatChannel, mpsc::UnboundedReceiver<CastMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut channel = HeartbeatChannel::new(NS_HEARTBEAT, ENDPOINT_RECEIVER);
        channel.bind(MessageSender::new(ENDPOINT_SENDER, tx));
        (channel, rx)
    }

    #[test]
    fn test_ping_is_answered_with_pong() {
        let (mut channel, mut rx) = bound_channel();

        let ping = CastMessage::text(
            ENDPOINT_RECEIVER,
            ENDPOINT_SENDER,
            NS_HEARTBEAT,
            r#"{"type":"PING"}"#,
        );
        channel.on_text_message(&ping);

        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.namespace, NS_HEARTBEAT);
        assert_eq!(reply.destination_id, ENDPOINT_RECEIVER);
        assert_eq!(reply.body(), Some(r#"{"type":"PONG"}"#));
    }

    #[test]
    fn test_timeout_tracks_activity() {
        let (mut channel, _rx) = bound_channel();
        let timeout = Duration::from_secs(10);
        let start = Instant::now();

        channel.note_activity(start);
        assert!(!channel.is_timeout(start + Duration::from_secs(9), timeout));
        assert!(channel.is_timeout(start + Duration::from_secs(10), timeout));

        // Fresh traffic pushes the deadline out.
        channel.note_activity(start + Duration::from_secs(10));
        assert!(!channel.is_timeout(start + Duration::from_secs(19), timeout));
    }
}
