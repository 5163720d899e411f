//! Payload bodies for the transport-control namespaces.
//!
//! The connection namespace carries the virtual-connection handshake
//! (CONNECT/CLOSE) and the heartbeat namespace carries PING/PONG.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message type string for CONNECT
pub const TYPE_CONNECT: &str = "CONNECT";
/// Message type string for CLOSE
pub const TYPE_CLOSE: &str = "CLOSE";
/// Message type string for PING
pub const TYPE_PING: &str = "PING";
/// Message type string for PONG
pub const TYPE_PONG: &str = "PONG";

/// Identity of the sending application, carried in CONNECT
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SenderInfo {
    /// Sender package name
    pub package: String,
    /// Sender platform identifier
    pub platform: String,
    /// Sender version string
    pub version: String,
}

/// Virtual-connection control messages
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ConnectionControl {
    /// Open a virtual connection to the destination endpoint
    #[serde(rename = "CONNECT", rename_all = "camelCase")]
    Connect {
        /// Origin metadata, an empty object for local senders
        origin: Value,
        /// Sender identity
        sender_info: SenderInfo,
    },
    /// Close the virtual connection to the destination endpoint
    #[serde(rename = "CLOSE")]
    Close,
}

/// Keep-alive messages
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum Heartbeat {
    /// Keep-alive request
    #[serde(rename = "PING")]
    Ping,
    /// Keep-alive reply
    #[serde(rename = "PONG")]
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_shape() {
        let connect = ConnectionControl::Connect {
            origin: serde_json::json!({}),
            sender_info: SenderInfo {
                package: "castlink".to_string(),
                platform: "linux".to_string(),
                version: "0.1.0".to_string(),
            },
        };

        let body = serde_json::to_value(&connect).unwrap();
        assert_eq!(body["type"], "CONNECT");
        assert_eq!(body["senderInfo"]["package"], "castlink");
        assert!(body["origin"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_close_shape() {
        let body = serde_json::to_value(ConnectionControl::Close).unwrap();
        assert_eq!(body, serde_json::json!({"type": "CLOSE"}));
    }

    #[test]
    fn test_heartbeat_roundtrip() {
        let body = serde_json::to_string(&Heartbeat::Ping).unwrap();
        assert_eq!(body, r#"{"type":"PING"}"#);
        let parsed: Heartbeat = serde_json::from_str(r#"{"type":"PONG"}"#).unwrap();
        assert_eq!(parsed, Heartbeat::Pong);
    }
}
