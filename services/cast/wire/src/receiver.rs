//! Payload bodies for the receiver-control namespace.
//!
//! Requests are correlated with asynchronous status pushes through the
//! integer `requestId` field inside the body; an unsolicited push
//! carries no request id (or zero).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Message type string for a receiver status push or reply
pub const TYPE_RECEIVER_STATUS: &str = "RECEIVER_STATUS";
/// Message type string for a launch rejection
pub const TYPE_LAUNCH_ERROR: &str = "LAUNCH_ERROR";
/// Message type string for an invalid-request rejection
pub const TYPE_INVALID_REQUEST: &str = "INVALID_REQUEST";
/// Message type string for an app-availability reply
pub const TYPE_APP_AVAILABILITY: &str = "GET_APP_AVAILABILITY";

/// Availability value reported for an installable application
pub const APP_AVAILABLE: &str = "APP_AVAILABLE";

/// Requests issued on the receiver-control namespace
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ReceiverRequest {
    /// Launch an application by id
    #[serde(rename = "LAUNCH", rename_all = "camelCase")]
    Launch {
        /// Correlation id
        request_id: i64,
        /// Application to launch
        app_id: String,
        /// Optional launch parameters
        #[serde(skip_serializing_if = "Option::is_none")]
        app_params: Option<Value>,
    },
    /// Stop a running application session
    #[serde(rename = "STOP", rename_all = "camelCase")]
    Stop {
        /// Correlation id
        request_id: i64,
        /// Session to stop
        session_id: String,
    },
    /// Request the current receiver status
    #[serde(rename = "GET_STATUS", rename_all = "camelCase")]
    GetStatus {
        /// Correlation id
        request_id: i64,
    },
    /// Change volume level or mute state
    #[serde(rename = "SET_VOLUME", rename_all = "camelCase")]
    SetVolume {
        /// Correlation id
        request_id: i64,
        /// Fields to change; absent fields are left untouched
        volume: ReceiverVolume,
    },
    /// Query availability of a set of applications
    #[serde(rename = "GET_APP_AVAILABILITY", rename_all = "camelCase")]
    GetAppAvailability {
        /// Correlation id
        request_id: i64,
        /// Application ids to query
        app_id: Vec<String>,
    },
}

/// Receiver status push or reply
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverStatusMessage {
    /// Correlation id of the triggering request, absent for pushes
    #[serde(default)]
    pub request_id: Option<i64>,
    /// The reported status
    pub status: ReceiverStatus,
}

/// Snapshot of the receiver runtime state
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReceiverStatus {
    /// Currently running applications
    pub applications: Vec<ApplicationInfo>,
    /// Device volume
    pub volume: Option<ReceiverVolume>,
    /// Whether the device input is active
    pub is_active_input: Option<bool>,
}

impl ReceiverStatus {
    /// Find a running application by id
    pub fn application(&self, app_id: &str) -> Option<&ApplicationInfo> {
        self.applications.iter().find(|app| app.app_id == app_id)
    }

    /// Union of namespaces exposed by all running applications
    pub fn exposed_namespaces(&self) -> impl Iterator<Item = &str> {
        self.applications
            .iter()
            .flat_map(|app| app.namespaces.iter())
            .map(|ns| ns.name.as_str())
    }
}

/// Metadata for one running application
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ApplicationInfo {
    /// Application id
    pub app_id: String,
    /// Receiver-assigned session id
    pub session_id: String,
    /// Endpoint id for addressing the application, absent while starting
    pub transport_id: Option<String>,
    /// Human-readable application name
    pub display_name: Option<String>,
    /// Status line published by the application
    pub status_text: Option<String>,
    /// Icon published by the application
    pub icon_url: Option<String>,
    /// Namespaces the application listens on
    pub namespaces: Vec<NamespaceEntry>,
}

/// One namespace entry in an application's listing
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct NamespaceEntry {
    /// The namespace string
    pub name: String,
}

/// Volume fields; either side may be absent in a partial update
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ReceiverVolume {
    /// Volume level in [0.0, 1.0]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<f64>,
    /// Mute state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
}

/// Reply to a GET_APP_AVAILABILITY request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppAvailabilityResponse {
    /// Correlation id
    #[serde(default)]
    pub request_id: Option<i64>,
    /// Availability value per queried application id
    #[serde(default)]
    pub availability: HashMap<String, String>,
}

/// Generic error reply carrying only a correlation id and reason
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// Correlation id of the rejected request, if any
    #[serde(default)]
    pub request_id: Option<i64>,
    /// Receiver-supplied reason string
    #[serde(default)]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_request_shape() {
        let request = ReceiverRequest::Launch {
            request_id: 7,
            app_id: "CC1AD845".to_string(),
            app_params: None,
        };
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"type": "LAUNCH", "requestId": 7, "appId": "CC1AD845"})
        );
    }

    #[test]
    fn test_status_parse() {
        let raw = r#"{
            "requestId": 3,
            "status": {
                "applications": [{
                    "appId": "CC1AD845",
                    "sessionId": "s-77",
                    "transportId": "transport-77",
                    "displayName": "Default Media Receiver",
                    "statusText": "Ready",
                    "namespaces": [{"name": "urn:x-cast:com.google.cast.media"}]
                }],
                "volume": {"level": 0.45, "muted": false}
            }
        }"#;

        let message: ReceiverStatusMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(message.request_id, Some(3));
        let app = message.status.application("CC1AD845").unwrap();
        assert_eq!(app.transport_id.as_deref(), Some("transport-77"));
        assert_eq!(
            message.status.exposed_namespaces().collect::<Vec<_>>(),
            vec!["urn:x-cast:com.google.cast.media"]
        );
        assert_eq!(message.status.volume.unwrap().level, Some(0.45));
    }

    #[test]
    fn test_status_parse_without_applications() {
        let raw = r#"{"status": {"volume": {"level": 1.0, "muted": true}}}"#;
        let message: ReceiverStatusMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(message.request_id, None);
        assert!(message.status.applications.is_empty());
    }

    #[test]
    fn test_availability_parse() {
        let raw = r#"{"requestId": 9, "availability": {"CC1AD845": "APP_AVAILABLE"}}"#;
        let reply: AppAvailabilityResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(
            reply.availability.get("CC1AD845").map(String::as_str),
            Some(APP_AVAILABLE)
        );
    }
}
