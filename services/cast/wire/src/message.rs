//! Message envelope for the cast protocol.
//!
//! Every protocol message is a [`CastMessage`]: a namespace-scoped
//! envelope between two endpoint ids carrying exactly one payload,
//! UTF-8 text or raw bytes.

use crate::namespaces::{
    MAX_BINARY_PAYLOAD, MAX_NAMESPACE_LEN, MAX_TEXT_PAYLOAD, PROTOCOL_VERSION,
};
use crate::WireError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Message payload, exactly one of text or binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// UTF-8 text payload (JSON for the built-in namespaces)
    Text(String),
    /// Raw binary payload
    Binary(Bytes),
}

impl Payload {
    /// Payload size in bytes
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(s) => s.len(),
            Payload::Binary(b) => b.len(),
        }
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size limit applicable to this payload kind
    pub fn limit(&self) -> usize {
        match self {
            Payload::Text(_) => MAX_TEXT_PAYLOAD,
            Payload::Binary(_) => MAX_BINARY_PAYLOAD,
        }
    }
}

/// Complete protocol message
#[derive(Debug, Clone, PartialEq)]
pub struct CastMessage {
    /// Protocol version
    pub protocol_version: u32,
    /// Source endpoint id
    pub source_id: String,
    /// Destination endpoint id
    pub destination_id: String,
    /// Namespace scoping the payload to one logical channel
    pub namespace: String,
    /// The payload
    pub payload: Payload,
}

impl CastMessage {
    /// Create a text message
    pub fn text(
        source_id: impl Into<String>,
        destination_id: impl Into<String>,
        namespace: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            source_id: source_id.into(),
            destination_id: destination_id.into(),
            namespace: namespace.into(),
            payload: Payload::Text(body.into()),
        }
    }

    /// Create a binary message
    pub fn binary(
        source_id: impl Into<String>,
        destination_id: impl Into<String>,
        namespace: impl Into<String>,
        bytes: Bytes,
    ) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            source_id: source_id.into(),
            destination_id: destination_id.into(),
            namespace: namespace.into(),
            payload: Payload::Binary(bytes),
        }
    }

    /// Validate namespace and payload bounds.
    ///
    /// An oversized payload is reported as [`WireError::TooLarge`],
    /// a distinct condition from any I/O failure.
    pub fn validate(&self) -> Result<(), WireError> {
        if self.namespace.is_empty() {
            return Err(WireError::EmptyNamespace);
        }
        if self.namespace.len() > MAX_NAMESPACE_LEN {
            return Err(WireError::NamespaceLength(self.namespace.len()));
        }
        let size = self.payload.len();
        let limit = self.payload.limit();
        if size > limit {
            return Err(WireError::TooLarge { size, limit });
        }
        Ok(())
    }

    /// Serialize to the JSON envelope
    pub fn to_json(&self) -> Result<Vec<u8>, WireError> {
        self.validate()?;

        let (payload_type, payload_utf8, payload_binary) = match &self.payload {
            Payload::Text(s) => (PayloadType::Utf8, Some(s.clone()), None),
            Payload::Binary(b) => (PayloadType::Binary, None, Some(BASE64.encode(b))),
        };

        let envelope = Envelope {
            payload_type,
            protocol_version: self.protocol_version,
            source_id: self.source_id.clone(),
            destination_id: self.destination_id.clone(),
            namespace: self.namespace.clone(),
            payload_utf8,
            payload_binary,
        };

        Ok(serde_json::to_vec(&envelope)?)
    }

    /// Deserialize from the JSON envelope.
    ///
    /// Rejects zero-length namespaces and over-limit payloads; the
    /// caller is expected to log and drop such messages rather than
    /// tear down the transport.
    pub fn from_json(bytes: &[u8]) -> Result<Self, WireError> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;

        let payload = match envelope.payload_type {
            PayloadType::Utf8 => {
                Payload::Text(envelope.payload_utf8.ok_or(WireError::MissingPayload)?)
            }
            PayloadType::Binary => {
                let encoded = envelope.payload_binary.ok_or(WireError::MissingPayload)?;
                let decoded = BASE64.decode(encoded).map_err(|_| WireError::Base64)?;
                Payload::Binary(Bytes::from(decoded))
            }
        };

        let message = Self {
            protocol_version: envelope.protocol_version,
            source_id: envelope.source_id,
            destination_id: envelope.destination_id,
            namespace: envelope.namespace,
            payload,
        };
        message.validate()?;
        Ok(message)
    }

    /// Text payload body, if this is a text message
    pub fn body(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(s) => Some(s),
            Payload::Binary(_) => None,
        }
    }
}

/// Extract the `type` discriminator from a JSON payload body.
///
/// Every request/response body on the built-in namespaces carries a
/// `type` field; dispatch parses it first, then the concrete shape.
pub fn message_type(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct TypeProbe {
        #[serde(rename = "type")]
        name: String,
    }

    serde_json::from_str::<TypeProbe>(body).ok().map(|p| p.name)
}

/// Payload discriminator in the envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum PayloadType {
    /// UTF-8 text payload in `payloadUtf8`
    #[serde(rename = "UTF8")]
    Utf8,
    /// Base64 binary payload in `payloadBinary`
    #[serde(rename = "BINARY")]
    Binary,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(rename = "type")]
    payload_type: PayloadType,
    #[serde(default)]
    protocol_version: u32,
    source_id: String,
    destination_id: String,
    namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload_utf8: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload_binary: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespaces::{ENDPOINT_RECEIVER, ENDPOINT_SENDER, NS_RECEIVER};

    #[test]
    fn test_text_roundtrip() {
        let message = CastMessage::text(
            ENDPOINT_SENDER,
            ENDPOINT_RECEIVER,
            NS_RECEIVER,
            r#"{"type":"GET_STATUS","requestId":1}"#,
        );

        let encoded = message.to_json().unwrap();
        let decoded = CastMessage::from_json(&encoded).unwrap();

        assert_eq!(decoded.namespace, message.namespace);
        assert_eq!(decoded.source_id, message.source_id);
        assert_eq!(decoded.destination_id, message.destination_id);
        assert_eq!(decoded.payload, message.payload);
    }

    #[test]
    fn test_binary_roundtrip() {
        let message = CastMessage::binary(
            ENDPOINT_SENDER,
            "transport-7",
            "urn:x-cast:com.example.custom",
            Bytes::from_static(&[0x00, 0x01, 0xFE, 0xFF]),
        );

        let encoded = message.to_json().unwrap();
        let decoded = CastMessage::from_json(&encoded).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_empty_namespace_rejected() {
        let message = CastMessage::text(ENDPOINT_SENDER, ENDPOINT_RECEIVER, "", "{}");
        assert!(matches!(message.to_json(), Err(WireError::EmptyNamespace)));

        let raw = r#"{"type":"UTF8","sourceId":"a","destinationId":"b","namespace":"","payloadUtf8":"{}"}"#;
        assert!(matches!(
            CastMessage::from_json(raw.as_bytes()),
            Err(WireError::EmptyNamespace)
        ));
    }

    #[test]
    fn test_text_payload_boundary() {
        let at_limit = "x".repeat(MAX_TEXT_PAYLOAD);
        let message = CastMessage::text(ENDPOINT_SENDER, ENDPOINT_RECEIVER, NS_RECEIVER, at_limit);
        assert!(message.to_json().is_ok());

        let over_limit = "x".repeat(MAX_TEXT_PAYLOAD + 1);
        let message = CastMessage::text(ENDPOINT_SENDER, ENDPOINT_RECEIVER, NS_RECEIVER, over_limit);
        match message.to_json() {
            Err(WireError::TooLarge { size, limit }) => {
                assert_eq!(size, MAX_TEXT_PAYLOAD + 1);
                assert_eq!(limit, MAX_TEXT_PAYLOAD);
            }
            other => panic!("expected TooLarge, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_message_type_probe() {
        assert_eq!(
            message_type(r#"{"requestId":3,"type":"RECEIVER_STATUS","status":{}}"#),
            Some("RECEIVER_STATUS".to_string())
        );
        assert_eq!(message_type("not json"), None);
    }
}
