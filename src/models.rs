//! Value types exchanged with the hub: telemetry/C2D messages, direct method
//! calls and their responses.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// How long a method responder is given before the caller considers the
/// invocation expired. Metadata only; the transport does not enforce it.
pub const DEFAULT_METHOD_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// A message sent to or received from the hub.
///
/// System properties ride on the MQTT topic as a URL-encoded property bag;
/// anything the service does not recognize as a system property lands in
/// [`Message::custom_properties`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub payload: Vec<u8>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub user_id: Option<String>,
    pub to: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub expiry_time_utc: Option<DateTime<Utc>>,
    /// Name of the module output this message leaves through (modules only).
    pub output_name: Option<String>,
    /// Name of the module input this message arrived on (modules only).
    pub input_name: Option<String>,
    pub custom_properties: HashMap<String, String>,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Message {
            payload: payload.into(),
            ..Default::default()
        }
    }
}

impl From<&str> for Message {
    fn from(payload: &str) -> Self {
        Message::new(payload.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Message {
    fn from(payload: Vec<u8>) -> Self {
        Message::new(payload)
    }
}

/// A direct method invocation received from the service.
///
/// The request id correlates the eventual [`MethodResponse`] with this call;
/// it is carried in the topic, not the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub name: String,
    pub request_id: String,
    pub payload: Vec<u8>,
    pub response_timeout: Duration,
}

impl MethodCall {
    pub fn new(name: impl Into<String>, request_id: impl Into<String>, payload: Vec<u8>) -> Self {
        MethodCall {
            name: name.into(),
            request_id: request_id.into(),
            payload,
            response_timeout: DEFAULT_METHOD_RESPONSE_TIMEOUT,
        }
    }
}

/// The responder's answer to a [`MethodCall`].
#[derive(Debug, Clone, PartialEq)]
pub struct MethodResponse {
    pub request_id: String,
    pub status: i32,
    pub payload: Vec<u8>,
}

impl MethodResponse {
    pub fn new(request_id: impl Into<String>, status: i32, payload: Vec<u8>) -> Self {
        MethodResponse {
            request_id: request_id.into(),
            status,
            payload,
        }
    }

    /// Build a response correlated with `call`.
    pub fn to_call(call: &MethodCall, status: i32, payload: Vec<u8>) -> Self {
        MethodResponse::new(call.request_id.clone(), status, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_correlates_with_call() {
        let call = MethodCall::new("reboot", "42", b"{}".to_vec());
        let response = MethodResponse::to_call(&call, 200, Vec::new());
        assert_eq!(response.request_id, "42");
        assert_eq!(response.status, 200);
    }

    #[test]
    fn message_from_str_keeps_payload() {
        let msg = Message::from("hello");
        assert_eq!(msg.payload, b"hello");
        assert!(msg.message_id.is_none());
    }
}
