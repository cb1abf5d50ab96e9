//! Topic construction and inbound topic parsing for the hub MQTT surface.
//!
//! Everything here is pure string work; the only possible failures are
//! [`TopicError::MalformedTopic`] and [`TopicError::MalformedPropertyBag`].

use chrono::{DateTime, Utc};
use urlencoding::encode;

use super::query;
use crate::error::TopicError;
use crate::models::{Message, MethodCall};

pub(crate) const METHOD_POST_PREFIX: &str = "$iothub/methods/POST/";
pub(crate) const METHOD_SUBSCRIBE_FILTER: &str = "$iothub/methods/POST/#";

pub(crate) fn telemetry_topic(device_id: &str, module_id: Option<&str>) -> String {
    match module_id {
        Some(module_id) => format!("devices/{device_id}/modules/{module_id}/messages/events/"),
        None => format!("devices/{device_id}/messages/events/"),
    }
}

pub(crate) fn c2d_prefix(device_id: &str) -> String {
    format!("devices/{device_id}/messages/devicebound/")
}

pub(crate) fn c2d_subscribe_filter(device_id: &str) -> String {
    format!("{}#", c2d_prefix(device_id))
}

pub(crate) fn input_prefix(device_id: &str, module_id: &str) -> String {
    format!("devices/{device_id}/modules/{module_id}/inputs/")
}

pub(crate) fn input_subscribe_filter(device_id: &str, module_id: &str) -> String {
    format!("{}#", input_prefix(device_id, module_id))
}

pub(crate) fn method_response_topic(status: i32, request_id: &str) -> String {
    format!("$iothub/methods/res/{status}/?$rid={}", encode(request_id))
}

/// Full telemetry publish topic for `message`: the events base plus the
/// URL-encoded property bag.
pub(crate) fn encode_telemetry_topic(
    message: &Message,
    device_id: &str,
    module_id: Option<&str>,
) -> String {
    let base = telemetry_topic(device_id, module_id);
    format!("{base}{}", encode_properties(message))
}

/// Encode the property bag: system properties first, in a fixed order, then
/// any custom properties.
pub(crate) fn encode_properties(message: &Message) -> String {
    let expiry = message.expiry_time_utc.map(|e| e.to_rfc3339());

    let system: [(&str, Option<&str>); 8] = [
        ("$.mid", message.message_id.as_deref()),
        ("$.cid", message.correlation_id.as_deref()),
        ("$.uid", message.user_id.as_deref()),
        ("$.to", message.to.as_deref()),
        ("$.ct", message.content_type.as_deref()),
        ("$.ce", message.content_encoding.as_deref()),
        ("$.exp", expiry.as_deref()),
        ("$.on", message.output_name.as_deref()),
    ];

    let mut pairs: Vec<String> = system
        .iter()
        .filter_map(|(key, value)| value.map(|v| format!("{}={}", encode(key), encode(v))))
        .collect();

    pairs.extend(
        message
            .custom_properties
            .iter()
            .map(|(key, value)| format!("{}={}", encode(key), encode(value))),
    );

    pairs.join("&")
}

/// A classified inbound publish.
#[derive(Debug)]
pub(crate) enum Inbound {
    C2d(Message),
    Input { name: String, message: Message },
    Method(MethodCall),
}

/// Precomputed inbound prefixes for one client identity.
#[derive(Debug)]
pub(crate) struct InboundTopics {
    c2d_prefix: String,
    input_prefix: Option<String>,
}

impl InboundTopics {
    pub(crate) fn new(device_id: &str, module_id: Option<&str>) -> Self {
        InboundTopics {
            c2d_prefix: c2d_prefix(device_id),
            input_prefix: module_id.map(|m| input_prefix(device_id, m)),
        }
    }

    pub(crate) fn classify(&self, topic: &str, payload: &[u8]) -> Result<Inbound, TopicError> {
        if topic.starts_with(METHOD_POST_PREFIX) {
            return parse_method_call(topic, payload).map(Inbound::Method);
        }
        if let Some(input_prefix) = &self.input_prefix {
            if topic.starts_with(input_prefix) {
                return parse_input(topic, payload);
            }
        }
        if topic.starts_with(&self.c2d_prefix) {
            return parse_c2d(topic, payload).map(Inbound::C2d);
        }
        Err(TopicError::MalformedTopic(format!(
            "publish on unexpected topic {topic:?}"
        )))
    }
}

/// `devices/{device}/messages/devicebound/<propbag>`
fn parse_c2d(topic: &str, payload: &[u8]) -> Result<Message, TopicError> {
    let segments: Vec<&str> = topic.split('/').collect();
    if segments.len() <= 4 {
        return Err(TopicError::MalformedTopic(format!(
            "cloud-to-device topic is missing its property bag: {topic:?}"
        )));
    }
    message_from_bag(payload, segments[4])
}

/// `devices/{device}/modules/{module}/inputs/{input}/<propbag>`
fn parse_input(topic: &str, payload: &[u8]) -> Result<Inbound, TopicError> {
    let segments: Vec<&str> = topic.split('/').collect();
    if segments.len() <= 6 {
        return Err(TopicError::MalformedTopic(format!(
            "input topic is missing its input name or property bag: {topic:?}"
        )));
    }
    let name = segments[5].to_owned();
    let mut message = message_from_bag(payload, segments[6])?;
    message.input_name = Some(name.clone());
    Ok(Inbound::Input { name, message })
}

/// `$iothub/methods/POST/{method}/?$rid={request id}`
///
/// The service does not restrict method names, so the name may itself
/// contain slashes; the request id bag starts after the last one.
fn parse_method_call(topic: &str, payload: &[u8]) -> Result<MethodCall, TopicError> {
    let rest = &topic[METHOD_POST_PREFIX.len()..];
    let last_slash = rest.rfind('/').ok_or_else(|| {
        TopicError::MalformedTopic(format!("method topic has no request id segment: {topic:?}"))
    })?;
    let name = &rest[..last_slash];

    let bag = rest[last_slash + 1..].strip_prefix('?').ok_or_else(|| {
        TopicError::MalformedTopic(format!("method topic has no query segment: {topic:?}"))
    })?;

    let properties = query::parse(bag)?;
    let request_id = match properties.get("$rid") {
        Some(Some(rid)) => rid.clone(),
        _ => {
            return Err(TopicError::MalformedTopic(format!(
                "method topic is missing its request id: {topic:?}"
            )))
        }
    };

    Ok(MethodCall::new(name, request_id, payload.to_vec()))
}

fn message_from_bag(payload: &[u8], bag: &str) -> Result<Message, TopicError> {
    let mut message = Message::new(payload.to_vec());

    for (key, value) in query::parse(bag)? {
        let value = value.unwrap_or_default();
        match key.as_str() {
            "$.mid" => message.message_id = Some(value),
            "$.cid" => message.correlation_id = Some(value),
            "$.uid" => message.user_id = Some(value),
            "$.to" => message.to = Some(value),
            "$.ct" => message.content_type = Some(value),
            "$.ce" => message.content_encoding = Some(value),
            "$.on" => message.output_name = Some(value),
            "$.exp" => match DateTime::parse_from_rfc3339(&value) {
                Ok(expiry) => message.expiry_time_utc = Some(expiry.with_timezone(&Utc)),
                Err(e) => log::warn!("ignoring unparseable $.exp value {value:?}: {e}"),
            },
            _ => {
                message.custom_properties.insert(key, value);
            }
        }
    }

    Ok(message)
}
