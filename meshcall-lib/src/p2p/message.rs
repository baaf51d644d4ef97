use serde_json::{json, Value};

use crate::error::{Error, Result};

/// Kinds of the `{type, data}` envelopes exchanged between peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageKind {
    /// Session descriptions and candidates.
    Signal,
    TrackSources,
    StreamInfo,
    TracksAdded,
    UserAgent,
    DataReceived,
    Closed,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Signal => "chat-signal",
            MessageKind::TrackSources => "chat-track-sources",
            MessageKind::StreamInfo => "chat-stream-info",
            MessageKind::TracksAdded => "chat-tracks-added",
            MessageKind::UserAgent => "chat-ua",
            MessageKind::DataReceived => "chat-data-received",
            MessageKind::Closed => "chat-closed",
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        Some(match kind {
            "chat-signal" => MessageKind::Signal,
            "chat-track-sources" => MessageKind::TrackSources,
            "chat-stream-info" => MessageKind::StreamInfo,
            "chat-tracks-added" => MessageKind::TracksAdded,
            "chat-ua" => MessageKind::UserAgent,
            "chat-data-received" => MessageKind::DataReceived,
            // older peers still send the denial under its own name
            "chat-closed" | "chat-denied" => MessageKind::Closed,
            _ => return None,
        })
    }
}

/// A null `data` is left out of the envelope.
pub(crate) fn encode(kind: MessageKind, data: Value) -> String {
    let mut envelope = json!({ "type": kind.as_str() });
    if !data.is_null() {
        envelope["data"] = data;
    }
    envelope.to_string()
}

pub(crate) fn decode(message: &str) -> Result<(MessageKind, Value)> {
    let mut envelope: Value = serde_json::from_str(message)
        .map_err(|err| Error::Protocol(format!("malformed message: {}", err)))?;
    let kind = envelope
        .get("type")
        .and_then(|x| x.as_str())
        .ok_or_else(|| Error::Protocol("message without type".to_owned()))?;
    let kind = MessageKind::parse(kind)
        .ok_or_else(|| Error::Protocol(format!("unknown message type {}", kind)))?;
    let data = envelope
        .get_mut("data")
        .map(|x| x.take())
        .unwrap_or(Value::Null);
    Ok((kind, unwrap_json_string(data)))
}

/// Some peers send `data` as a JSON document inside a string.
fn unwrap_json_string(data: Value) -> Value {
    match &data {
        Value::String(raw) if raw.starts_with('{') || raw.starts_with('[') => {
            serde_json::from_str(raw).unwrap_or(data)
        }
        _ => data,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CloseReason {
    pub code: i64,
    pub message: String,
}

impl CloseReason {
    pub fn parse(data: &Value) -> Self {
        Self {
            code: data.get("code").and_then(|x| x.as_i64()).unwrap_or(0),
            message: data
                .get("message")
                .and_then(|x| x.as_str())
                .unwrap_or_default()
                .to_owned(),
        }
    }

    pub fn to_value(error: &Error) -> Value {
        let message = match error {
            Error::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };
        json!({ "code": error.code().value(), "message": message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_without_data_has_no_data_key() {
        assert_eq!(encode(MessageKind::Closed, Value::Null), r#"{"type":"chat-closed"}"#);
        assert_eq!(
            decode(r#"{"type":"chat-closed"}"#).unwrap(),
            (MessageKind::Closed, Value::Null)
        );
    }

    #[test]
    fn string_data_is_unwrapped() {
        let (kind, data) =
            decode(r#"{"type":"chat-denied","data":"{\"code\":2202,\"message\":\"Denied\"}"}"#)
                .unwrap();
        assert_eq!(kind, MessageKind::Closed);
        assert_eq!(
            CloseReason::parse(&data),
            CloseReason {
                code: 2202,
                message: "Denied".to_owned()
            }
        );
        let (_, data) = decode(r#"{"type":"chat-data-received","data":"plain"}"#).unwrap();
        assert_eq!(data, json!("plain"));
    }

    #[test]
    fn unknown_or_broken_messages_are_protocol_errors() {
        assert!(matches!(decode("not json"), Err(Error::Protocol(_))));
        assert!(matches!(decode(r#"{"data":1}"#), Err(Error::Protocol(_))));
        assert!(matches!(
            decode(r#"{"type":"chat-unknown"}"#),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn close_reason_carries_error_code() {
        let value = CloseReason::to_value(&Error::negotiation("bad sdp"));
        assert_eq!(value["code"], 2502);
        assert_eq!(value["message"], "negotiation failed: bad sdp");
        assert_eq!(CloseReason::parse(&Value::Null).code, 0);
    }
}
