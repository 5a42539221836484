/// Chat wire types and JSON framing.
///
/// Outbound frames carry only content and a timestamp; the backend
/// fills in the sender, the pod name and the message type before
/// broadcasting. Inbound frames are polymorphic over `type`.
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::ChatError;

/// Message category carried in the inbound `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    /// Chat message relayed from a participant. The backend tags these
    /// `"message"`; `"user"` is accepted as well.
    User,
    /// Server notice (welcome, pod status).
    System,
    /// Any other tag, kept verbatim.
    Other(String),
}

impl From<String> for MessageKind {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "user" | "message" => MessageKind::User,
            "system" => MessageKind::System,
            _ => MessageKind::Other(tag),
        }
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::User => "user".to_string(),
            MessageKind::System => "system".to_string(),
            MessageKind::Other(tag) => tag,
        }
    }
}

/// A message received from the backend, as stored in the message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationMessage {
    pub content: String,
    /// ISO-8601 as sent by the backend; absent on some system frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    /// Backend-assigned id of the participant who wrote the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_count: Option<u32>,
}

impl ApplicationMessage {
    pub fn is_system(&self) -> bool {
        matches!(self.kind, Some(MessageKind::System))
    }

    /// Parsed timestamp, if present and well-formed.
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.timestamp.as_deref()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Outbound frame (client → server).
#[derive(Debug, Serialize)]
struct OutgoingMessage<'a> {
    content: &'a str,
    timestamp: String,
}

/// Decodes one inbound text frame.
pub fn decode(frame: &str) -> Result<ApplicationMessage, ChatError> {
    Ok(serde_json::from_str(frame)?)
}

/// Encodes the outbound frame for `content`, stamped with `now`
/// (RFC 3339, millisecond precision, `Z` suffix).
pub fn encode(content: &str, now: DateTime<Utc>) -> Result<String, ChatError> {
    let msg = OutgoingMessage {
        content,
        timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
    };
    Ok(serde_json::to_string(&msg)?)
}

/// Pod serving this session: the `podName` of the first system message
/// that carries a non-empty one (the backend's welcome notice).
pub fn current_backend(messages: &[ApplicationMessage]) -> Option<&str> {
    messages
        .iter()
        .filter(|m| m.is_system())
        .find_map(|m| m.pod_name.as_deref().filter(|pod| !pod.is_empty()))
}
