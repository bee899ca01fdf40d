//! Wire envelope exchanged with connected clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::state::{StateChange, ViewState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    StateReplace,
    ViewUpdate,
    LiveUpdate,
    ChatMessage,
    ChatResponse,
    Ping,
    Pong,
}

/// One message on the socket. Fields are read-only once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    kind: EnvelopeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    action: Option<String>,
    #[serde(default)]
    data: Value,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(kind: EnvelopeType, action: Option<String>, data: Value) -> Self {
        Self {
            kind,
            action,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn state_replace(view: &ViewState) -> Self {
        let data = serde_json::to_value(view).unwrap_or(Value::Null);
        Self::new(EnvelopeType::StateReplace, None, data)
    }

    pub fn live_update(action: impl Into<String>, data: Value) -> Self {
        Self::new(EnvelopeType::LiveUpdate, Some(action.into()), data)
    }

    /// `state_replace` for wholesale changes, `live_update` for the rest.
    pub fn from_change(change: &StateChange) -> Self {
        match change.action() {
            Some(action) => Self::live_update(action, change.data()),
            None => Self::new(EnvelopeType::StateReplace, None, change.data()),
        }
    }

    pub fn chat_message(message: impl Into<String>) -> Self {
        Self::new(
            EnvelopeType::ChatMessage,
            None,
            json!({ "message": message.into() }),
        )
    }

    /// Chat reply; mirrors the applied `live_update` when there was one.
    pub fn chat_response(response: impl Into<String>, applied: Option<(&str, &Value)>) -> Self {
        let mut data = json!({ "response": response.into() });
        let action = applied.map(|(action, payload)| {
            data["data"] = payload.clone();
            action.to_string()
        });
        Self::new(EnvelopeType::ChatResponse, action, data)
    }

    /// Chat reply reporting a recoverable failure to the originating client.
    pub fn chat_error(message: impl Into<String>) -> Self {
        Self::new(
            EnvelopeType::ChatResponse,
            None,
            json!({ "response": message.into(), "error": true }),
        )
    }

    pub fn ping() -> Self {
        Self::new(EnvelopeType::Ping, None, json!({}))
    }

    pub fn pong() -> Self {
        Self::new(EnvelopeType::Pong, None, json!({}))
    }

    pub fn kind(&self) -> EnvelopeType {
        self.kind
    }

    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// `data.message` of a `chat_message`.
    pub fn message_text(&self) -> Option<&str> {
        self.data.get("message").and_then(Value::as_str)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
