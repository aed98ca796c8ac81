//! Debug adapter protocol messages
//!
//! Only the envelope is modelled; `arguments` and `body` stay opaque JSON so
//! the relay keeps working when the remote debugger's protocol version drifts.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A wire message (tagged on the `type` field)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Request(Request),
    Response(Response),
    Event(Event),
}

impl Message {
    pub fn seq(&self) -> u64 {
        match self {
            Message::Request(r) => r.seq,
            Message::Response(r) => r.seq,
            Message::Event(e) => e.seq,
        }
    }

    pub fn set_seq(&mut self, seq: u64) {
        match self {
            Message::Request(r) => r.seq = seq,
            Message::Response(r) => r.seq = seq,
            Message::Event(e) => e.seq = seq,
        }
    }

    /// Short label for log lines
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request(_) => "request",
            Message::Response(_) => "response",
            Message::Event(_) => "event",
        }
    }
}

/// Request from a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub seq: u64,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<JsonValue>,
}

impl Request {
    pub fn new(seq: u64, command: impl Into<String>, arguments: Option<JsonValue>) -> Self {
        Self {
            seq,
            command: command.into(),
            arguments,
        }
    }
}

/// Response to a request; `request_seq` names the request it answers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub seq: u64,
    pub request_seq: u64,
    /// Peers that leave it out mean success
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<JsonValue>,
}

fn default_success() -> bool {
    true
}

impl Response {
    /// Successful response to `request`; `seq` is filled in when sent
    pub fn success(request: &Request) -> Self {
        Self {
            seq: 0,
            request_seq: request.seq,
            success: true,
            command: request.command.clone(),
            message: None,
            body: None,
        }
    }

    /// Failed response to `request` carrying a human-readable message
    pub fn error(request: &Request, message: impl Into<String>) -> Self {
        Self {
            seq: 0,
            request_seq: request.seq,
            success: false,
            command: request.command.clone(),
            message: Some(message.into()),
            body: None,
        }
    }
}

/// Event pushed without a preceding request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<JsonValue>,
}

impl Event {
    pub fn new(event: impl Into<String>, body: Option<JsonValue>) -> Self {
        Self {
            seq: 0,
            event: event.into(),
            body,
        }
    }

    pub fn initialized() -> Self {
        Self::new("initialized", None)
    }

    pub fn terminated() -> Self {
        Self::new("terminated", None)
    }

    /// `output` event with a category such as "stdout" or "stderr"
    pub fn output(category: &str, text: impl Into<String>) -> Self {
        Self::new(
            "output",
            Some(serde_json::json!({
                "category": category,
                "output": text.into(),
            })),
        )
    }
}
