//! Wire frames of the agent gateway protocol.
//!
//! Every WebSocket text message carries exactly one JSON frame tagged by
//! `type`: a request (`req`), a response (`res`) or an event (`event`).
//! Event payloads are loosely shaped upstream, so [`GatewayEvent::classify`]
//! normalizes the ones the bridge cares about into typed variants once,
//! right after decoding.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub const CHALLENGE_EVENT: &str = "connect.challenge";
pub const CONNECT_METHOD: &str = "connect";
pub const CHAT_SEND_METHOD: &str = "chat.send";
pub const AGENT_EVENT: &str = "agent";

const TOOL_INPUT_KEYS: [&str; 3] = ["args", "arguments", "input"];

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid json: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("frame has an unexpected shape: {0}")]
    Shape(#[source] serde_json::Error),
    #[error("binary frame is not valid utf-8")]
    NotText,
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Req(RequestFrame),
    Res(ResponseFrame),
    Event(EventFrame),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl EventFrame {
    /// `payload.runId`, carried by `agent` events.
    pub fn run_id(&self) -> Option<&str> {
        self.payload.get("runId").and_then(Value::as_str)
    }
}

impl Frame {
    /// Builds a request frame with a fresh correlation id.
    pub fn request(method: impl Into<String>, params: Value) -> Self {
        Frame::Req(RequestFrame::new(method, params))
    }

    pub fn encode(&self) -> Result<String, FrameError> {
        serde_json::to_string(self).map_err(FrameError::Encode)
    }

    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text).map_err(FrameError::InvalidJson)?;
        serde_json::from_value(value).map_err(FrameError::Shape)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Req(_) => "req",
            Frame::Res(_) => "res",
            Frame::Event(_) => "event",
        }
    }
}

impl RequestFrame {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            method: method.into(),
            params,
        }
    }
}

impl ResponseFrame {
    /// Human readable message from an `ok: false` response.
    pub fn error_message(&self) -> String {
        self.error
            .as_ref()
            .and_then(|error| {
                error
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| error.as_str().map(str::to_string))
            })
            .unwrap_or_else(|| "request failed".to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Challenge { nonce: Option<String> },
    AssistantDelta { text: String },
    Tool(ToolInvocation),
    Lifecycle { phase: String, error: Option<String> },
    Chat(ChatUpdate),
    Other { name: String },
}

/// A tool notice with its input normalized under a single `input` key.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub name: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatUpdate {
    pub session_key: Option<String>,
    pub state: ChatState,
    pub text: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatState {
    Delta,
    Final,
    Error,
    Aborted,
    Unknown(String),
}

impl ChatState {
    fn parse(value: &str) -> Self {
        match value {
            "delta" => Self::Delta,
            "final" => Self::Final,
            "error" => Self::Error,
            "aborted" => Self::Aborted,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl GatewayEvent {
    pub fn classify(frame: &EventFrame) -> Self {
        let payload = &frame.payload;
        match frame.event.as_str() {
            CHALLENGE_EVENT => GatewayEvent::Challenge {
                nonce: str_field(payload, "nonce"),
            },
            AGENT_EVENT => classify_agent(payload),
            "chat" => GatewayEvent::Chat(ChatUpdate {
                session_key: str_field(payload, "sessionKey"),
                state: ChatState::parse(payload.get("state").and_then(Value::as_str).unwrap_or("")),
                text: payload.get("message").and_then(message_text),
                error: str_field(payload, "errorMessage")
                    .or_else(|| payload.get("error").and_then(error_text)),
            }),
            other => GatewayEvent::Other {
                name: other.to_string(),
            },
        }
    }
}

fn classify_agent(payload: &Value) -> GatewayEvent {
    let stream = payload.get("stream").and_then(Value::as_str).unwrap_or("");
    let data = payload.get("data").cloned().unwrap_or(Value::Null);
    match stream {
        "assistant" => {
            let text = str_field(&data, "delta")
                .or_else(|| str_field(&data, "text"))
                .unwrap_or_default();
            GatewayEvent::AssistantDelta { text }
        }
        "tool" => GatewayEvent::Tool(ToolInvocation {
            name: str_field(&data, "name").or_else(|| str_field(&data, "tool")),
            payload: normalize_tool_payload(data),
        }),
        "lifecycle" => GatewayEvent::Lifecycle {
            phase: str_field(&data, "phase").unwrap_or_default(),
            error: data.get("error").and_then(error_text),
        },
        other => GatewayEvent::Other {
            name: format!("agent.{other}"),
        },
    }
}

/// Collapses the `args` / `arguments` / `input` spellings into `input`.
pub fn normalize_tool_payload(data: Value) -> Value {
    let Value::Object(mut map) = data else {
        return data;
    };
    let mut input = None;
    for key in TOOL_INPUT_KEYS {
        if let Some(value) = map.remove(key) {
            if input.is_none() {
                input = Some(value);
            }
        }
    }
    if let Some(input) = input {
        map.insert("input".to_string(), input);
    }
    Value::Object(map)
}

/// Concatenates the text parts of a chat message, in order.
pub fn message_text(message: &Value) -> Option<String> {
    let content = message.get("content")?;
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect();
            if texts.is_empty() {
                None
            } else {
                Some(texts.concat())
            }
        }
        _ => None,
    }
}

fn error_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(name: &str, payload: Value) -> EventFrame {
        EventFrame {
            event: name.to_string(),
            payload,
            seq: None,
        }
    }

    #[test]
    fn decodes_each_frame_kind() {
        let req = Frame::decode(r#"{"type":"req","id":"1","method":"connect","params":{"a":1}}"#)
            .expect("req");
        assert!(matches!(&req, Frame::Req(r) if r.method == "connect" && r.params["a"] == 1));

        let res = Frame::decode(r#"{"type":"res","id":"1","ok":false,"error":{"message":"nope"}}"#)
            .expect("res");
        let Frame::Res(res) = res else {
            panic!("expected response");
        };
        assert!(!res.ok);
        assert_eq!(res.error_message(), "nope");

        let evt = Frame::decode(r#"{"type":"event","event":"connect.challenge","payload":{"nonce":"n"},"seq":4}"#)
            .expect("event");
        assert!(matches!(&evt, Frame::Event(e) if e.seq == Some(4)));
    }

    #[test]
    fn invalid_json_and_wrong_shape_are_distinct() {
        assert!(matches!(
            Frame::decode("{not json"),
            Err(FrameError::InvalidJson(_))
        ));
        assert!(matches!(
            Frame::decode(r#"{"type":"bogus"}"#),
            Err(FrameError::Shape(_))
        ));
        assert!(matches!(
            Frame::decode(r#"{"type":"res","id":"1"}"#),
            Err(FrameError::Shape(_))
        ));
        assert!(matches!(Frame::decode("[1,2]"), Err(FrameError::Shape(_))));
    }

    #[test]
    fn encoded_request_omits_null_params() {
        let frame = Frame::Req(RequestFrame {
            id: "abc".to_string(),
            method: "ping".to_string(),
            params: Value::Null,
        });
        assert_eq!(
            frame.encode().expect("encode"),
            r#"{"type":"req","id":"abc","method":"ping"}"#
        );
    }

    #[test]
    fn request_ids_are_unique() {
        let a = RequestFrame::new(CHAT_SEND_METHOD, json!({}));
        let b = RequestFrame::new(CHAT_SEND_METHOD, json!({}));
        assert_ne!(a.id, b.id);
        assert!(matches!(Frame::request("ping", Value::Null), Frame::Req(r) if r.method == "ping"));
    }

    #[test]
    fn tool_input_spellings_normalize_to_input() {
        for key in ["args", "arguments", "input"] {
            let classified = GatewayEvent::classify(&event(
                "agent",
                json!({"stream": "tool", "data": {"name": "bash", key: {"cmd": "ls"}}}),
            ));
            let GatewayEvent::Tool(tool) = classified else {
                panic!("expected tool event");
            };
            assert_eq!(tool.name.as_deref(), Some("bash"));
            assert_eq!(tool.payload, json!({"name": "bash", "input": {"cmd": "ls"}}));
        }
    }

    #[test]
    fn chat_final_text_concatenates_text_parts() {
        let classified = GatewayEvent::classify(&event(
            "chat",
            json!({
                "sessionKey": "main",
                "state": "final",
                "message": {"role": "assistant", "content": [
                    {"type": "text", "text": "Hello "},
                    {"type": "image", "url": "x"},
                    {"type": "text", "text": "world"}
                ]}
            }),
        ));
        assert_eq!(
            classified,
            GatewayEvent::Chat(ChatUpdate {
                session_key: Some("main".to_string()),
                state: ChatState::Final,
                text: Some("Hello world".to_string()),
                error: None,
            })
        );
    }

    #[test]
    fn agent_streams_classify() {
        assert_eq!(
            GatewayEvent::classify(&event(
                "agent",
                json!({"stream": "assistant", "data": {"text": "Hi th", "delta": "th"}})
            )),
            GatewayEvent::AssistantDelta {
                text: "th".to_string()
            }
        );
        assert_eq!(
            GatewayEvent::classify(&event(
                "agent",
                json!({"stream": "lifecycle", "data": {"phase": "end"}})
            )),
            GatewayEvent::Lifecycle {
                phase: "end".to_string(),
                error: None
            }
        );
        assert_eq!(
            GatewayEvent::classify(&event("health", json!({}))),
            GatewayEvent::Other {
                name: "health".to_string()
            }
        );
    }
}
