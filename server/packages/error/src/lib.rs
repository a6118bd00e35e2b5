use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    TokenInvalid,
    ConnectFailed,
    ConnectTimeout,
    HandshakeTimeout,
    HandshakeRejected,
    HandshakeProtocol,
    UpstreamError,
    ConnectionClosed,
    DeadlineExceeded,
    ResponderFailed,
    StreamError,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:gateway-bridge:error:invalid_request",
            Self::TokenInvalid => "urn:gateway-bridge:error:token_invalid",
            Self::ConnectFailed => "urn:gateway-bridge:error:connect_failed",
            Self::ConnectTimeout => "urn:gateway-bridge:error:connect_timeout",
            Self::HandshakeTimeout => "urn:gateway-bridge:error:handshake_timeout",
            Self::HandshakeRejected => "urn:gateway-bridge:error:handshake_rejected",
            Self::HandshakeProtocol => "urn:gateway-bridge:error:handshake_protocol",
            Self::UpstreamError => "urn:gateway-bridge:error:upstream_error",
            Self::ConnectionClosed => "urn:gateway-bridge:error:connection_closed",
            Self::DeadlineExceeded => "urn:gateway-bridge:error:deadline_exceeded",
            Self::ResponderFailed => "urn:gateway-bridge:error:responder_failed",
            Self::StreamError => "urn:gateway-bridge:error:stream_error",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::TokenInvalid => "Token Invalid",
            Self::ConnectFailed => "Connect Failed",
            Self::ConnectTimeout => "Connect Timeout",
            Self::HandshakeTimeout => "Handshake Timeout",
            Self::HandshakeRejected => "Handshake Rejected",
            Self::HandshakeProtocol => "Handshake Protocol Error",
            Self::UpstreamError => "Upstream Error",
            Self::ConnectionClosed => "Connection Closed",
            Self::DeadlineExceeded => "Deadline Exceeded",
            Self::ResponderFailed => "Responder Failed",
            Self::StreamError => "Stream Error",
        }
    }

    /// HTTP status used when the error is rendered before the event stream
    /// has been committed. Once streaming, errors travel as `error` events.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::TokenInvalid => 401,
            Self::ConnectFailed => 502,
            Self::ConnectTimeout => 504,
            Self::HandshakeTimeout => 504,
            Self::HandshakeRejected => 502,
            Self::HandshakeProtocol => 502,
            Self::UpstreamError => 502,
            Self::ConnectionClosed => 502,
            Self::DeadlineExceeded => 504,
            Self::ResponderFailed => 500,
            Self::StreamError => 502,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("missing or invalid gateway credential")]
    TokenInvalid { message: Option<String> },
    #[error("failed to connect to agent gateway at {url}: {message}")]
    ConnectFailed { url: String, message: String },
    #[error("timed out opening connection to agent gateway after {timeout_ms}ms")]
    ConnectTimeout { url: String, timeout_ms: u64 },
    #[error("handshake timeout waiting for {step} after {timeout_ms}ms")]
    HandshakeTimeout { step: String, timeout_ms: u64 },
    #[error("handshake rejected by agent gateway: {message}")]
    HandshakeRejected {
        message: String,
        details: Option<Value>,
    },
    #[error("handshake failed: {message}")]
    HandshakeProtocol { message: String },
    #[error("{message}")]
    UpstreamError {
        message: String,
        details: Option<Value>,
    },
    #[error("connection closed unexpectedly")]
    ConnectionClosed,
    #[error("request deadline exceeded after {timeout_ms}ms")]
    DeadlineExceeded { timeout_ms: u64 },
    #[error("collaborator {collaborator} failed to respond: {message}")]
    ResponderFailed {
        collaborator: String,
        message: String,
    },
    #[error("stream error: {message}")]
    StreamError { message: String },
}

impl BridgeError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::TokenInvalid { .. } => ErrorType::TokenInvalid,
            Self::ConnectFailed { .. } => ErrorType::ConnectFailed,
            Self::ConnectTimeout { .. } => ErrorType::ConnectTimeout,
            Self::HandshakeTimeout { .. } => ErrorType::HandshakeTimeout,
            Self::HandshakeRejected { .. } => ErrorType::HandshakeRejected,
            Self::HandshakeProtocol { .. } => ErrorType::HandshakeProtocol,
            Self::UpstreamError { .. } => ErrorType::UpstreamError,
            Self::ConnectionClosed => ErrorType::ConnectionClosed,
            Self::DeadlineExceeded { .. } => ErrorType::DeadlineExceeded,
            Self::ResponderFailed { .. } => ErrorType::ResponderFailed,
            Self::StreamError { .. } => ErrorType::StreamError,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::UpstreamError {
            message: message.into(),
            details: None,
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            Self::InvalidRequest { .. } | Self::ConnectionClosed => None,
            Self::TokenInvalid { message } => message.as_ref().map(|msg| {
                let mut map = Map::new();
                map.insert("message".to_string(), Value::String(msg.clone()));
                Value::Object(map)
            }),
            Self::ConnectFailed { url, .. } => {
                let mut map = Map::new();
                map.insert("url".to_string(), Value::String(url.clone()));
                Some(Value::Object(map))
            }
            Self::ConnectTimeout { url, timeout_ms } => {
                let mut map = Map::new();
                map.insert("url".to_string(), Value::String(url.clone()));
                map.insert("timeoutMs".to_string(), Value::from(*timeout_ms));
                Some(Value::Object(map))
            }
            Self::HandshakeTimeout { step, timeout_ms } => {
                let mut map = Map::new();
                map.insert("step".to_string(), Value::String(step.clone()));
                map.insert("timeoutMs".to_string(), Value::from(*timeout_ms));
                Some(Value::Object(map))
            }
            Self::HandshakeRejected { details, .. } | Self::UpstreamError { details, .. } => {
                details.clone()
            }
            Self::HandshakeProtocol { .. } | Self::StreamError { .. } => None,
            Self::DeadlineExceeded { timeout_ms } => {
                let mut map = Map::new();
                map.insert("timeoutMs".to_string(), Value::from(*timeout_ms));
                Some(Value::Object(map))
            }
            Self::ResponderFailed { collaborator, .. } => {
                let mut map = Map::new();
                map.insert(
                    "collaborator".to_string(),
                    Value::String(collaborator.clone()),
                );
                Some(Value::Object(map))
            }
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        if let Some(details) = self.details() {
            problem.extensions.insert("details".to_string(), details);
        }
        problem
    }
}

impl From<BridgeError> for ProblemDetails {
    fn from(value: BridgeError) -> Self {
        value.to_problem_details()
    }
}
