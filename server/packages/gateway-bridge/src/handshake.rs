//! Connect sequence: await `connect.challenge`, send `connect`, await the
//! correlated response. Nothing else may be sent until this completes.

use std::time::Duration;

use gateway_bridge_error::BridgeError;
use serde::Serialize;
use serde_json::{json, Value};

use crate::connection::GatewayConnection;
use crate::frame::{Frame, GatewayEvent, RequestFrame, CHALLENGE_EVENT, CONNECT_METHOD};

/// Client identity and capabilities declared in the `connect` request.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub id: String,
    pub display_name: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub min_protocol: u32,
    pub max_protocol: u32,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            id: "gateway-client".to_string(),
            display_name: "Gateway Bridge".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            mode: "backend".to_string(),
            role: "operator".to_string(),
            scopes: vec!["operator.admin".to_string()],
            min_protocol: 3,
            max_protocol: 3,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectParams<'a> {
    min_protocol: u32,
    max_protocol: u32,
    client: ClientInfo<'a>,
    role: &'a str,
    scopes: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    auth: Option<ConnectAuth<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientInfo<'a> {
    id: &'a str,
    display_name: &'a str,
    version: &'a str,
    platform: &'a str,
    mode: &'a str,
}

#[derive(Debug, Serialize)]
struct ConnectAuth<'a> {
    token: &'a str,
}

/// Accepted handshake. `hello` is the response payload, kept for logging.
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    pub hello: Option<Value>,
}

pub fn connect_params(identity: &ClientIdentity, token: Option<&str>) -> Value {
    let params = ConnectParams {
        min_protocol: identity.min_protocol,
        max_protocol: identity.max_protocol,
        client: ClientInfo {
            id: &identity.id,
            display_name: &identity.display_name,
            version: &identity.version,
            platform: &identity.platform,
            mode: &identity.mode,
        },
        role: &identity.role,
        scopes: &identity.scopes,
        auth: token.map(|token| ConnectAuth { token }),
    };
    serde_json::to_value(params).unwrap_or_else(|_| json!({}))
}

pub async fn perform_handshake(
    connection: &mut GatewayConnection,
    identity: &ClientIdentity,
    token: Option<&str>,
    step_timeout: Duration,
) -> Result<HandshakeOutcome, BridgeError> {
    let timeout_ms = step_timeout.as_millis() as u64;

    let first = tokio::time::timeout(step_timeout, connection.next_frame())
        .await
        .map_err(|_| BridgeError::HandshakeTimeout {
            step: CHALLENGE_EVENT.to_string(),
            timeout_ms,
        })?;
    let nonce = match first {
        None => {
            return Err(BridgeError::HandshakeProtocol {
                message: "connection closed before connect.challenge".to_string(),
            })
        }
        Some(Err(err)) => {
            return Err(BridgeError::HandshakeProtocol {
                message: format!("malformed frame before connect.challenge: {err}"),
            })
        }
        Some(Ok(Frame::Event(event))) if event.event == CHALLENGE_EVENT => {
            match GatewayEvent::classify(&event) {
                GatewayEvent::Challenge { nonce } => nonce,
                _ => None,
            }
        }
        Some(Ok(other)) => {
            return Err(BridgeError::HandshakeProtocol {
                message: format!(
                    "expected connect.challenge, received {} frame",
                    describe(&other)
                ),
            })
        }
    };
    tracing::debug!(nonce = ?nonce, "handshake: challenge received");

    let request = RequestFrame::new(CONNECT_METHOD, connect_params(identity, token));
    let request_id = request.id.clone();
    connection.send(&Frame::Req(request)).await?;

    let response = tokio::time::timeout(step_timeout, async {
        loop {
            match connection.next_frame().await {
                None => {
                    return Err(BridgeError::HandshakeProtocol {
                        message: "connection closed before connect response".to_string(),
                    })
                }
                Some(Err(err)) => {
                    return Err(BridgeError::HandshakeProtocol {
                        message: format!("malformed frame during handshake: {err}"),
                    })
                }
                Some(Ok(Frame::Res(res))) if res.id == request_id => return Ok(res),
                Some(Ok(other)) => {
                    tracing::debug!(frame = %describe(&other), "handshake: ignoring uncorrelated frame");
                }
            }
        }
    })
    .await
    .map_err(|_| BridgeError::HandshakeTimeout {
        step: "connect response".to_string(),
        timeout_ms,
    })??;

    if !response.ok {
        tracing::warn!(error = ?response.error, "handshake rejected");
        return Err(BridgeError::HandshakeRejected {
            message: response.error_message(),
            details: response.error.clone(),
        });
    }

    connection.mark_ready();
    tracing::info!(url = %connection.url(), "handshake complete");
    Ok(HandshakeOutcome {
        hello: response.payload,
    })
}

fn describe(frame: &Frame) -> String {
    match frame {
        Frame::Event(event) => format!("event `{}`", event.event),
        Frame::Req(req) => format!("req `{}`", req.method),
        Frame::Res(res) => format!("res `{}`", res.id),
    }
}
