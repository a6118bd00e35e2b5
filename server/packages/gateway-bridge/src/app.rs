use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::sse::KeepAlive;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use gateway_bridge_error::{BridgeError, ProblemDetails};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::Span;
use uuid::Uuid;

use crate::config::BridgeConfig;
use crate::events::EventSink;
use crate::session::{ChatRequest, SessionDriver};
use crate::target::validate_target;

pub const INSTANCE_ID_HEADER: &str = "x-instance-id";
pub const AGENT_TOKEN_HEADER: &str = "x-agent-token";
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Immutable state shared by every request.
#[derive(Debug)]
pub struct BridgeState {
    secret: String,
    sse_buffer: usize,
    driver: Arc<SessionDriver>,
}

impl BridgeState {
    pub fn new(config: &BridgeConfig) -> Result<Self, regex::Error> {
        let orchestrator = config.orchestrator(config.responder())?;
        Ok(Self {
            secret: config.secret.clone(),
            sse_buffer: config.sse_buffer.max(1),
            driver: Arc::new(SessionDriver::new(config, orchestrator)),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match self {
            ApiError::Bridge(err) => err.into(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatBody {
    session_key: String,
    message: String,
    #[serde(default)]
    idempotency_key: Option<String>,
}

pub fn build_router(state: Arc<BridgeState>) -> Router {
    let chat = Router::new()
        .route("/v1/chat", post(post_chat))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_secret,
        ));

    Router::new()
        .route("/v1/health", get(get_health))
        .merge(chat)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request<Body>| {
                    tracing::info_span!(
                        "http.request",
                        method = %req.method(),
                        uri = %req.uri()
                    )
                })
                .on_request(|_req: &Request<Body>, span: &Span| {
                    tracing::info!(parent: span, "request");
                })
                .on_response(|res: &Response, latency: Duration, span: &Span| {
                    tracing::info!(
                        parent: span,
                        status = %res.status(),
                        latency_ms = latency.as_millis()
                    );
                }),
        )
        .with_state(state)
}

async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn require_secret(
    State(state): State<Arc<BridgeState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = bearer_token(request.headers());
    if !state.secret.is_empty() && provided == Some(state.secret.as_str()) {
        return Ok(next.run(request).await);
    }
    Err(BridgeError::TokenInvalid {
        message: Some("missing or invalid bearer token".to_string()),
    }
    .into())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, rest) = value.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then_some(rest.trim())
}

async fn post_chat(
    State(state): State<Arc<BridgeState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request = parse_chat_request(&headers, &body)?;
    tracing::info!(
        target_id = %request.target,
        session_key = %request.session_key,
        has_agent_token = request.agent_token.is_some(),
        "chat: accepted"
    );

    let (sink, rx) = EventSink::channel(state.sse_buffer);
    let driver = state.driver.clone();
    tokio::spawn(async move {
        driver.drive(request, sink).await;
    });

    let stream = ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(event.to_sse()));
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
        .into_response())
}

fn parse_chat_request(headers: &HeaderMap, body: &[u8]) -> Result<ChatRequest, BridgeError> {
    let target = header_value(headers, INSTANCE_ID_HEADER)
        .ok_or_else(|| BridgeError::invalid_request("missing X-Instance-Id header"))?;
    validate_target(target)
        .map_err(|err| BridgeError::invalid_request(format!("invalid X-Instance-Id: {err}")))?;

    let body: ChatBody = serde_json::from_slice(body)
        .map_err(|err| BridgeError::invalid_request(format!("invalid request body: {err}")))?;
    if body.session_key.trim().is_empty() {
        return Err(BridgeError::invalid_request("sessionKey must not be empty"));
    }
    if body.message.trim().is_empty() {
        return Err(BridgeError::invalid_request("message must not be empty"));
    }

    let idempotency_key = body
        .idempotency_key
        .filter(|key| !key.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    Ok(ChatRequest {
        target: target.to_string(),
        session_key: body.session_key,
        message: body.message,
        idempotency_key,
        agent_token: header_value(headers, AGENT_TOKEN_HEADER).map(str::to_string),
    })
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).expect("header"));
        }
        map
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        assert_eq!(
            bearer_token(&headers(&[("authorization", "bearer s3cret")])),
            Some("s3cret")
        );
        assert_eq!(bearer_token(&headers(&[("authorization", "Basic abc")])), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn chat_request_defaults_idempotency_key() {
        let request = parse_chat_request(
            &headers(&[("x-instance-id", "agent-1"), ("x-agent-token", "tok")]),
            br#"{"sessionKey":"agent:main","message":"hi"}"#,
        )
        .expect("request");
        assert_eq!(request.target, "agent-1");
        assert_eq!(request.agent_token.as_deref(), Some("tok"));
        assert!(Uuid::parse_str(&request.idempotency_key).is_ok());
    }

    #[test]
    fn chat_request_keeps_client_idempotency_key() {
        let request = parse_chat_request(
            &headers(&[("x-instance-id", "agent-1")]),
            br#"{"sessionKey":"s","message":"hi","idempotencyKey":"abc"}"#,
        )
        .expect("request");
        assert_eq!(request.idempotency_key, "abc");
        assert_eq!(request.agent_token, None);
    }

    #[test]
    fn chat_request_validation_errors() {
        let ok_headers = headers(&[("x-instance-id", "agent-1")]);
        let bodies: [&[u8]; 4] = [
            b"not json",
            br#"{"message":"hi"}"#,
            br#"{"sessionKey":"s","message":"   "}"#,
            br#"{"sessionKey":"","message":"hi"}"#,
        ];
        for body in bodies {
            let err = parse_chat_request(&ok_headers, body).expect_err("invalid");
            assert!(matches!(err, BridgeError::InvalidRequest { .. }), "{err}");
        }

        let err = parse_chat_request(
            &headers(&[("x-instance-id", "a/b")]),
            br#"{"sessionKey":"s","message":"hi"}"#,
        )
        .expect_err("invalid target");
        assert!(err.to_string().contains("X-Instance-Id"));
    }
}
