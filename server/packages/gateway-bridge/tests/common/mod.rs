#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use futures::{SinkExt, StreamExt};
use gateway_bridge::app::{build_router, BridgeState};
use gateway_bridge::config::{BridgeConfig, Timeouts};
use gateway_bridge::target::GatewayTarget;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tower::util::ServiceExt;

pub const SECRET: &str = "test-secret";
pub const SESSION: &str = "agent:main:web";
pub const TARGET: &str = "agent-1";

/// What the mock gateway does on each accepted connection.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Accept the handshake, then answer the n-th `chat.send` with the n-th
    /// event list. The last list repeats.
    Script(Vec<Vec<Value>>),
    /// Accept the handshake, send these events on the first turn, then close.
    CloseMidTurn(Vec<Value>),
    RejectHandshake,
    /// Send an unrelated event before any challenge.
    WrongFirstFrame,
    /// Complete the upgrade but never speak.
    Silent,
}

pub struct MockGateway {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<Value>>>,
    closes: Arc<Mutex<u32>>,
    task: JoinHandle<()>,
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MockGateway {
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock gateway");
        let addr = listener.local_addr().expect("mock addr");
        let received = Arc::new(Mutex::new(Vec::new()));
        let closes = Arc::new(Mutex::new(0));

        let task = {
            let received = received.clone();
            let closes = closes.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(
                        stream,
                        behavior.clone(),
                        received.clone(),
                        closes.clone(),
                    ));
                }
            })
        };

        Self {
            addr,
            received,
            closes,
            task,
        }
    }

    pub fn url_template(&self) -> String {
        format!("ws://{}/gw/{{target}}", self.addr)
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().expect("received lock").clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|frame| frame.get("method").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }

    /// Close frames the bridge sent to this gateway.
    pub fn close_frames(&self) -> u32 {
        *self.closes.lock().expect("closes lock")
    }
}

async fn serve(
    stream: TcpStream,
    behavior: Behavior,
    received: Arc<Mutex<Vec<Value>>>,
    closes: Arc<Mutex<u32>>,
) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };

    match &behavior {
        Behavior::Silent => {}
        Behavior::WrongFirstFrame => {
            send(&mut ws, event_frame("health", json!({"ok": true}))).await;
        }
        _ => {
            send(
                &mut ws,
                event_frame("connect.challenge", json!({"nonce": "n-1", "ts": 1})),
            )
            .await;
        }
    }

    let mut turn = 0usize;
    while let Some(Ok(message)) = ws.next().await {
        let text = match message {
            Message::Text(text) => text.as_str().to_string(),
            Message::Close(_) => {
                *closes.lock().expect("closes lock") += 1;
                continue;
            }
            _ => continue,
        };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        received.lock().expect("received lock").push(frame.clone());

        let id = frame.get("id").cloned().unwrap_or(Value::Null);
        match frame.get("method").and_then(Value::as_str) {
            Some("connect") => {
                let reply = match behavior {
                    Behavior::RejectHandshake => json!({
                        "type": "res",
                        "id": id,
                        "ok": false,
                        "error": {"code": "UNAUTHORIZED", "message": "invalid agent token"},
                    }),
                    _ => json!({
                        "type": "res",
                        "id": id,
                        "ok": true,
                        "payload": {"type": "hello-ok", "protocol": 3},
                    }),
                };
                send(&mut ws, reply).await;
            }
            Some("chat.send") => {
                let run_id = format!("run-{turn}");
                send(
                    &mut ws,
                    json!({
                        "type": "res",
                        "id": id,
                        "ok": true,
                        "payload": {"runId": run_id, "status": "started"},
                    }),
                )
                .await;
                match &behavior {
                    Behavior::Script(turns) => {
                        let events = turns
                            .get(turn)
                            .or_else(|| turns.last())
                            .cloned()
                            .unwrap_or_default();
                        for event in events {
                            send(&mut ws, with_run_id(event, &run_id)).await;
                        }
                    }
                    Behavior::CloseMidTurn(events) => {
                        for event in events.clone() {
                            send(&mut ws, with_run_id(event, &run_id)).await;
                        }
                        let _ = ws.close(None).await;
                        return;
                    }
                    _ => {}
                }
                turn += 1;
            }
            _ => {}
        }
    }
}

/// Tags scripted agent events with the run the current `chat.send` started.
fn with_run_id(mut event: Value, run_id: &str) -> Value {
    if let Some(slot) = event.pointer_mut("/payload/runId") {
        *slot = Value::String(run_id.to_string());
    }
    event
}

async fn send(ws: &mut WebSocketStream<TcpStream>, frame: Value) {
    let _ = ws.send(Message::text(frame.to_string())).await;
}

pub fn event_frame(event: &str, payload: Value) -> Value {
    json!({"type": "event", "event": event, "payload": payload})
}

pub fn delta(text: &str) -> Value {
    event_frame(
        "agent",
        json!({"runId": "run", "stream": "assistant", "data": {"delta": text}}),
    )
}

pub fn tool(name: &str, args: Value) -> Value {
    event_frame(
        "agent",
        json!({"runId": "run", "stream": "tool", "data": {"name": name, "args": args}}),
    )
}

pub fn lifecycle(phase: &str) -> Value {
    event_frame(
        "agent",
        json!({"runId": "run", "stream": "lifecycle", "data": {"phase": phase}}),
    )
}

pub fn chat_final(text: &str) -> Value {
    event_frame(
        "chat",
        json!({
            "sessionKey": SESSION,
            "state": "final",
            "message": {"role": "assistant", "content": [{"type": "text", "text": text}]},
        }),
    )
}

/// A complete turn: streamed text, lifecycle end, then the final message.
pub fn answer(text: &str) -> Vec<Value> {
    vec![delta(text), lifecycle("end"), chat_final(text)]
}

/// Accepts TCP connections but never completes the WebSocket upgrade.
pub async fn stalled_listener() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stalled");
    let addr = listener.local_addr().expect("stalled addr");
    let task = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    (addr, task)
}

/// An address nothing listens on.
pub async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    addr
}

pub fn test_config(url_template: &str) -> BridgeConfig {
    BridgeConfig {
        secret: SECRET.to_string(),
        target: GatewayTarget::from_template(url_template).expect("template"),
        timeouts: Timeouts {
            connect: Duration::from_secs(2),
            handshake_step: Duration::from_secs(2),
            request_deadline: Duration::from_secs(10),
        },
        ..BridgeConfig::default()
    }
}

pub fn test_app(config: &BridgeConfig) -> Router {
    build_router(Arc::new(BridgeState::new(config).expect("bridge state")))
}

pub fn chat_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat")
        .header("authorization", format!("Bearer {SECRET}"))
        .header("x-instance-id", TARGET)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("chat request")
}

pub fn chat_body(message: &str) -> Value {
    json!({"sessionKey": SESSION, "message": message, "idempotencyKey": "client-key-1"})
}

#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: String,
    pub data: Value,
}

/// Sends the request and reads the SSE body until the bridge closes it.
pub async fn send_chat(app: &Router, request: Request<Body>) -> (StatusCode, Vec<SseEvent>) {
    let (status, _headers, events) = send_chat_with_headers(app, request).await;
    (status, events)
}

pub async fn send_chat_with_headers(
    app: &Router,
    request: Request<Body>,
) -> (StatusCode, HeaderMap, Vec<SseEvent>) {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request handled");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = tokio::time::timeout(Duration::from_secs(20), response.into_body().collect())
        .await
        .expect("stream finished in time")
        .expect("read body")
        .to_bytes();
    let text = String::from_utf8_lossy(&bytes).to_string();
    if status != StatusCode::OK {
        let problem = SseEvent {
            event: "http".to_string(),
            data: serde_json::from_str(&text).unwrap_or(Value::String(text)),
        };
        return (status, headers, vec![problem]);
    }
    (status, headers, parse_sse(&text))
}

pub fn parse_sse(text: &str) -> Vec<SseEvent> {
    text.split("\n\n")
        .filter_map(|block| {
            let mut event = None;
            let mut data = String::new();
            for line in block.lines() {
                if let Some(value) = line.strip_prefix("event:") {
                    event = Some(value.trim().to_string());
                } else if let Some(value) = line.strip_prefix("data:") {
                    data.push_str(value.trim_start());
                }
            }
            let event = event?;
            let data = serde_json::from_str(&data).unwrap_or(Value::Null);
            Some(SseEvent { event, data })
        })
        .collect()
}

pub fn names(events: &[SseEvent]) -> Vec<&str> {
    events.iter().map(|event| event.event.as_str()).collect()
}

pub fn error_message(events: &[SseEvent]) -> String {
    events
        .iter()
        .find(|event| event.event == "error")
        .and_then(|event| event.data.get("error"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
