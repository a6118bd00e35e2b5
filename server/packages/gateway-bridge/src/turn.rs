//! One submitted message and everything the gateway streams back for it.
//!
//! [`TurnMachine`] is transport free: it consumes decoded frames and returns
//! the events to forward. [`run_turn`] wires it to a live connection.
//!
//! A chat `final` only ends the turn once the agent lifecycle has reported
//! `end`. Finals seen before that belong to intermediate sub-turns (for
//! example the reply preceding a tool call) and are suppressed: they emit no
//! `done` and the machine keeps listening.

use std::time::Instant;

use gateway_bridge_error::BridgeError;
use serde_json::{json, Value};

use crate::connection::GatewayConnection;
use crate::events::{EventSink, TurnEvent};
use crate::frame::{
    ChatState, EventFrame, Frame, GatewayEvent, RequestFrame, AGENT_EVENT, CHAT_SEND_METHOD,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    AwaitingEvents,
    Finalized,
    Errored,
    Lost,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        self != TurnState::AwaitingEvents
    }
}

#[derive(Debug)]
pub enum TurnInput {
    Frame(Frame),
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Advance {
    pub emit: Vec<TurnEvent>,
    pub next: TurnState,
}

#[derive(Debug)]
pub struct TurnMachine {
    session_key: String,
    request_id: String,
    state: TurnState,
    buffer: String,
    lifecycle_ended: bool,
    intermediate_finals: u32,
    final_text: Option<String>,
    run_id: Option<String>,
    error: Option<BridgeError>,
}

impl TurnMachine {
    pub fn new(session_key: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            request_id: request_id.into(),
            state: TurnState::AwaitingEvents,
            buffer: String::new(),
            lifecycle_ended: false,
            intermediate_finals: 0,
            final_text: None,
            run_id: None,
            error: None,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn final_text(&self) -> Option<&str> {
        self.final_text.as_deref()
    }

    pub fn intermediate_finals(&self) -> u32 {
        self.intermediate_finals
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    /// Why the turn ended, when it did not finalize.
    pub fn error(&self) -> Option<&BridgeError> {
        self.error.as_ref()
    }

    pub fn into_final_text(self) -> Option<String> {
        self.final_text
    }

    pub fn advance(&mut self, input: TurnInput) -> Advance {
        if self.state.is_terminal() {
            return self.step(Vec::new());
        }

        let frame = match input {
            TurnInput::Closed => return self.fail(TurnState::Lost, BridgeError::ConnectionClosed),
            TurnInput::Frame(frame) => frame,
        };

        match frame {
            Frame::Res(res) if res.id == self.request_id => {
                if !res.ok {
                    let err = BridgeError::UpstreamError {
                        message: res.error_message(),
                        details: res.error.clone(),
                    };
                    return self.fail(TurnState::Errored, err);
                }
                self.run_id = res
                    .payload
                    .as_ref()
                    .and_then(|payload| payload.get("runId"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                self.step(Vec::new())
            }
            Frame::Res(_) | Frame::Req(_) => self.step(Vec::new()),
            Frame::Event(event) if self.is_other_run(&event) => {
                tracing::debug!(run_id = ?event.run_id(), "turn: ignoring event from another run");
                self.step(Vec::new())
            }
            Frame::Event(event) => self.on_event(GatewayEvent::classify(&event)),
        }
    }

    /// Agent events tagged with a run other than the one this turn started.
    fn is_other_run(&self, event: &EventFrame) -> bool {
        if event.event != AGENT_EVENT {
            return false;
        }
        match (self.run_id.as_deref(), event.run_id()) {
            (Some(ours), Some(theirs)) => ours != theirs,
            _ => false,
        }
    }

    fn on_event(&mut self, event: GatewayEvent) -> Advance {
        match event {
            GatewayEvent::AssistantDelta { text } => {
                if text.is_empty() {
                    return self.step(Vec::new());
                }
                self.buffer.push_str(&text);
                self.step(vec![TurnEvent::Delta(text)])
            }
            GatewayEvent::Tool(tool) => self.step(vec![TurnEvent::Tool(tool.payload)]),
            GatewayEvent::Lifecycle { phase, error } => match phase.as_str() {
                "end" => {
                    self.lifecycle_ended = true;
                    self.step(Vec::new())
                }
                "error" => self.fail(
                    TurnState::Errored,
                    BridgeError::upstream(error.unwrap_or_else(|| "agent run failed".to_string())),
                ),
                _ => self.step(Vec::new()),
            },
            GatewayEvent::Chat(update) => {
                if update
                    .session_key
                    .as_deref()
                    .is_some_and(|key| key != self.session_key)
                {
                    return self.step(Vec::new());
                }
                match update.state {
                    ChatState::Final => self.on_final(update.text),
                    ChatState::Error => self.fail(
                        TurnState::Errored,
                        BridgeError::upstream(
                            update
                                .error
                                .unwrap_or_else(|| "agent reported an error".to_string()),
                        ),
                    ),
                    ChatState::Aborted => {
                        self.fail(TurnState::Errored, BridgeError::upstream("agent run aborted"))
                    }
                    ChatState::Delta | ChatState::Unknown(_) => self.step(Vec::new()),
                }
            }
            GatewayEvent::Challenge { .. } | GatewayEvent::Other { .. } => self.step(Vec::new()),
        }
    }

    fn on_final(&mut self, text: Option<String>) -> Advance {
        if !self.lifecycle_ended {
            self.intermediate_finals += 1;
            self.buffer.clear();
            tracing::debug!(
                intermediate_finals = self.intermediate_finals,
                "turn: final before lifecycle end, waiting for next sub-turn"
            );
            return self.step(Vec::new());
        }

        let text = text.unwrap_or_else(|| std::mem::take(&mut self.buffer));
        self.final_text = Some(text.clone());
        self.state = TurnState::Finalized;
        self.step(vec![TurnEvent::Done(text)])
    }

    fn fail(&mut self, next: TurnState, error: BridgeError) -> Advance {
        self.state = next;
        let message = error.to_string();
        self.error = Some(error);
        self.step(vec![TurnEvent::Error(message)])
    }

    fn step(&self, emit: Vec<TurnEvent>) -> Advance {
        Advance {
            emit,
            next: self.state,
        }
    }
}

pub fn chat_send_params(session_key: &str, message: &str, idempotency_key: &str) -> Value {
    json!({
        "sessionKey": session_key,
        "message": message,
        "idempotencyKey": idempotency_key,
    })
}

/// Submits `message` and listens until the turn reaches a terminal state.
///
/// Returns the finalized text, or `None` when the turn errored or the
/// connection was lost; the matching `error` event has already been written.
pub async fn run_turn(
    connection: &mut GatewayConnection,
    sink: &EventSink,
    session_key: &str,
    message: &str,
    idempotency_key: &str,
) -> Option<String> {
    let start = Instant::now();
    let request = RequestFrame::new(
        CHAT_SEND_METHOD,
        chat_send_params(session_key, message, idempotency_key),
    );
    let mut machine = TurnMachine::new(session_key, request.id.clone());

    tracing::info!(
        session_key = %session_key,
        idempotency_key = %idempotency_key,
        message_len = message.len(),
        "turn: submitting message"
    );
    if let Err(err) = connection.send(&Frame::Req(request)).await {
        sink.fail(err.to_string()).await;
        return None;
    }

    loop {
        let input = match connection.next_frame().await {
            None => TurnInput::Closed,
            Some(Ok(frame)) => TurnInput::Frame(frame),
            Some(Err(err)) => {
                tracing::warn!(error = %err, "turn: ignoring malformed frame");
                continue;
            }
        };

        let advance = machine.advance(input);
        for event in advance.emit {
            sink.emit_turn(event).await;
        }
        if advance.next.is_terminal() {
            break;
        }
    }

    tracing::info!(
        state = ?machine.state(),
        error_type = ?machine.error().map(BridgeError::error_type),
        run_id = ?machine.run_id(),
        intermediate_finals = machine.intermediate_finals(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "turn: finished"
    );
    machine.into_final_text()
}
