use std::time::{Duration, Instant};

use gateway_bridge_error::{BridgeError, ErrorType};

use crate::config::{BridgeConfig, Timeouts};
use crate::connection::GatewayConnection;
use crate::events::{BridgeEvent, EventSink};
use crate::handshake::{perform_handshake, ClientIdentity};
use crate::orchestrator::{ConversationOutcome, ThreadOrchestrator, TurnRunner};
use crate::target::GatewayTarget;
use crate::turn;

/// Upper bound on writing `end`/`error` into a stream the client is not draining.
pub const TERMINAL_WRITE_GRACE: Duration = Duration::from_secs(1);

/// One validated `POST /v1/chat` call.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub target: String,
    pub session_key: String,
    pub message: String,
    pub idempotency_key: String,
    pub agent_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed { rounds: u32 },
    /// A turn ended in error; the `error` event was written by the turn.
    TurnFailed { rounds: u32 },
    Failed(ErrorType),
    DeadlineExceeded,
    ClientDisconnected,
}

/// Runs the whole lifecycle of one bridged request.
#[derive(Debug, Clone)]
pub struct SessionDriver {
    target: GatewayTarget,
    identity: ClientIdentity,
    timeouts: Timeouts,
    orchestrator: ThreadOrchestrator,
}

enum Race {
    Finished(Result<ConversationOutcome, BridgeError>),
    Deadline,
    ClientGone,
}

impl SessionDriver {
    pub fn new(config: &BridgeConfig, orchestrator: ThreadOrchestrator) -> Self {
        Self {
            target: config.target.clone(),
            identity: config.identity.clone(),
            timeouts: config.timeouts.clone(),
            orchestrator,
        }
    }

    /// Streams the conversation into `sink` and always tears the socket down.
    ///
    /// The socket is closed before the terminal event is written, so a client
    /// that stops reading can delay the `end`/`error` write by at most
    /// `TERMINAL_WRITE_GRACE` and never keeps the gateway socket open. `end`
    /// is written only when the conversation completes; every failure path
    /// writes a single `error` instead. Nothing is written once the client
    /// has gone away.
    pub async fn drive(&self, request: ChatRequest, sink: EventSink) -> SessionOutcome {
        let start = Instant::now();
        let url = match self.target.resolve(&request.target) {
            Ok(url) => url,
            Err(err) => {
                let err = BridgeError::invalid_request(err.to_string());
                sink.finish(
                    BridgeEvent::Error {
                        error: err.to_string(),
                    },
                    TERMINAL_WRITE_GRACE,
                )
                .await;
                return SessionOutcome::Failed(err.error_type());
            }
        };

        tracing::info!(
            target_id = %request.target,
            session_key = %request.session_key,
            url = %url,
            "session: starting"
        );

        let mut connection = None;
        let deadline = self.timeouts.request_deadline;
        let race = tokio::select! {
            result = self.converse(&mut connection, &url, &request, &sink) => Race::Finished(result),
            _ = tokio::time::sleep(deadline) => Race::Deadline,
            _ = sink.closed() => Race::ClientGone,
        };

        if let Some(mut connection) = connection.take() {
            connection.close().await;
        }

        let (outcome, terminal) = match race {
            Race::Finished(Ok(ConversationOutcome::Completed { rounds })) => {
                (SessionOutcome::Completed { rounds }, Some(BridgeEvent::End))
            }
            Race::Finished(Ok(ConversationOutcome::Stopped { rounds })) => {
                (SessionOutcome::TurnFailed { rounds }, None)
            }
            Race::Finished(Err(err)) => {
                tracing::warn!(error = %err, "session: failed");
                (
                    SessionOutcome::Failed(err.error_type()),
                    Some(BridgeEvent::Error {
                        error: err.to_string(),
                    }),
                )
            }
            Race::Deadline => {
                let err = BridgeError::DeadlineExceeded {
                    timeout_ms: duration_ms(deadline),
                };
                tracing::warn!(error = %err, "session: deadline exceeded");
                (
                    SessionOutcome::DeadlineExceeded,
                    Some(BridgeEvent::Error {
                        error: err.to_string(),
                    }),
                )
            }
            Race::ClientGone => {
                tracing::info!("session: client disconnected");
                (SessionOutcome::ClientDisconnected, None)
            }
        };

        if let Some(event) = terminal {
            sink.finish(event, TERMINAL_WRITE_GRACE).await;
        }

        tracing::info!(
            outcome = ?outcome,
            events = sink.emitted(),
            elapsed_ms = duration_ms(start.elapsed()),
            "session: finished"
        );
        outcome
    }

    async fn converse(
        &self,
        slot: &mut Option<GatewayConnection>,
        url: &str,
        request: &ChatRequest,
        sink: &EventSink,
    ) -> Result<ConversationOutcome, BridgeError> {
        let connection = slot.insert(GatewayConnection::open(url, self.timeouts.connect).await?);
        perform_handshake(
            connection,
            &self.identity,
            request.agent_token.as_deref(),
            self.timeouts.handshake_step,
        )
        .await?;

        let mut runner = GatewayTurnRunner {
            connection,
            sink,
            session_key: &request.session_key,
        };
        self.orchestrator
            .run_conversation(
                &mut runner,
                sink,
                request.message.clone(),
                request.idempotency_key.clone(),
            )
            .await
    }
}

struct GatewayTurnRunner<'a> {
    connection: &'a mut GatewayConnection,
    sink: &'a EventSink,
    session_key: &'a str,
}

impl TurnRunner for GatewayTurnRunner<'_> {
    async fn run_turn(&mut self, message: String, idempotency_key: String) -> Option<String> {
        turn::run_turn(
            self.connection,
            self.sink,
            self.session_key,
            &message,
            &idempotency_key,
        )
        .await
    }
}

fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis() as u64
}
