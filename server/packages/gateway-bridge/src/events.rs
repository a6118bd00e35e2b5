use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use axum::response::sse::Event;
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Output of the turn state machine, before translation.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Delta(String),
    Tool(Value),
    Done(String),
    Error(String),
}

/// Outward SSE vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Delta {
        content: String,
    },
    Tool(Value),
    Done {
        content: String,
    },
    ThreadStart {
        thread_id: String,
        from: String,
        to: String,
        message: String,
    },
    ThreadMessage {
        thread_id: String,
        agent: String,
        content: String,
    },
    ThreadEnd {
        thread_id: String,
    },
    Error {
        error: String,
    },
    End,
}

impl BridgeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Delta { .. } => "delta",
            Self::Tool(_) => "tool",
            Self::Done { .. } => "done",
            Self::ThreadStart { .. } => "thread_start",
            Self::ThreadMessage { .. } => "thread_message",
            Self::ThreadEnd { .. } => "thread_end",
            Self::Error { .. } => "error",
            Self::End => "end",
        }
    }

    pub fn data(&self) -> Value {
        match self {
            Self::Delta { content } | Self::Done { content } => json!({ "content": content }),
            Self::Tool(payload) => payload.clone(),
            Self::ThreadStart {
                thread_id,
                from,
                to,
                message,
            } => json!({
                "threadId": thread_id,
                "from": from,
                "to": to,
                "message": message,
            }),
            Self::ThreadMessage {
                thread_id,
                agent,
                content,
            } => json!({
                "threadId": thread_id,
                "agent": agent,
                "content": content,
            }),
            Self::ThreadEnd { thread_id } => json!({ "threadId": thread_id }),
            Self::Error { error } => json!({ "error": error }),
            Self::End => json!({}),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::End)
    }

    pub fn to_sse(&self) -> Event {
        Event::default()
            .event(self.name())
            .data(self.data().to_string())
    }
}

pub fn translate(event: TurnEvent) -> BridgeEvent {
    match event {
        TurnEvent::Delta(content) => BridgeEvent::Delta { content },
        TurnEvent::Tool(payload) => BridgeEvent::Tool(payload),
        TurnEvent::Done(content) => BridgeEvent::Done { content },
        TurnEvent::Error(error) => BridgeEvent::Error { error },
    }
}

/// Ordered writer for one request's event stream.
///
/// At most one terminal event (`error` or `end`) is ever written and nothing
/// follows it.
#[derive(Debug)]
pub struct EventSink {
    tx: mpsc::Sender<BridgeEvent>,
    terminated: AtomicBool,
    emitted: AtomicU64,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<BridgeEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                terminated: AtomicBool::new(false),
                emitted: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Writes one event, honoring the single-terminal rule. Returns whether it was written.
    pub async fn emit(&self, event: BridgeEvent) -> bool {
        if event.is_terminal() {
            if self.terminated.swap(true, Ordering::SeqCst) {
                tracing::debug!(event = event.name(), "sink: dropping event after terminal");
                return false;
            }
        } else if self.terminated.load(Ordering::SeqCst) {
            tracing::debug!(event = event.name(), "sink: dropping event after terminal");
            return false;
        }

        let name = event.name();
        if self.tx.send(event).await.is_err() {
            tracing::debug!(event = name, "sink: client stream already closed");
            return false;
        }
        self.emitted.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub async fn emit_turn(&self, event: TurnEvent) -> bool {
        self.emit(translate(event)).await
    }

    pub async fn fail(&self, error: impl Into<String>) -> bool {
        self.emit(BridgeEvent::Error {
            error: error.into(),
        })
        .await
    }

    /// Writes the request's terminal event, giving up after `limit` when the
    /// client keeps its stream open without reading. Only the session driver
    /// calls this.
    pub(crate) async fn finish(&self, event: BridgeEvent, limit: Duration) -> bool {
        let name = event.name();
        match tokio::time::timeout(limit, self.emit(event)).await {
            Ok(written) => written,
            Err(_) => {
                tracing::warn!(
                    event = name,
                    limit_ms = limit.as_millis() as u64,
                    "sink: client not draining, terminal event dropped"
                );
                false
            }
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Resolves when the downstream client has gone away.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translation_maps_turn_events_to_vocabulary() {
        assert_eq!(
            translate(TurnEvent::Delta("hi".to_string())).data(),
            json!({"content": "hi"})
        );
        assert_eq!(translate(TurnEvent::Done("x".to_string())).name(), "done");
        assert_eq!(
            translate(TurnEvent::Error("boom".to_string())).data(),
            json!({"error": "boom"})
        );
        let tool = json!({"name": "bash", "input": {"cmd": "ls"}});
        assert_eq!(translate(TurnEvent::Tool(tool.clone())).data(), tool);
    }

    #[test]
    fn thread_payloads_use_camel_case_ids() {
        let start = BridgeEvent::ThreadStart {
            thread_id: "t1".to_string(),
            from: "main".to_string(),
            to: "coder".to_string(),
            message: "fix Y".to_string(),
        };
        assert_eq!(
            start.data(),
            json!({"threadId": "t1", "from": "main", "to": "coder", "message": "fix Y"})
        );
        assert_eq!(
            BridgeEvent::ThreadEnd {
                thread_id: "t1".to_string()
            }
            .data(),
            json!({"threadId": "t1"})
        );
    }

    #[tokio::test]
    async fn sink_writes_a_single_terminal_event() {
        let (sink, mut rx) = EventSink::channel(16);
        assert!(sink.emit_turn(TurnEvent::Delta("a".to_string())).await);
        assert!(sink.emit(BridgeEvent::End).await);
        assert!(!sink.emit(BridgeEvent::End).await);
        assert!(!sink.fail("late").await);
        assert!(!sink.emit_turn(TurnEvent::Delta("b".to_string())).await);
        drop(sink);

        let mut names = Vec::new();
        while let Some(event) = rx.recv().await {
            names.push(event.name());
        }
        assert_eq!(names, vec!["delta", "end"]);
    }

    #[tokio::test]
    async fn error_blocks_later_end() {
        let (sink, mut rx) = EventSink::channel(4);
        assert!(sink.fail("connection closed unexpectedly").await);
        assert!(!sink.emit(BridgeEvent::End).await);
        assert!(sink.is_terminated());
        drop(sink);
        assert_eq!(
            rx.recv().await,
            Some(BridgeEvent::Error {
                error: "connection closed unexpectedly".to_string()
            })
        );
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn finish_gives_up_when_client_is_not_reading() {
        let (sink, _rx) = EventSink::channel(1);
        assert!(sink.emit_turn(TurnEvent::Delta("fills the buffer".to_string())).await);

        let written = sink
            .finish(
                BridgeEvent::Error {
                    error: "late".to_string(),
                },
                Duration::from_millis(50),
            )
            .await;
        assert!(!written);
        assert!(sink.is_terminated());
        assert!(!sink.emit(BridgeEvent::End).await);
    }
}
