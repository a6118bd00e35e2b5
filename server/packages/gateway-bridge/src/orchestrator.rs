use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use gateway_bridge_error::BridgeError;
use uuid::Uuid;

use crate::events::{BridgeEvent, EventSink};
use crate::mentions::{MentionDetector, MentionMatch};
use crate::responder::CollaboratorResponder;

/// Submits one turn and waits for its finalized text.
///
/// `None` means the turn errored or the connection was lost and the error
/// has already been written to the client; the loop stops without retrying.
pub trait TurnRunner: Send {
    fn run_turn(
        &mut self,
        message: String,
        idempotency_key: String,
    ) -> impl Future<Output = Option<String>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadEntry {
    pub participant: String,
    pub content: String,
}

/// Synthesized exchange for a single mention: the directed message and one reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    pub id: String,
    pub from: String,
    pub to: String,
    pub entries: Vec<ThreadEntry>,
    pub complete: bool,
}

impl Thread {
    pub fn reply(&self) -> Option<&str> {
        self.entries
            .iter()
            .skip(1)
            .find(|entry| entry.participant == self.to)
            .map(|entry| entry.content.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationOutcome {
    /// No more mentions, or the depth budget ran out.
    Completed { rounds: u32 },
    /// A turn failed; its error is already on the stream.
    Stopped { rounds: u32 },
}

#[derive(Debug, Clone, Copy)]
struct DepthBudget {
    used: u32,
    max: u32,
}

impl DepthBudget {
    fn try_consume(&mut self) -> bool {
        if self.used >= self.max {
            return false;
        }
        self.used += 1;
        true
    }
}

#[derive(Clone)]
pub struct ThreadOrchestrator {
    detector: MentionDetector,
    responder: Arc<dyn CollaboratorResponder>,
    primary_agent: String,
    max_depth: u32,
    thread_delay: Duration,
}

impl std::fmt::Debug for ThreadOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadOrchestrator")
            .field("primary_agent", &self.primary_agent)
            .field("max_depth", &self.max_depth)
            .field("thread_delay", &self.thread_delay)
            .finish_non_exhaustive()
    }
}

impl ThreadOrchestrator {
    pub fn new(
        detector: MentionDetector,
        responder: Arc<dyn CollaboratorResponder>,
        primary_agent: impl Into<String>,
        max_depth: u32,
    ) -> Self {
        Self {
            detector,
            responder,
            primary_agent: primary_agent.into(),
            max_depth,
            thread_delay: Duration::ZERO,
        }
    }

    /// Pause between `thread_start` and `thread_message`. Cosmetic only.
    pub fn with_thread_delay(mut self, delay: Duration) -> Self {
        self.thread_delay = delay;
        self
    }

    /// Runs the first turn and then injection rounds until no mentions
    /// remain or the depth budget is spent.
    pub async fn run_conversation<R: TurnRunner>(
        &self,
        runner: &mut R,
        sink: &EventSink,
        message: String,
        idempotency_key: String,
    ) -> Result<ConversationOutcome, BridgeError> {
        let mut budget = DepthBudget {
            used: 0,
            max: self.max_depth,
        };

        let Some(mut text) = runner.run_turn(message, idempotency_key).await else {
            return Ok(ConversationOutcome::Stopped { rounds: 0 });
        };

        loop {
            let mentions = self.detector.detect(&text);
            if mentions.is_empty() {
                tracing::debug!(rounds = budget.used, "orchestrator: no mentions, done");
                return Ok(ConversationOutcome::Completed { rounds: budget.used });
            }
            if !budget.try_consume() {
                tracing::info!(
                    rounds = budget.used,
                    pending_mentions = mentions.len(),
                    "orchestrator: depth budget exhausted"
                );
                return Ok(ConversationOutcome::Completed { rounds: budget.used });
            }

            tracing::info!(
                round = budget.used,
                mentions = mentions.len(),
                "orchestrator: starting injection round"
            );
            let threads = self.run_round(&mentions, sink).await?;
            let follow_up = follow_up_message(&threads);

            match runner
                .run_turn(follow_up, Uuid::new_v4().to_string())
                .await
            {
                Some(next) => text = next,
                None => return Ok(ConversationOutcome::Stopped { rounds: budget.used }),
            }
        }
    }

    /// Emits the thread events for every mention, in order.
    pub async fn run_round(
        &self,
        mentions: &[MentionMatch],
        sink: &EventSink,
    ) -> Result<Vec<Thread>, BridgeError> {
        let mut threads = Vec::with_capacity(mentions.len());
        for mention in mentions {
            let mut thread = Thread {
                id: Uuid::new_v4().to_string(),
                from: self.primary_agent.clone(),
                to: mention.collaborator.clone(),
                entries: vec![ThreadEntry {
                    participant: self.primary_agent.clone(),
                    content: mention.message.clone(),
                }],
                complete: false,
            };

            sink.emit(BridgeEvent::ThreadStart {
                thread_id: thread.id.clone(),
                from: thread.from.clone(),
                to: thread.to.clone(),
                message: mention.message.clone(),
            })
            .await;

            if !self.thread_delay.is_zero() {
                tokio::time::sleep(self.thread_delay).await;
            }

            let reply = self
                .responder
                .respond(&mention.collaborator, &mention.message)
                .await?;
            thread.entries.push(ThreadEntry {
                participant: thread.to.clone(),
                content: reply.clone(),
            });

            sink.emit(BridgeEvent::ThreadMessage {
                thread_id: thread.id.clone(),
                agent: thread.to.clone(),
                content: reply,
            })
            .await;
            thread.complete = true;
            sink.emit(BridgeEvent::ThreadEnd {
                thread_id: thread.id.clone(),
            })
            .await;

            threads.push(thread);
        }
        Ok(threads)
    }
}

/// One line per collaborator reply, prefixed with the collaborator id.
pub fn follow_up_message(threads: &[Thread]) -> String {
    threads
        .iter()
        .filter_map(|thread| thread.reply().map(|reply| format!("{}: {}", thread.to, reply)))
        .collect::<Vec<_>>()
        .join("\n")
}
