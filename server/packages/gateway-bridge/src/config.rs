use std::sync::Arc;
use std::time::Duration;

use crate::handshake::ClientIdentity;
use crate::mentions::MentionDetector;
use crate::orchestrator::ThreadOrchestrator;
use crate::responder::{CollaboratorResponder, TemplateResponder};
use crate::target::GatewayTarget;

pub const DEFAULT_COLLABORATORS: [&str; 4] = ["researcher", "coder", "designer", "reviewer"];
pub const DEFAULT_MAX_DEPTH: u32 = 3;
pub const DEFAULT_PRIMARY_AGENT: &str = "main";

#[derive(Debug, Clone)]
pub struct Timeouts {
    /// TCP/TLS/upgrade of the gateway socket.
    pub connect: Duration,
    /// Each handshake wait step.
    pub handshake_step: Duration,
    /// Whole request, from connect until `end`.
    pub request_deadline: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            handshake_step: Duration::from_secs(10),
            request_deadline: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    /// Bearer secret web clients must present.
    pub secret: String,
    pub target: GatewayTarget,
    pub identity: ClientIdentity,
    pub collaborators: Vec<String>,
    pub responder_templates: Vec<(String, String)>,
    pub primary_agent: String,
    pub max_depth: u32,
    pub thread_delay: Duration,
    pub timeouts: Timeouts,
    pub sse_buffer: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7600,
            secret: String::new(),
            target: GatewayTarget::default(),
            identity: ClientIdentity::default(),
            collaborators: DEFAULT_COLLABORATORS.iter().map(|id| id.to_string()).collect(),
            responder_templates: Vec::new(),
            primary_agent: DEFAULT_PRIMARY_AGENT.to_string(),
            max_depth: DEFAULT_MAX_DEPTH,
            thread_delay: Duration::ZERO,
            timeouts: Timeouts::default(),
            sse_buffer: 64,
        }
    }
}

impl BridgeConfig {
    pub fn mention_detector(&self) -> Result<MentionDetector, regex::Error> {
        MentionDetector::new(&self.collaborators)
    }

    pub fn responder(&self) -> Arc<dyn CollaboratorResponder> {
        let responder = self
            .responder_templates
            .iter()
            .fold(TemplateResponder::default(), |responder, (id, template)| {
                responder.with_template(id.clone(), template.clone())
            });
        Arc::new(responder)
    }

    pub fn orchestrator(
        &self,
        responder: Arc<dyn CollaboratorResponder>,
    ) -> Result<ThreadOrchestrator, regex::Error> {
        Ok(ThreadOrchestrator::new(
            self.mention_detector()?,
            responder,
            self.primary_agent.clone(),
            self.max_depth,
        )
        .with_thread_delay(self.thread_delay))
    }
}
