use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use gateway_bridge_error::BridgeError;

pub const MESSAGE_PLACEHOLDER: &str = "{message}";

pub type ResponderFuture<'a> = Pin<Box<dyn Future<Output = Result<String, BridgeError>> + Send + 'a>>;

/// Produces a collaborator's reply to a message directed at it.
///
/// The orchestrator only sees this trait, so a remote-agent backed
/// implementation can replace the templates without touching the loop.
pub trait CollaboratorResponder: Send + Sync + 'static {
    fn respond<'a>(&'a self, collaborator: &'a str, message: &'a str) -> ResponderFuture<'a>;
}

/// Replies from fixed per-collaborator templates containing `{message}`.
#[derive(Debug, Clone)]
pub struct TemplateResponder {
    templates: HashMap<String, String>,
    fallback: String,
}

impl Default for TemplateResponder {
    fn default() -> Self {
        let templates = [
            (
                "researcher",
                "I dug into \"{message}\". The sources I checked agree on the main points; I'd start from the most recent primary material and verify the numbers before relying on them.",
            ),
            (
                "coder",
                "On it: \"{message}\". I'd make the change behind a small, well-tested function, keep the diff focused and add a regression test for the case you described.",
            ),
            (
                "designer",
                "Re \"{message}\": I'd simplify the layout, keep one primary action per screen and make sure contrast and spacing hold up on mobile.",
            ),
            (
                "reviewer",
                "Reviewed \"{message}\". Looks reasonable overall; watch the error paths and edge cases, and make sure the tests cover the failure modes.",
            ),
        ]
        .into_iter()
        .map(|(id, template)| (id.to_string(), template.to_string()))
        .collect();

        Self {
            templates,
            fallback: "Acknowledged: \"{message}\".".to_string(),
        }
    }
}

impl TemplateResponder {
    /// Replaces or adds the template for one collaborator.
    pub fn with_template(mut self, collaborator: impl Into<String>, template: impl Into<String>) -> Self {
        self.templates.insert(collaborator.into(), template.into());
        self
    }

    pub fn render(&self, collaborator: &str, message: &str) -> String {
        self.templates
            .get(collaborator)
            .unwrap_or(&self.fallback)
            .replace(MESSAGE_PLACEHOLDER, message)
    }
}

impl CollaboratorResponder for TemplateResponder {
    fn respond<'a>(&'a self, collaborator: &'a str, message: &'a str) -> ResponderFuture<'a> {
        Box::pin(async move { Ok(self.render(collaborator, message)) })
    }
}
