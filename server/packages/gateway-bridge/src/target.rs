use thiserror::Error;

pub const TARGET_PLACEHOLDER: &str = "{target}";
pub const DEFAULT_URL_TEMPLATE: &str = "ws://{target}:18789";
const MAX_TARGET_LEN: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("target identifier is empty")]
    Empty,
    #[error("target identifier exceeds 128 characters")]
    TooLong,
    #[error("target identifier contains invalid character {0:?}")]
    InvalidCharacter(char),
    #[error("gateway url template must contain {{target}}")]
    MissingPlaceholder,
    #[error("gateway url template must use ws:// or wss://: {0}")]
    UnsupportedScheme(String),
}

/// Maps a validated target identifier onto a gateway WebSocket URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayTarget {
    template: String,
}

impl Default for GatewayTarget {
    fn default() -> Self {
        Self {
            template: DEFAULT_URL_TEMPLATE.to_string(),
        }
    }
}

impl GatewayTarget {
    pub fn from_template(template: impl Into<String>) -> Result<Self, TargetError> {
        let template = template.into();
        if !template.contains(TARGET_PLACEHOLDER) {
            return Err(TargetError::MissingPlaceholder);
        }
        if !(template.starts_with("ws://") || template.starts_with("wss://")) {
            return Err(TargetError::UnsupportedScheme(template));
        }
        Ok(Self { template })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn resolve(&self, target: &str) -> Result<String, TargetError> {
        validate_target(target)?;
        Ok(self.template.replace(TARGET_PLACEHOLDER, target))
    }
}

/// Accepts `[A-Za-z0-9._-]{1,128}`; anything else could alter the URL host.
pub fn validate_target(target: &str) -> Result<(), TargetError> {
    if target.is_empty() {
        return Err(TargetError::Empty);
    }
    if target.len() > MAX_TARGET_LEN {
        return Err(TargetError::TooLong);
    }
    if let Some(bad) = target
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(TargetError::InvalidCharacter(bad));
    }
    Ok(())
}
