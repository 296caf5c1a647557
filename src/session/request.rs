//! Completion request as received from the request layer.

use serde::Deserialize;

use crate::engine::{GenerationPolicy, SessionError};

/// One completion request. Policy fields sit at the top level of the body.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub policy: GenerationPolicy,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Default::default()
        }
    }

    /// The prompt, rejecting a missing or empty one.
    pub fn prompt(&self) -> Result<&str, SessionError> {
        match self.prompt.as_deref() {
            Some(p) if !p.is_empty() => Ok(p),
            _ => Err(SessionError::InvalidPromptEmpty),
        }
    }
}
