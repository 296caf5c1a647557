//! Output types produced by a session.

use std::borrow::Cow;

use serde::Serialize;

use crate::engine::{GenerationSettings, Token};
use crate::generation::StopReason;

/// Result of advancing the session by one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    /// Token sampled in this step.
    pub token: Token,
    /// Bytes released to the caller in this step.
    pub content: Vec<u8>,
    /// True once the generation has stopped.
    pub is_final: bool,
    pub stop_reason: Option<StopReason>,
    /// The piece started or continued an incomplete character and nothing
    /// was released.
    pub withheld: bool,
}

impl StepOutput {
    pub(crate) fn withheld(token: Token) -> Self {
        Self {
            token,
            content: Vec::new(),
            is_final: false,
            stop_reason: None,
            withheld: true,
        }
    }

    /// Released bytes as text. Invalid sequences are replaced.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }
}

/// Metadata attached to a finished generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionSummary {
    pub model: String,
    pub tokens_predicted: usize,
    pub generation_settings: GenerationSettings,
    pub prompt: String,
    pub stopping_word: String,
    pub stop_reason: Option<StopReason>,
}

/// Non-streaming completion result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    pub content: String,
    pub stop: bool,
    #[serde(flatten)]
    pub summary: CompletionSummary,
}

/// One streamed chunk. The final chunk carries the summary and the full
/// generated text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamChunk {
    pub content: String,
    pub stop: bool,
    #[serde(flatten)]
    pub summary: Option<CompletionSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_text: Option<String>,
}

impl StreamChunk {
    /// Intermediate chunk.
    pub fn partial(content: String) -> Self {
        Self {
            content,
            stop: false,
            summary: None,
            generated_text: None,
        }
    }

    /// Closing chunk with the completion summary.
    pub fn last(content: String, summary: CompletionSummary, generated_text: String) -> Self {
        Self {
            content,
            stop: true,
            summary: Some(summary),
            generated_text: Some(generated_text),
        }
    }

    pub fn is_final(&self) -> bool {
        self.stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::GenerationPolicy;

    fn summary() -> CompletionSummary {
        CompletionSummary {
            model: "tiny".into(),
            tokens_predicted: 3,
            generation_settings: GenerationSettings::new(&GenerationPolicy::default(), &[], 0, true),
            prompt: "Hello".into(),
            stopping_word: String::new(),
            stop_reason: Some(StopReason::Length),
        }
    }

    #[test]
    fn partial_chunk_has_no_metadata() {
        let value = serde_json::to_value(StreamChunk::partial("ab".into())).unwrap();
        assert_eq!(value, serde_json::json!({"content": "ab", "stop": false}));
    }

    #[test]
    fn last_chunk_flattens_summary() {
        let chunk = StreamChunk::last("c".into(), summary(), "abc".into());
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["stop"], true);
        assert_eq!(value["tokens_predicted"], 3);
        assert_eq!(value["stop_reason"], "length");
        assert_eq!(value["generated_text"], "abc");
        assert!(value["generation_settings"].is_object());
    }

    #[test]
    fn withheld_step_is_empty() {
        let out = StepOutput::withheld(7);
        assert!(out.withheld);
        assert!(!out.is_final);
        assert_eq!(out.text(), "");
    }
}
