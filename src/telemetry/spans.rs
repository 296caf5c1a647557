//! Completion spans.

use tracing::{info_span, Span};

use crate::generation::StopReason;

/// Record an operation outcome into a span.
pub trait SpanExt {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;

    /// Record the generation counters. A missing reason is recorded as
    /// `none`.
    fn record_finish(&self, tokens_predicted: usize, stop_reason: Option<StopReason>);
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }

    fn record_finish(&self, tokens_predicted: usize, stop_reason: Option<StopReason>) {
        self.record("tokens_predicted", tokens_predicted as u64);
        self.record("stop_reason", stop_reason.map_or("none", |r| r.as_str()));
    }
}

/// Factory for the span covering one completion request.
pub struct CompletionSpan;

impl CompletionSpan {
    /// `status`, `tokens_predicted` and `stop_reason` are filled in when the
    /// generation finishes.
    pub fn new(session_id: &str, model: &str) -> Span {
        info_span!(
            "completion",
            session_id = %session_id,
            model = %model,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
            tokens_predicted = tracing::field::Empty,
            stop_reason = tracing::field::Empty,
        )
    }
}
