//! Structured logging and tracing spans for completion sessions.

mod logging;
mod spans;

pub use logging::{build_filter, init_logging, LogConfig, LogError, LogFormat};
pub use spans::{CompletionSpan, SpanExt};
