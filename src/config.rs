//! Session configuration loading from environment variables.
//!
//! All configuration values are loaded from `GG_SESSION_*` environment
//! variables with sensible defaults. Invalid values fall back to defaults
//! without crashing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `GG_SESSION_N_CTX` | 512 | Context window (tokens) |
//! | `GG_SESSION_N_BATCH` | 512 | Evaluation batch size (tokens) |
//! | `GG_SESSION_MODEL_ALIAS` | unknown | Model name echoed in completions |
//! | `GG_SESSION_STREAM_BUFFER` | 16 | Chunk channel capacity |
//! | `GG_SESSION_EMBEDDING` | false | Embedding mode (completions refused) |
//! | `GG_SESSION_LOG_LEVEL` | info | Tracing filter directive |
//! | `GG_SESSION_LOG_FORMAT` | json | `json` or `pretty` |

use serde::Serialize;

use crate::telemetry::{LogConfig, LogFormat};

/// Smallest usable context window.
pub const MIN_N_CTX: usize = 8;

/// Configuration shared by every request served by one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum tokens held in the history.
    pub n_ctx: usize,
    /// Maximum tokens per evaluation call.
    pub n_batch: usize,
    /// Model name echoed back with completions.
    pub model_alias: String,
    /// Capacity of the chunk channel used by `spawn_stream`.
    pub stream_buffer: usize,
    /// Serve embeddings instead of completions.
    pub embedding: bool,
    pub log: LogConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            n_ctx: 512,
            n_batch: 512,
            model_alias: "unknown".to_string(),
            stream_buffer: 16,
            embedding: false,
            log: LogConfig::default(),
        }
    }
}

/// Effective configuration summary (serializable).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveConfig {
    pub n_ctx: usize,
    pub n_batch: usize,
    pub model_alias: String,
    pub stream_buffer: usize,
    pub embedding: bool,
    pub log_level: String,
    pub log_format: String,
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a boolean env var (`1`/`true`/`yes`, case-insensitive).
fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn parse_log_format(key: &str) -> LogFormat {
    match std::env::var(key).as_deref() {
        Ok("pretty") => LogFormat::Pretty,
        _ => LogFormat::Json,
    }
}

/// Load the session configuration from environment variables.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load() -> SessionConfig {
    let n_ctx = parse_usize("GG_SESSION_N_CTX", 512).clamp(MIN_N_CTX, 1_000_000);
    let n_batch = parse_usize("GG_SESSION_N_BATCH", 512).clamp(1, n_ctx);
    let model_alias = std::env::var("GG_SESSION_MODEL_ALIAS")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    let stream_buffer = parse_usize("GG_SESSION_STREAM_BUFFER", 16).max(1);
    let level = std::env::var("GG_SESSION_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    SessionConfig {
        n_ctx,
        n_batch,
        model_alias,
        stream_buffer,
        embedding: parse_bool("GG_SESSION_EMBEDDING", false),
        log: LogConfig {
            format: parse_log_format("GG_SESSION_LOG_FORMAT"),
            level,
            output_path: None,
        },
    }
}

impl SessionConfig {
    /// Return a serializable summary of all effective values.
    pub fn effective(&self) -> EffectiveConfig {
        EffectiveConfig {
            n_ctx: self.n_ctx,
            n_batch: self.n_batch,
            model_alias: self.model_alias.clone(),
            stream_buffer: self.stream_buffer,
            embedding: self.embedding,
            log_level: self.log.level.clone(),
            log_format: match self.log.format {
                LogFormat::Json => "json".to_string(),
                LogFormat::Pretty => "pretty".to_string(),
            },
        }
    }
}
