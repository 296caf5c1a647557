//! GG-SESSION
//!
//! Incremental text-generation session controller. Drives a token-level
//! inference engine one token at a time and streams text back without
//! splitting multi-byte characters or leaking stop strings.
//!
//! # Components
//!
//! - **Context**: token history, window truncation and prefix reuse
//! - **Generation**: priming and sampling state machine with stop reasons
//! - **Stop**: full and partial stop-string matching
//! - **Stream**: decides which generated bytes are safe to release
//! - **Session**: per-request lifecycle (`rewind`, `begin`, `step`)
//!
//! The engine itself (forward pass, tokenizer, samplers) sits behind the
//! [`InferenceBackend`] trait.

pub mod config;
pub mod context;
pub mod engine;
pub mod generation;
pub mod session;
pub mod stop;
pub mod stream;
pub mod telemetry;

pub use config::SessionConfig;
pub use engine::{
    BackendError, GenerationPolicy, GenerationSettings, InferenceBackend, SamplerState,
    SessionError, Token,
};
pub use generation::{LoopState, StopReason};
pub use session::{
    spawn_stream, ChunkStream, Completion, CompletionRequest, CompletionStream,
    CompletionSummary, Session, StepOutput, StreamChunk,
};
pub use stop::StopSet;
