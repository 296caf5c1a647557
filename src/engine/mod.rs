//! Inference engine seam for GG-SESSION.
//!
//! The session does not implement the forward pass, tokenizer or sampling
//! algorithms. It drives them through the [`InferenceBackend`] trait, which
//! also lets tests substitute deterministic stand-ins.

pub mod error;
pub mod policy;
pub mod sampler;

pub use error::{BackendError, SessionError};
pub use policy::{GenerationPolicy, GenerationSettings, MirostatMode};
pub use sampler::SamplerState;

/// Opaque vocabulary index.
pub type Token = u32;

/// Token-level inference engine plus tokenizer adapter.
///
/// A backend is session-exclusive for the duration of a request: the session
/// holds it by value (or `&mut`) and never calls it concurrently.
pub trait InferenceBackend {
    /// Convert text to tokens, optionally prefixed with the leading marker.
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>, BackendError>;

    /// Advance engine state over `tokens`, placed at positions
    /// `n_past..n_past + tokens.len()`.
    fn evaluate(&mut self, tokens: &[Token], n_past: usize) -> Result<(), BackendError>;

    /// Sample one token from the distribution produced by the last
    /// evaluation. `recent` is the repetition-penalty lookback window.
    fn sample_next(
        &mut self,
        policy: &GenerationPolicy,
        recent: &[Token],
        state: &mut SamplerState,
    ) -> Token;

    /// Raw bytes of a token. May be an incomplete UTF-8 sequence.
    fn decode(&self, token: Token) -> Vec<u8>;

    fn vocab_size(&self) -> usize;

    fn eos_token(&self) -> Token;

    /// Embedding vector of the most recent evaluation.
    fn embedding(&self) -> Result<Vec<f32>, BackendError> {
        Err(BackendError::EmbeddingUnsupported(
            "backend does not expose embeddings".to_string(),
        ))
    }

    /// Observability hook: reset engine timing counters.
    fn reset_timings(&mut self) {}

    /// Observability hook: report engine timing counters.
    fn print_timings(&self) {}
}

impl<B: InferenceBackend + ?Sized> InferenceBackend for Box<B> {
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>, BackendError> {
        (**self).tokenize(text, add_bos)
    }

    fn evaluate(&mut self, tokens: &[Token], n_past: usize) -> Result<(), BackendError> {
        (**self).evaluate(tokens, n_past)
    }

    fn sample_next(
        &mut self,
        policy: &GenerationPolicy,
        recent: &[Token],
        state: &mut SamplerState,
    ) -> Token {
        (**self).sample_next(policy, recent, state)
    }

    fn decode(&self, token: Token) -> Vec<u8> {
        (**self).decode(token)
    }

    fn vocab_size(&self) -> usize {
        (**self).vocab_size()
    }

    fn eos_token(&self) -> Token {
        (**self).eos_token()
    }

    fn embedding(&self) -> Result<Vec<f32>, BackendError> {
        (**self).embedding()
    }

    fn reset_timings(&mut self) {
        (**self).reset_timings()
    }

    fn print_timings(&self) {
        (**self).print_timings()
    }
}
