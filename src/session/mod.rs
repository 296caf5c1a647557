//! Completion session: one request at a time over a session-exclusive backend.
//!
//! A session owns the backend, the token history and all per-request state.
//! The request layer drives it with [`Session::begin`] followed by repeated
//! [`Session::step`] calls, or uses [`Session::run_to_completion`] and
//! [`Session::stream`] for the common shapes.
//!
//! The token history survives [`Session::rewind`], so a follow-up prompt that
//! shares a prefix with the previous one skips re-evaluating that prefix.

mod output;
mod request;
pub mod stream;

pub use output::{Completion, CompletionSummary, StepOutput, StreamChunk};
pub use request::CompletionRequest;
pub use stream::{spawn_stream, ChunkStream, CompletionStream};

use tokio_util::sync::CancellationToken;
use tracing::Span;
use uuid::Uuid;

use crate::config::{SessionConfig, MIN_N_CTX};
use crate::context::{ContextManager, PreparedPrompt};
use crate::engine::{
    GenerationPolicy, GenerationSettings, InferenceBackend, SamplerState, SessionError, Token,
};
use crate::generation::{GenerationLoop, LoopState, StopReason};
use crate::stop::StopSet;
use crate::stream::StreamAssembler;
use crate::telemetry::{CompletionSpan, SpanExt};

/// Generation session bound to one backend.
pub struct Session<B: InferenceBackend> {
    id: Uuid,
    backend: B,
    config: SessionConfig,
    context: ContextManager,
    generation: GenerationLoop,
    assembler: StreamAssembler,
    stops: StopSet,
    /// Policy as requested, with the seed resolved.
    policy: GenerationPolicy,
    /// Policy handed to the sampler (end-of-sequence bias applied).
    sampling_policy: GenerationPolicy,
    sampler: SamplerState,
    generated: Vec<u8>,
    /// Bytes appended since the last assembly step.
    unscanned: usize,
    stopping_word: String,
    prompt: String,
    stream: bool,
    span: Span,
}

impl<B: InferenceBackend> Session<B> {
    /// The context window is floored at [`MIN_N_CTX`] and the batch size
    /// capped to it, matching what [`crate::config::load`] produces.
    pub fn new(backend: B, mut config: SessionConfig) -> Self {
        config.n_ctx = config.n_ctx.max(MIN_N_CTX);
        config.n_batch = config.n_batch.clamp(1, config.n_ctx);
        let context = ContextManager::new(config.n_ctx, config.n_batch);
        Self {
            id: Uuid::new_v4(),
            backend,
            config,
            context,
            generation: GenerationLoop::new(),
            assembler: StreamAssembler::new(),
            stops: StopSet::default(),
            policy: GenerationPolicy::default(),
            sampling_policy: GenerationPolicy::default(),
            sampler: SamplerState::new(0, GenerationPolicy::default().mirostat_tau),
            generated: Vec::new(),
            unscanned: 0,
            stopping_word: String::new(),
            prompt: String::new(),
            stream: false,
            span: Span::none(),
        }
    }

    /// Reset all per-request state. The token history is kept for prefix
    /// reuse.
    pub fn rewind(&mut self) {
        self.generation.reset();
        self.assembler.reset();
        self.stops = StopSet::default();
        self.generated.clear();
        self.unscanned = 0;
        self.stopping_word.clear();
        self.prompt.clear();
        self.stream = false;
        self.span = Span::none();
        self.backend.reset_timings();
    }

    /// Start a request from its wire form.
    pub fn begin(&mut self, request: CompletionRequest) -> Result<PreparedPrompt, SessionError> {
        let prompt = request.prompt()?.to_string();
        let stops = StopSet::new(request.stop)?;
        let prepared = self.begin_with(request.policy, stops, &prompt)?;
        self.stream = request.stream;
        Ok(prepared)
    }

    /// Start a request: validate the policy, tokenize the prompt and prepare
    /// the context. Nothing is evaluated until the first [`Session::step`].
    pub fn begin_with(
        &mut self,
        mut policy: GenerationPolicy,
        stops: StopSet,
        prompt: &str,
    ) -> Result<PreparedPrompt, SessionError> {
        if self.config.embedding {
            return Err(SessionError::EmbeddingModeEnabled);
        }
        if prompt.is_empty() {
            return Err(SessionError::InvalidPromptEmpty);
        }
        policy.validate(self.backend.vocab_size())?;

        self.rewind();
        policy.seed.get_or_insert_with(rand::random);

        // Leading space matches how the model saw text during training.
        let tokens = self.backend.tokenize(&format!(" {prompt}"), true)?;
        let prepared = self.context.prepare(tokens, policy.n_keep)?;

        self.sampling_policy = policy.effective(self.backend.eos_token());
        self.sampler = SamplerState::for_policy(&policy);
        self.generation.begin(policy.token_budget());
        self.policy = policy;
        self.stops = stops;
        self.prompt = prompt.to_string();
        self.span = CompletionSpan::new(&self.id.to_string(), &self.config.model_alias);

        tracing::info!(
            parent: &self.span,
            n_keep = prepared.n_keep,
            reused = prepared.reused,
            truncated = prepared.truncated,
            history_len = prepared.history_len,
            "prompt prepared"
        );
        Ok(prepared)
    }

    /// Advance by exactly one token and release whatever became safe to
    /// send.
    pub fn step(&mut self) -> Result<StepOutput, SessionError> {
        let span = self.span.clone();
        let _enter = span.enter();

        let sampled = match self.generation.next_token(
            &mut self.context,
            &mut self.backend,
            &self.sampling_policy,
            &mut self.sampler,
        ) {
            Ok(sampled) => sampled,
            Err(e) => {
                if e.is_fatal() {
                    span.record_result::<(), _>(&Err(&e));
                    self.backend.print_timings();
                }
                return Err(e);
            }
        };

        let piece = self.backend.decode(sampled.token);
        self.generated.extend_from_slice(&piece);
        self.unscanned += piece.len();
        if sampled.stop == Some(StopReason::EndOfSequence) {
            self.stopping_word = String::from_utf8_lossy(&piece).into_owned();
        }

        tracing::debug!(
            token = sampled.token,
            piece_len = piece.len(),
            remaining = ?self.generation.remaining(),
            stopping_word = %self.stopping_word,
            "step"
        );

        if self.assembler.track_multibyte(&piece) {
            if !self.generation.is_stopped() || self.generation.extend_for_multibyte() {
                return Ok(StepOutput::withheld(sampled.token));
            }
            tracing::warn!(
                pending = self.assembler.multibyte_pending(),
                "generation ended inside a multi-byte character"
            );
        }

        let window = self.assembler.emit(
            &mut self.generated,
            self.unscanned,
            &self.stops,
            self.generation.is_stopped(),
        );
        self.unscanned = 0;
        if let Some(found) = window.stop {
            self.stopping_word = self.stops.word(found.index).unwrap_or_default().to_string();
            self.generation.stop(StopReason::StopString);
        }

        let is_final = self.generation.is_stopped();
        if is_final {
            self.finish();
        }
        Ok(StepOutput {
            token: sampled.token,
            content: window.content,
            is_final,
            stop_reason: if is_final { self.generation.stop_reason() } else { None },
            withheld: false,
        })
    }

    /// Step until the generation stops and return the whole completion.
    pub fn run_to_completion(&mut self) -> Result<Completion, SessionError> {
        while !self.step()?.is_final {}
        Ok(self.completion())
    }

    /// Stop the current request with [`StopReason::Cancelled`]. No further
    /// tokens are sampled.
    pub fn cancel(&mut self) {
        if !self.generation.has_next_token() {
            return;
        }
        self.generation.stop(StopReason::Cancelled);
        tracing::warn!(
            parent: &self.span,
            tokens_predicted = self.generation.tokens_predicted(),
            "stream closed"
        );
        self.finish();
    }

    /// Lazy stream of chunks for the current request.
    pub fn stream(&mut self, cancel: CancellationToken) -> CompletionStream<'_, B> {
        CompletionStream::new(self, cancel)
    }

    fn finish(&mut self) {
        let stop_reason = self.generation.stop_reason();
        self.span.record_finish(self.generation.tokens_predicted(), stop_reason);
        self.span.record_result::<(), SessionError>(&Ok(()));
        self.backend.print_timings();
        tracing::info!(
            parent: &self.span,
            tokens_predicted = self.generation.tokens_predicted(),
            stop_reason = stop_reason.map_or("none", |r| r.as_str()),
            stopping_word = %self.stopping_word,
            "completion finished"
        );
    }

    /// Tokenize `content` as-is: no leading space, no leading marker.
    pub fn tokenize(&self, content: &str) -> Result<Vec<Token>, SessionError> {
        Ok(self.backend.tokenize(content, false)?)
    }

    /// Evaluate `content` from an empty engine state and return its
    /// embedding. Only available when the session runs in embedding mode.
    ///
    /// The engine state is overwritten, so the token history is cleared and
    /// the next completion re-evaluates its whole prompt.
    pub fn embedding(&mut self, content: &str) -> Result<Vec<f32>, SessionError> {
        if !self.config.embedding {
            return Err(SessionError::EmbeddingUnavailable(
                "session is not in embedding mode".to_string(),
            ));
        }
        let tokens = self.backend.tokenize(&format!(" {content}"), true)?;
        if tokens.len() > self.context.n_ctx() {
            return Err(SessionError::ContextOverflow {
                len: tokens.len(),
                max: self.context.n_ctx(),
            });
        }

        self.rewind();
        self.context.clear();
        for (i, batch) in tokens.chunks(self.context.n_batch()).enumerate() {
            let n_past = i * self.context.n_batch();
            self.backend.evaluate(batch, n_past)?;
        }
        let embedding = self.backend.embedding()?;
        tracing::debug!(tokens = tokens.len(), dims = embedding.len(), "embedding computed");
        Ok(embedding)
    }

    /// Metadata for the current request.
    pub fn summary(&self) -> CompletionSummary {
        CompletionSummary {
            model: self.config.model_alias.clone(),
            tokens_predicted: self.generation.tokens_predicted(),
            generation_settings: self.settings(),
            prompt: self.prompt.clone(),
            stopping_word: self.stopping_word.clone(),
            stop_reason: self.generation.stop_reason(),
        }
    }

    /// Non-streaming view of the generated text so far.
    pub fn completion(&self) -> Completion {
        Completion {
            content: self.generated_text().into_owned(),
            stop: true,
            summary: self.summary(),
        }
    }

    /// Echo of the effective generation settings.
    pub fn settings(&self) -> GenerationSettings {
        GenerationSettings::new(&self.policy, self.stops.words(), self.context.n_keep(), self.stream)
    }

    /// Wire chunk for a step. The final chunk carries the summary.
    pub fn chunk(&self, step: &StepOutput) -> StreamChunk {
        let content = step.text().into_owned();
        if step.is_final {
            StreamChunk::last(content, self.summary(), self.generated_text().into_owned())
        } else {
            StreamChunk::partial(content)
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    pub fn context(&self) -> &ContextManager {
        &self.context
    }

    /// Generated text, with invalid sequences replaced.
    pub fn generated_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.generated)
    }

    pub fn generated_bytes(&self) -> &[u8] {
        &self.generated
    }

    pub fn stopping_word(&self) -> &str {
        &self.stopping_word
    }

    pub fn tokens_predicted(&self) -> usize {
        self.generation.tokens_predicted()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.generation.stop_reason()
    }

    pub fn state(&self) -> LoopState {
        self.generation.state()
    }

    pub fn policy(&self) -> &GenerationPolicy {
        &self.policy
    }
}
