//! Per-token generation loop.
//!
//! Drives one token at a time: feeds pending history to the backend in
//! batches, samples the next token and evaluates termination.
//!
//! States: `Idle -> Priming -> Sampling -> (Sampling | Stopped)`.

use serde::Serialize;

use crate::context::ContextManager;
use crate::engine::{GenerationPolicy, InferenceBackend, SamplerState, SessionError, Token};

/// Upper bound on tokens appended past a natural stop to finish a character.
pub const MAX_MULTIBYTE_EXTENSIONS: usize = 4;

/// Loop state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Priming,
    Sampling,
    Stopped,
}

/// Reason generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Backend produced its end-of-sequence token.
    EndOfSequence,
    /// Token budget exhausted.
    Length,
    /// A configured stop string matched.
    StopString,
    /// The consumer went away or the request was cancelled.
    Cancelled,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EndOfSequence => "end_of_sequence",
            Self::Length => "length",
            Self::StopString => "stop_string",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One sampled token and whether it ended the generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampledToken {
    pub token: Token,
    pub stop: Option<StopReason>,
}

/// Generation loop bookkeeping for one request.
#[derive(Debug)]
pub struct GenerationLoop {
    state: LoopState,
    remaining: Option<usize>,
    tokens_predicted: usize,
    stop_reason: Option<StopReason>,
    deferred: Option<StopReason>,
    extensions: usize,
    failed: bool,
}

impl Default for GenerationLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationLoop {
    pub fn new() -> Self {
        Self {
            state: LoopState::Idle,
            remaining: None,
            tokens_predicted: 0,
            stop_reason: None,
            deferred: None,
            extensions: 0,
            failed: false,
        }
    }

    /// Arm the loop for a new request. `budget` None means unbounded.
    pub fn begin(&mut self, budget: Option<usize>) {
        *self = Self::new();
        self.remaining = budget;
        self.state = LoopState::Priming;
    }

    /// Return to `Idle`, dropping all per-request counters.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Produce exactly one token.
    ///
    /// An evaluation failure stops the loop for good and no token is
    /// produced for that step.
    pub fn next_token<B>(
        &mut self,
        ctx: &mut ContextManager,
        backend: &mut B,
        policy: &GenerationPolicy,
        sampler: &mut SamplerState,
    ) -> Result<SampledToken, SessionError>
    where
        B: InferenceBackend + ?Sized,
    {
        if matches!(self.state, LoopState::Idle | LoopState::Stopped) {
            return Err(SessionError::NoActiveRequest);
        }

        if let Some(dropped) = ctx.evict_if_full() {
            tracing::debug!(dropped, n_keep = ctx.n_keep(), "context full, evicted middle of history");
        }

        if !ctx.is_primed() {
            self.state = LoopState::Priming;
        }
        while let Some((batch, n_past)) = ctx.next_batch() {
            let n_eval = batch.len();
            if let Err(e) = backend.evaluate(batch, n_past) {
                tracing::error!(n_past, n_eval, error = %e, "failed to eval");
                self.failed = true;
                self.state = LoopState::Stopped;
                return Err(SessionError::EvaluationFailure(e.to_string()));
            }
            ctx.advance(n_eval);
        }
        self.state = LoopState::Sampling;

        let recent = ctx.recent_window(policy.repeat_last_n);
        let token = backend.sample_next(policy, recent, sampler);
        ctx.push(token);
        self.tokens_predicted += 1;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }

        let stop = if token == backend.eos_token() {
            Some(StopReason::EndOfSequence)
        } else if let Some(deferred) = self.deferred.take() {
            Some(deferred)
        } else if self.remaining == Some(0) {
            Some(StopReason::Length)
        } else {
            None
        };
        if let Some(reason) = stop {
            self.stop(reason);
        }

        tracing::debug!(
            token,
            n_past = ctx.n_past(),
            remaining = ?self.remaining,
            tokens_predicted = self.tokens_predicted,
            stop = ?stop,
            "next token"
        );

        Ok(SampledToken { token, stop })
    }

    /// Stop the loop with `reason`.
    pub fn stop(&mut self, reason: StopReason) {
        self.deferred = None;
        self.stop_reason = Some(reason);
        self.state = LoopState::Stopped;
    }

    /// Re-open a stopped loop for one more token so a multi-byte character
    /// can complete. The budget grows by one and the original stop reason
    /// is reported once that token has been produced.
    ///
    /// Returns false when the loop failed or is not stopped. Cancelled and
    /// end-of-sequence stops are final, and at most
    /// [`MAX_MULTIBYTE_EXTENSIONS`] extra tokens are granted per request.
    pub fn extend_for_multibyte(&mut self) -> bool {
        if self.state != LoopState::Stopped
            || self.failed
            || self.extensions >= MAX_MULTIBYTE_EXTENSIONS
        {
            return false;
        }
        if matches!(
            self.stop_reason,
            Some(StopReason::Cancelled | StopReason::EndOfSequence)
        ) {
            return false;
        }
        self.deferred = self.stop_reason.take();
        self.remaining = self.remaining.map(|r| r + 1);
        self.extensions += 1;
        self.state = LoopState::Sampling;
        true
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn is_stopped(&self) -> bool {
        self.state == LoopState::Stopped
    }

    pub fn has_next_token(&self) -> bool {
        matches!(self.state, LoopState::Priming | LoopState::Sampling)
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    pub fn tokens_predicted(&self) -> usize {
        self.tokens_predicted
    }

    pub fn remaining(&self) -> Option<usize> {
        self.remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BackendError;

    /// Emits tokens from a script and can fail evaluation on demand.
    struct Scripted {
        script: Vec<Token>,
        cursor: usize,
        eos: Token,
        fail_at_call: Option<usize>,
        eval_calls: Vec<(Vec<Token>, usize)>,
    }

    impl Scripted {
        fn new(script: Vec<Token>) -> Self {
            Self { script, cursor: 0, eos: 2, fail_at_call: None, eval_calls: Vec::new() }
        }
    }

    impl InferenceBackend for Scripted {
        fn tokenize(&self, text: &str, _add_bos: bool) -> Result<Vec<Token>, BackendError> {
            Ok(text.bytes().map(Token::from).collect())
        }

        fn evaluate(&mut self, tokens: &[Token], n_past: usize) -> Result<(), BackendError> {
            if self.fail_at_call == Some(self.eval_calls.len()) {
                return Err(BackendError::Evaluation { n_past, reason: "boom".into() });
            }
            self.eval_calls.push((tokens.to_vec(), n_past));
            Ok(())
        }

        fn sample_next(&mut self, _: &GenerationPolicy, _: &[Token], _: &mut SamplerState) -> Token {
            let token = self.script[self.cursor % self.script.len()];
            self.cursor += 1;
            token
        }

        fn decode(&self, token: Token) -> Vec<u8> {
            vec![token as u8]
        }

        fn vocab_size(&self) -> usize {
            256
        }

        fn eos_token(&self) -> Token {
            self.eos
        }
    }

    fn primed(prompt_len: u32) -> ContextManager {
        let mut ctx = ContextManager::new(64, 4);
        ctx.prepare((10..10 + prompt_len).collect(), -1).unwrap();
        ctx
    }

    #[test]
    fn idle_loop_refuses_to_step() {
        let mut gen = GenerationLoop::new();
        let mut ctx = primed(3);
        let mut backend = Scripted::new(vec![65]);
        let mut sampler = SamplerState::new(0, 5.0);
        let result = gen.next_token(&mut ctx, &mut backend, &GenerationPolicy::default(), &mut sampler);
        assert_eq!(result, Err(SessionError::NoActiveRequest));
    }

    #[test]
    fn primes_in_batches_then_samples() {
        let mut gen = GenerationLoop::new();
        gen.begin(None);
        let mut ctx = primed(10);
        let mut backend = Scripted::new(vec![65]);
        let mut sampler = SamplerState::new(0, 5.0);
        let out = gen
            .next_token(&mut ctx, &mut backend, &GenerationPolicy::default(), &mut sampler)
            .unwrap();
        assert_eq!(out, SampledToken { token: 65, stop: None });
        let offsets: Vec<usize> = backend.eval_calls.iter().map(|(_, p)| *p).collect();
        assert_eq!(offsets, vec![0, 4, 8]);
        assert_eq!(gen.state(), LoopState::Sampling);

        // The sampled token is evaluated on the next step.
        gen.next_token(&mut ctx, &mut backend, &GenerationPolicy::default(), &mut sampler)
            .unwrap();
        assert_eq!(backend.eval_calls.last().unwrap(), &(vec![65], 10));
    }

    #[test]
    fn stops_on_length_budget() {
        let mut gen = GenerationLoop::new();
        gen.begin(Some(2));
        let mut ctx = primed(3);
        let mut backend = Scripted::new(vec![65]);
        let mut sampler = SamplerState::new(0, 5.0);
        let policy = GenerationPolicy::default();
        assert_eq!(gen.next_token(&mut ctx, &mut backend, &policy, &mut sampler).unwrap().stop, None);
        let last = gen.next_token(&mut ctx, &mut backend, &policy, &mut sampler).unwrap();
        assert_eq!(last.stop, Some(StopReason::Length));
        assert!(gen.is_stopped());
        assert_eq!(gen.tokens_predicted(), 2);
        assert_eq!(
            gen.next_token(&mut ctx, &mut backend, &policy, &mut sampler),
            Err(SessionError::NoActiveRequest)
        );
    }

    #[test]
    fn end_of_sequence_wins_over_length() {
        let mut gen = GenerationLoop::new();
        gen.begin(Some(1));
        let mut ctx = primed(3);
        let mut backend = Scripted::new(vec![2]);
        let mut sampler = SamplerState::new(0, 5.0);
        let out = gen
            .next_token(&mut ctx, &mut backend, &GenerationPolicy::default(), &mut sampler)
            .unwrap();
        assert_eq!(out, SampledToken { token: 2, stop: Some(StopReason::EndOfSequence) });
    }

    #[test]
    fn evaluation_failure_is_terminal() {
        let mut gen = GenerationLoop::new();
        gen.begin(None);
        let mut ctx = primed(10);
        let mut backend = Scripted::new(vec![65]);
        backend.fail_at_call = Some(1);
        let mut sampler = SamplerState::new(0, 5.0);
        let err = gen
            .next_token(&mut ctx, &mut backend, &GenerationPolicy::default(), &mut sampler)
            .unwrap_err();
        assert!(matches!(err, SessionError::EvaluationFailure(_)));
        assert!(gen.is_stopped());
        assert_eq!(backend.cursor, 0, "no token sampled after failure");
        assert!(!gen.extend_for_multibyte());
    }

    #[test]
    fn extension_produces_one_token_and_keeps_reason() {
        let mut gen = GenerationLoop::new();
        gen.begin(Some(1));
        let mut ctx = primed(3);
        let mut backend = Scripted::new(vec![65]);
        let mut sampler = SamplerState::new(0, 5.0);
        let policy = GenerationPolicy::default();
        gen.next_token(&mut ctx, &mut backend, &policy, &mut sampler).unwrap();
        assert_eq!(gen.stop_reason(), Some(StopReason::Length));

        assert!(gen.extend_for_multibyte());
        assert_eq!(gen.remaining(), Some(1));
        let out = gen.next_token(&mut ctx, &mut backend, &policy, &mut sampler).unwrap();
        assert_eq!(out.stop, Some(StopReason::Length));
        assert_eq!(gen.tokens_predicted(), 2);
    }

    #[test]
    fn extensions_are_capped() {
        let mut gen = GenerationLoop::new();
        gen.begin(Some(1));
        let mut ctx = primed(3);
        let mut backend = Scripted::new(vec![65]);
        let mut sampler = SamplerState::new(0, 5.0);
        let policy = GenerationPolicy::default();
        gen.next_token(&mut ctx, &mut backend, &policy, &mut sampler).unwrap();
        for _ in 0..MAX_MULTIBYTE_EXTENSIONS {
            assert!(gen.extend_for_multibyte());
            gen.next_token(&mut ctx, &mut backend, &policy, &mut sampler).unwrap();
        }
        assert!(!gen.extend_for_multibyte());
    }

    #[test]
    fn cancelled_loop_is_never_extended() {
        let mut gen = GenerationLoop::new();
        gen.begin(None);
        gen.stop(StopReason::Cancelled);
        assert!(!gen.extend_for_multibyte());
    }

    #[test]
    fn end_of_sequence_is_never_extended() {
        let mut gen = GenerationLoop::new();
        gen.begin(None);
        let mut ctx = primed(3);
        let mut backend = Scripted::new(vec![2]);
        let mut sampler = SamplerState::new(0, 5.0);
        gen.next_token(&mut ctx, &mut backend, &GenerationPolicy::default(), &mut sampler)
            .unwrap();
        assert!(!gen.extend_for_multibyte());
        assert_eq!(gen.stop_reason(), Some(StopReason::EndOfSequence));
    }
}
