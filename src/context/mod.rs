//! Context window management.
//!
//! Owns the token history, the evaluation offset (`n_past`) and the
//! repetition-lookback buffer. Truncation keeps an anchor prefix of
//! `n_keep` tokens plus the most recent half of the remaining window.

use std::collections::VecDeque;

use crate::engine::{SessionError, Token};

/// Room always left for generation when clamping the keep count.
pub const GENERATION_HEADROOM: usize = 4;

/// Outcome of preparing a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreparedPrompt {
    /// Resolved anchor length.
    pub n_keep: usize,
    /// Tokens reused from the previously evaluated history.
    pub reused: usize,
    /// Whether the prompt was cut to fit the window.
    pub truncated: bool,
    /// Tokens in the history after preparation.
    pub history_len: usize,
}

/// Resolve the anchor length: unset (negative) means the whole prompt, then
/// clamp so at least [`GENERATION_HEADROOM`] slots stay free.
pub fn resolve_keep(requested: i32, prompt_len: usize, n_ctx: usize) -> usize {
    let keep = usize::try_from(requested).unwrap_or(prompt_len);
    keep.min(n_ctx.saturating_sub(GENERATION_HEADROOM))
}

/// Keep the first `n_keep` tokens and the last `(n_ctx - n_keep) / 2`.
pub fn truncate_window(tokens: &[Token], n_ctx: usize, n_keep: usize) -> Vec<Token> {
    let n_keep = n_keep.min(tokens.len());
    let n_left = n_ctx.saturating_sub(n_keep) / 2;
    let tail_start = tokens.len().saturating_sub(n_left).max(n_keep);
    let mut window = Vec::with_capacity(n_keep + n_left);
    window.extend_from_slice(&tokens[..n_keep]);
    window.extend_from_slice(&tokens[tail_start..]);
    window
}

/// Length of the longest common prefix of two token sequences.
pub fn common_prefix_len(a: &[Token], b: &[Token]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Token history and evaluation cursor for one session.
#[derive(Debug, Clone)]
pub struct ContextManager {
    n_ctx: usize,
    n_batch: usize,
    n_keep: usize,
    history: Vec<Token>,
    n_past: usize,
    recent: VecDeque<Token>,
}

impl ContextManager {
    pub fn new(n_ctx: usize, n_batch: usize) -> Self {
        Self {
            n_ctx,
            n_batch: n_batch.clamp(1, n_ctx.max(1)),
            n_keep: 0,
            history: Vec::with_capacity(n_ctx),
            n_past: 0,
            recent: VecDeque::with_capacity(n_ctx),
        }
    }

    /// Install a new prompt.
    ///
    /// Previously evaluated tokens shared with the new prompt are reused; at
    /// least one token is always left pending so the engine produces a fresh
    /// distribution.
    pub fn prepare(
        &mut self,
        prompt_tokens: Vec<Token>,
        requested_keep: i32,
    ) -> Result<PreparedPrompt, SessionError> {
        if prompt_tokens.is_empty() {
            return Err(SessionError::InvalidPromptEmpty);
        }
        let prompt_len = prompt_tokens.len();
        self.n_keep = resolve_keep(requested_keep, prompt_len, self.n_ctx);

        self.recent.clear();
        let lookback_start = prompt_tokens.len().saturating_sub(self.n_ctx);
        self.recent.extend(&prompt_tokens[lookback_start..]);

        let truncated = prompt_tokens.len() >= self.n_ctx;
        let tokens = if truncated {
            truncate_window(&prompt_tokens, self.n_ctx, self.n_keep)
        } else {
            prompt_tokens
        };
        if tokens.is_empty() || tokens.len() > self.n_ctx {
            return Err(SessionError::ContextOverflow {
                len: prompt_len,
                max: self.n_ctx,
            });
        }

        // Only the evaluated part of the old history is backed by engine state.
        let evaluated = &self.history[..self.n_past.min(self.history.len())];
        let mut reused = common_prefix_len(evaluated, &tokens);
        if reused == tokens.len() {
            reused -= 1;
        }
        self.history = tokens;
        self.n_past = reused;

        Ok(PreparedPrompt {
            n_keep: self.n_keep,
            reused,
            truncated,
            history_len: self.history.len(),
        })
    }

    /// Evict the middle of the history once it fills the window.
    ///
    /// Returns the number of tokens dropped. Evicted tokens are gone; the
    /// evaluation offset restarts right after the anchor.
    pub fn evict_if_full(&mut self) -> Option<usize> {
        if self.history.len() < self.n_ctx {
            return None;
        }
        let before = self.history.len();
        self.history = truncate_window(&self.history, self.n_ctx, self.n_keep);
        self.n_past = self.n_keep.min(self.history.len());
        Some(before - self.history.len())
    }

    /// Next slice of pending tokens to evaluate, with its position offset.
    pub fn next_batch(&self) -> Option<(&[Token], usize)> {
        if self.n_past >= self.history.len() {
            return None;
        }
        let end = (self.n_past + self.n_batch).min(self.history.len());
        Some((&self.history[self.n_past..end], self.n_past))
    }

    /// Record that `count` pending tokens were evaluated.
    pub fn advance(&mut self, count: usize) {
        self.n_past = (self.n_past + count).min(self.history.len());
    }

    /// Append a sampled token to the history and the lookback buffer.
    pub fn push(&mut self, token: Token) {
        self.history.push(token);
        if self.recent.len() == self.n_ctx {
            self.recent.pop_front();
        }
        self.recent.push_back(token);
    }

    /// Most recent `min(buffered, lookback, n_ctx)` tokens for penalties.
    /// A negative lookback means the whole context.
    pub fn recent_window(&mut self, lookback: i32) -> &[Token] {
        let lookback = usize::try_from(lookback).unwrap_or(self.n_ctx);
        let n = self.recent.len().min(lookback).min(self.n_ctx);
        let recent = self.recent.make_contiguous();
        &recent[recent.len() - n..]
    }

    pub fn history(&self) -> &[Token] {
        &self.history
    }

    pub fn n_past(&self) -> usize {
        self.n_past
    }

    pub fn n_keep(&self) -> usize {
        self.n_keep
    }

    pub fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    pub fn n_batch(&self) -> usize {
        self.n_batch
    }

    pub fn is_primed(&self) -> bool {
        self.n_past >= self.history.len()
    }

    /// Forget all engine-side state, e.g. after the backend was reset.
    pub fn clear(&mut self) {
        self.history.clear();
        self.recent.clear();
        self.n_past = 0;
        self.n_keep = 0;
    }
}
