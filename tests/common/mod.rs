//! Deterministic backend shared by the integration tests.
#![allow(dead_code)]

use std::cell::Cell;

use gg_session::engine::{BackendError, GenerationPolicy, InferenceBackend, SamplerState, Token};
use rand::Rng;

pub const BOS: Token = 1;
pub const EOS: Token = 2;
/// First token id mapped to a scripted piece.
pub const PIECE_BASE: Token = 10;
/// Prompt bytes tokenize to `BYTE_BASE + byte`.
pub const BYTE_BASE: Token = 1000;

/// How the backend picks the next token.
#[derive(Debug, Clone)]
pub enum Script {
    /// Replay these tokens in order, wrapping around.
    Cycle(Vec<Token>),
    /// Pick a scripted piece with the sampler's seeded RNG.
    Seeded,
}

/// Byte-level tokenizer plus a scripted sampler.
///
/// Piece `i` decodes to `pieces[i]` and has token id `PIECE_BASE + i`.
#[derive(Debug)]
pub struct ScriptedBackend {
    pub pieces: Vec<Vec<u8>>,
    pub script: Script,
    pub cursor: usize,
    pub eval_calls: Vec<(Vec<Token>, usize)>,
    pub fail_eval_at: Option<usize>,
    pub tokenize_calls: Cell<usize>,
    pub reset_calls: usize,
    pub print_calls: Cell<usize>,
}

impl ScriptedBackend {
    /// Emit `pieces` in order, then start over.
    pub fn cycling(pieces: &[&[u8]]) -> Self {
        let script = (0..pieces.len()).map(|i| PIECE_BASE + i as Token).collect();
        Self::new(pieces, Script::Cycle(script))
    }

    pub fn new(pieces: &[&[u8]], script: Script) -> Self {
        Self {
            pieces: pieces.iter().map(|p| p.to_vec()).collect(),
            script,
            cursor: 0,
            eval_calls: Vec::new(),
            fail_eval_at: None,
            tokenize_calls: Cell::new(0),
            reset_calls: 0,
            print_calls: Cell::new(0),
        }
    }

    pub fn piece_token(index: usize) -> Token {
        PIECE_BASE + index as Token
    }

    pub fn evaluated_tokens(&self) -> usize {
        self.eval_calls.iter().map(|(t, _)| t.len()).sum()
    }
}

impl InferenceBackend for ScriptedBackend {
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>, BackendError> {
        self.tokenize_calls.set(self.tokenize_calls.get() + 1);
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_bos {
            tokens.push(BOS);
        }
        tokens.extend(text.bytes().map(|b| BYTE_BASE + Token::from(b)));
        Ok(tokens)
    }

    fn evaluate(&mut self, tokens: &[Token], n_past: usize) -> Result<(), BackendError> {
        if self.fail_eval_at == Some(self.eval_calls.len()) {
            return Err(BackendError::Evaluation {
                n_past,
                reason: "scripted failure".to_string(),
            });
        }
        self.eval_calls.push((tokens.to_vec(), n_past));
        Ok(())
    }

    fn sample_next(
        &mut self,
        policy: &GenerationPolicy,
        _recent: &[Token],
        state: &mut SamplerState,
    ) -> Token {
        match &self.script {
            Script::Cycle(tokens) => loop {
                let token = tokens[self.cursor % tokens.len()];
                self.cursor += 1;
                let banned = policy
                    .logit_bias
                    .get(&token)
                    .is_some_and(|b| *b == f32::NEG_INFINITY);
                if !banned {
                    return token;
                }
            },
            Script::Seeded => {
                let index = state.rng().gen_range(0..self.pieces.len());
                Self::piece_token(index)
            }
        }
    }

    fn decode(&self, token: Token) -> Vec<u8> {
        if token >= BYTE_BASE {
            return vec![(token - BYTE_BASE) as u8];
        }
        token
            .checked_sub(PIECE_BASE)
            .and_then(|i| self.pieces.get(i as usize))
            .cloned()
            .unwrap_or_default()
    }

    fn vocab_size(&self) -> usize {
        2000
    }

    fn eos_token(&self) -> Token {
        EOS
    }

    /// Evaluated token count followed by the last evaluated token.
    fn embedding(&self) -> Result<Vec<f32>, BackendError> {
        let last = self
            .eval_calls
            .last()
            .and_then(|(tokens, _)| tokens.last())
            .copied()
            .unwrap_or_default();
        Ok(vec![self.evaluated_tokens() as f32, last as f32])
    }

    fn reset_timings(&mut self) {
        self.reset_calls += 1;
    }

    fn print_timings(&self) {
        self.print_calls.set(self.print_calls.get() + 1);
    }
}
