//! Generation policy and settings echo for GG-SESSION.
//!
//! The policy is forwarded verbatim to the inference backend's sampling
//! capability. It is validated once at `begin` time and is immutable for the
//! rest of the generation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::error::SessionError;
use super::Token;

/// Adaptive sampling mode selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirostatMode {
    Disabled,
    V1,
    V2,
}

/// Sampling configuration for one generation.
///
/// Field names follow the completion request surface so a request body can
/// be deserialized straight into a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationPolicy {
    /// Sampling temperature (<= 0.0 = greedy)
    #[serde(alias = "temp")]
    pub temperature: f32,
    /// Top-k limit (<= 0 = whole vocabulary)
    pub top_k: i32,
    /// Nucleus threshold in [0.0, 1.0]
    pub top_p: f32,
    /// Tail-free sampling z (1.0 = disabled)
    pub tfs_z: f32,
    /// Locally typical sampling p (1.0 = disabled)
    pub typical_p: f32,
    /// Repetition penalty (1.0 = none)
    pub repeat_penalty: f32,
    /// Penalty lookback in tokens (-1 = whole context, 0 = disabled)
    pub repeat_last_n: i32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    /// 0 = disabled, 1 = mirostat, 2 = mirostat v2
    pub mirostat: u8,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    /// Apply penalties to the newline token
    pub penalize_nl: bool,
    /// Per-token logit adjustments, keyed by raw vocabulary index
    #[serde(with = "bias_pairs")]
    pub logit_bias: BTreeMap<Token, f32>,
    /// Suppress the end-of-sequence token
    pub ignore_eos: bool,
    /// Maximum tokens to produce (-1 = unbounded)
    #[serde(alias = "max_tokens")]
    pub n_predict: i32,
    /// Prompt tokens anchored during truncation (-1 = whole prompt)
    pub n_keep: i32,
    /// RNG seed. None = pick one at `begin` time.
    pub seed: Option<u32>,
}

impl Default for GenerationPolicy {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            tfs_z: 1.0,
            typical_p: 1.0,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            penalize_nl: true,
            logit_bias: BTreeMap::new(),
            ignore_eos: false,
            n_predict: -1,
            n_keep: -1,
            seed: None,
        }
    }
}

impl GenerationPolicy {
    /// Validate the policy against the backend vocabulary.
    ///
    /// Logit-bias keys are checked here rather than at sampling time, so an
    /// out-of-range token id rejects the request before any engine call.
    pub fn validate(&self, vocab_size: usize) -> Result<(), SessionError> {
        if self.temperature.is_nan() {
            return Err(invalid("temperature must be a number"));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(invalid("top_p must be in range [0.0, 1.0]"));
        }
        if !(0.0..=1.0).contains(&self.typical_p) {
            return Err(invalid("typical_p must be in range [0.0, 1.0]"));
        }
        if self.n_predict == 0 || self.n_predict < -1 {
            return Err(invalid("n_predict must be -1 (unbounded) or > 0"));
        }
        if self.n_keep < -1 {
            return Err(invalid("n_keep must be >= -1"));
        }
        if self.repeat_last_n < -1 {
            return Err(invalid("repeat_last_n must be >= -1"));
        }
        if self.mirostat > 2 {
            return Err(invalid("mirostat must be 0, 1 or 2"));
        }
        for (&token, &bias) in &self.logit_bias {
            if token as usize >= vocab_size {
                return Err(SessionError::InvalidPolicy(format!(
                    "logit_bias token {} out of range for vocabulary of {}",
                    token, vocab_size
                )));
            }
            if bias.is_nan() {
                return Err(SessionError::InvalidPolicy(format!(
                    "logit_bias for token {} is not a number",
                    token
                )));
            }
        }
        Ok(())
    }

    pub fn mirostat_mode(&self) -> MirostatMode {
        match self.mirostat {
            1 => MirostatMode::V1,
            2 => MirostatMode::V2,
            _ => MirostatMode::Disabled,
        }
    }

    /// True when sampling collapses to argmax.
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    /// Budget of tokens to produce, None when unbounded.
    pub fn token_budget(&self) -> Option<usize> {
        usize::try_from(self.n_predict).ok()
    }

    /// The policy as handed to the sampler: end-of-sequence suppression is
    /// folded into the logit-bias map.
    pub fn effective(&self, eos: Token) -> Self {
        let mut policy = self.clone();
        if policy.ignore_eos {
            policy.logit_bias.insert(eos, f32::NEG_INFINITY);
        }
        policy
    }
}

fn invalid(reason: &str) -> SessionError {
    SessionError::InvalidPolicy(reason.to_string())
}

/// Generation settings echoed back with a completion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationSettings {
    pub seed: Option<u32>,
    pub temp: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub tfs_z: f32,
    pub typical_p: f32,
    pub repeat_last_n: i32,
    pub repeat_penalty: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    pub mirostat: u8,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    pub penalize_nl: bool,
    pub stop: Vec<String>,
    pub n_predict: i32,
    pub n_keep: usize,
    pub ignore_eos: bool,
    pub stream: bool,
    #[serde(with = "bias_pairs")]
    pub logit_bias: BTreeMap<Token, f32>,
}

impl GenerationSettings {
    /// Build the echo from a validated policy and the resolved keep count.
    pub fn new(policy: &GenerationPolicy, stop: &[String], n_keep: usize, stream: bool) -> Self {
        Self {
            seed: policy.seed,
            temp: policy.temperature,
            top_k: policy.top_k,
            top_p: policy.top_p,
            tfs_z: policy.tfs_z,
            typical_p: policy.typical_p,
            repeat_last_n: policy.repeat_last_n,
            repeat_penalty: policy.repeat_penalty,
            presence_penalty: policy.presence_penalty,
            frequency_penalty: policy.frequency_penalty,
            mirostat: policy.mirostat,
            mirostat_tau: policy.mirostat_tau,
            mirostat_eta: policy.mirostat_eta,
            penalize_nl: policy.penalize_nl,
            stop: stop.to_vec(),
            n_predict: policy.n_predict,
            n_keep,
            ignore_eos: policy.ignore_eos,
            stream,
            logit_bias: policy.logit_bias.clone(),
        }
    }
}

/// Logit bias travels as an array of `[token, bias]` pairs.
mod bias_pairs {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::engine::Token;

    pub fn serialize<S: Serializer>(map: &BTreeMap<Token, f32>, s: S) -> Result<S::Ok, S::Error> {
        let pairs: Vec<(Token, f32)> = map.iter().map(|(&t, &b)| (t, b)).collect();
        pairs.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<Token, f32>, D::Error> {
        let pairs = Vec::<(Token, f32)>::deserialize(d)?;
        Ok(pairs.into_iter().collect())
    }
}
