//! Per-session sampler state.
//!
//! Adaptive sampling modes carry a running variable across calls within one
//! generation. It lives here, owned by the session and passed into every
//! `sample_next` call, so concurrent sessions never share a trajectory.

use rand::rngs::StdRng;
use rand::SeedableRng;

use super::policy::GenerationPolicy;

/// Mutable sampling state for one generation.
#[derive(Debug, Clone)]
pub struct SamplerState {
    seed: u32,
    mirostat_mu: f32,
    rng: StdRng,
}

impl SamplerState {
    /// Fresh state for a generation. The seed must already be resolved.
    pub fn new(seed: u32, mirostat_tau: f32) -> Self {
        Self {
            seed,
            mirostat_mu: 2.0 * mirostat_tau,
            rng: StdRng::seed_from_u64(u64::from(seed)),
        }
    }

    /// State for a validated policy. An unset seed falls back to 0.
    pub fn for_policy(policy: &GenerationPolicy) -> Self {
        Self::new(policy.seed.unwrap_or(0), policy.mirostat_tau)
    }

    pub fn seed(&self) -> u32 {
        self.seed
    }

    /// Current mirostat target surprise (mu).
    pub fn mirostat_mu(&self) -> f32 {
        self.mirostat_mu
    }

    pub fn mirostat_mu_mut(&mut self) -> &mut f32 {
        &mut self.mirostat_mu
    }

    /// Deterministic RNG seeded from the generation seed.
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}
