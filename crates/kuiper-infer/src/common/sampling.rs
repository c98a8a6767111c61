//! Token selection from the last row's logits.
//!
//! Every sampler is a deterministic function of (logits, position, mode):
//! the stochastic one seeds its generator from its own seed and the
//! position, so replaying a session reproduces it token for token.

use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::activations::softmax_inplace;
use crate::error::{EngineError, EngineResult};

pub trait Sampler: Send + Sync {
    fn sample(&self, logits: &[f32], pos: usize, is_prompt: bool) -> EngineResult<u32>;
}

fn non_empty(logits: &[f32]) -> EngineResult<()> {
    if logits.is_empty() {
        return Err(EngineError::invalid_argument("sampler", "logits", "is empty"));
    }
    Ok(())
}

/// Index of the first maximum. NaN never wins.
pub fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0;
    for (i, &v) in logits.iter().enumerate() {
        if v > logits[best] || logits[best].is_nan() {
            best = i;
        }
    }
    best as u32
}

/// Greedy decoding.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArgmaxSampler;

impl Sampler for ArgmaxSampler {
    fn sample(&self, logits: &[f32], _pos: usize, _is_prompt: bool) -> EngineResult<u32> {
        non_empty(logits)?;
        Ok(argmax(logits))
    }
}

/// Temperature sampling restricted to the `top_k` largest logits.
#[derive(Debug, Clone, Copy)]
pub struct TemperatureSampler {
    pub temperature: f32,
    /// `0` keeps the whole vocabulary.
    pub top_k: usize,
    pub seed: u64,
}

impl TemperatureSampler {
    pub fn new(temperature: f32, top_k: usize, seed: u64) -> Self {
        Self {
            temperature,
            top_k,
            seed,
        }
    }

    fn rng_for(&self, pos: usize) -> StdRng {
        // splitmix-style mixing keeps neighbouring positions decorrelated
        let mixed = self
            .seed
            .wrapping_add((pos as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        StdRng::seed_from_u64(mixed)
    }
}

impl Sampler for TemperatureSampler {
    fn sample(&self, logits: &[f32], pos: usize, _is_prompt: bool) -> EngineResult<u32> {
        non_empty(logits)?;
        if self.temperature <= 0.0 {
            return Ok(argmax(logits));
        }

        let mut logits = Array1::from(logits.to_vec());
        if self.top_k > 0 && self.top_k < logits.len() {
            logits = top_k_filtering(logits, self.top_k);
        }
        logits /= self.temperature;

        let mut probs = logits.to_vec();
        softmax_inplace(&mut probs);
        let mut rng = self.rng_for(pos);
        Ok(sample_from_probs(&probs, rng.gen::<f32>()))
    }
}

/// Masks every logit outside the `k` largest with `-inf`.
pub fn top_k_filtering(mut logits: Array1<f32>, k: usize) -> Array1<f32> {
    let mut indices: Vec<usize> = (0..logits.len()).collect();
    indices.sort_by(|&a, &b| logits[b].total_cmp(&logits[a]));
    for &idx in &indices[k.min(indices.len())..] {
        logits[idx] = f32::NEG_INFINITY;
    }
    logits
}

/// Inverse-CDF draw with `uniform` in `[0, 1)`.
pub fn sample_from_probs(probs: &[f32], uniform: f32) -> u32 {
    let mut cumulative = 0.0;
    for (idx, &prob) in probs.iter().enumerate() {
        cumulative += prob;
        if cumulative > uniform {
            return idx as u32;
        }
    }
    // rounding left the mass short of `uniform`; take the last non-zero entry
    probs.iter().rposition(|&p| p > 0.0).unwrap_or(0) as u32
}
