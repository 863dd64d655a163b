//! # onllm-sampling
//!
//! Next-token selection for onllm.
//!
//! Supports:
//! - Greedy (argmax over raw logits, first index on ties)
//! - Temperature scaling
//! - Top-k filtering (exactly k survivors)
//! - Top-p (nucleus) filtering
//! - Seeded RNG for reproducible generation, entropy-seeded otherwise
//!
//! The non-greedy pipeline runs in `f64`:
//! scale by `1 / max(temperature, 1e-5)` → stable softmax → top-k → top-p → weighted draw.
//! Each filter renormalizes with `sum + 1e-12` in the denominator.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Lower bound applied to the temperature before scaling.
pub const MIN_TEMPERATURE: f64 = 1e-5;

/// Added to the denominator when renormalizing after a filter.
pub const RENORM_EPSILON: f64 = 1e-12;

/// Sampling error type.
#[derive(Debug, Clone, PartialEq)]
pub enum SamplingError {
    InvalidLogits,
    NoValidTokens,
}

impl std::fmt::Display for SamplingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SamplingError::InvalidLogits => write!(f, "Invalid logits array"),
            SamplingError::NoValidTokens => write!(f, "No valid tokens after filtering"),
        }
    }
}

impl std::error::Error for SamplingError {}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// Sampling configuration and strategy.
#[derive(Debug, Clone)]
pub struct Sampler {
    /// Temperature for softmax scaling. Values at or below 1e-5 behave as 1e-5.
    pub temperature: f32,

    /// Top-k: keep exactly the k most likely tokens. 0 = disabled.
    pub top_k: usize,

    /// Top-p (nucleus): keep the smallest prefix of the sorted distribution whose
    /// cumulative probability exceeds p. Values >= 1.0 keep everything.
    pub top_p: f32,

    /// Greedy decoding: argmax over the raw logits, all other settings ignored.
    pub greedy: bool,

    /// RNG state. Mutated on each non-greedy call.
    rng: StdRng,
}

impl Sampler {
    /// Unfiltered sampling at temperature 1.0 with an entropy-seeded RNG.
    pub fn new() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            greedy: false,
            rng: StdRng::from_entropy(),
        }
    }

    /// Greedy sampler.
    pub fn greedy() -> Self {
        Self::new().with_greedy(true)
    }

    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = k;
        self
    }

    pub fn with_top_p(mut self, p: f32) -> Self {
        self.top_p = p;
        self
    }

    pub fn with_greedy(mut self, greedy: bool) -> Self {
        self.greedy = greedy;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Select a token index from one logits row.
    pub fn sample(&mut self, logits: &[f32]) -> SamplingResult<usize> {
        if self.greedy {
            return Self::argmax(logits);
        }

        let probs = self.distribution(logits)?;
        let dist = WeightedIndex::new(&probs).map_err(|_| SamplingError::NoValidTokens)?;
        Ok(dist.sample(&mut self.rng))
    }

    /// The filtered, renormalized distribution a non-greedy draw is taken from.
    pub fn distribution(&self, logits: &[f32]) -> SamplingResult<Vec<f64>> {
        Self::validate(logits)?;

        let inv_temp = 1.0 / (self.temperature as f64).max(MIN_TEMPERATURE);
        let scaled: Vec<f64> = logits.iter().map(|&l| l as f64 * inv_temp).collect();
        let mut probs = Self::softmax(&scaled);

        if self.top_k > 0 {
            Self::apply_top_k(&mut probs, self.top_k);
        }
        Self::apply_top_p(&mut probs, self.top_p as f64);

        Ok(probs)
    }

    /// Index of the largest logit; the first one wins ties.
    pub fn argmax(logits: &[f32]) -> SamplingResult<usize> {
        Self::validate(logits)?;
        let mut best = 0;
        for (i, &l) in logits.iter().enumerate().skip(1) {
            if l > logits[best] {
                best = i;
            }
        }
        Ok(best)
    }

    fn validate(logits: &[f32]) -> SamplingResult<()> {
        if logits.is_empty() || logits.iter().any(|l| l.is_nan()) {
            return Err(SamplingError::InvalidLogits);
        }
        Ok(())
    }

    fn softmax(logits: &[f64]) -> Vec<f64> {
        let max_logit = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
        let sum: f64 = exps.iter().sum();

        if sum > 0.0 && sum.is_finite() {
            exps.iter().map(|&e| e / sum).collect()
        } else {
            vec![1.0 / logits.len() as f64; logits.len()]
        }
    }

    /// Indices ordered by descending probability, lower index first on ties.
    fn descending(probs: &[f64]) -> Vec<usize> {
        let mut order: Vec<usize> = (0..probs.len()).collect();
        order.sort_by(|&a, &b| {
            probs[b]
                .partial_cmp(&probs[a])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
        order
    }

    fn renormalize(probs: &mut [f64]) {
        let denom: f64 = probs.iter().sum::<f64>() + RENORM_EPSILON;
        for p in probs.iter_mut() {
            *p /= denom;
        }
    }

    fn apply_top_k(probs: &mut [f64], k: usize) {
        let order = Self::descending(probs);
        for &i in order.iter().skip(k) {
            probs[i] = 0.0;
        }
        Self::renormalize(probs);
    }

    fn apply_top_p(probs: &mut [f64], p: f64) {
        let order = Self::descending(probs);
        let mut cumsum = 0.0;
        let mut keep = order.len();
        for (rank, &i) in order.iter().enumerate() {
            cumsum += probs[i];
            if cumsum > p {
                keep = rank + 1;
                break;
            }
        }

        for &i in order.iter().skip(keep) {
            probs[i] = 0.0;
        }
        Self::renormalize(probs);
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}
