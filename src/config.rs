//! Generation and session configuration.
//!
//! All types deserialize with per-field defaults, so a settings file only needs the
//! fields it changes.

use std::path::{Path, PathBuf};

use onllm_sampling::Sampler;
use serde::{Deserialize, Serialize};

use crate::error::{OnllmError, Result};

/// Slider ranges offered by the settings screen.
pub mod limits {
    use std::ops::RangeInclusive;

    pub const MAX_NEW_TOKENS: RangeInclusive<usize> = 32..=1024;
    pub const TOP_K: RangeInclusive<usize> = 1..=100;
    pub const TOP_P: RangeInclusive<f32> = 0.10..=1.00;
    pub const TEMPERATURE: RangeInclusive<f32> = 0.0..=1.5;
}

/// Stop once the generated text is longer than `min_chars` characters and ends
/// with `suffix`. Small models tend to trail off into ellipses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarlyStop {
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,

    #[serde(default = "default_suffix")]
    pub suffix: String,
}

fn default_min_chars() -> usize {
    20
}
fn default_suffix() -> String {
    "..".to_string()
}

impl Default for EarlyStop {
    fn default() -> Self {
        EarlyStop {
            min_chars: default_min_chars(),
            suffix: default_suffix(),
        }
    }
}

impl EarlyStop {
    pub fn should_stop(&self, text: &str) -> bool {
        text.chars().count() > self.min_chars && text.ends_with(self.suffix.as_str())
    }
}

/// Decoding settings for one generation. Changes apply to the next generation only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Upper bound on decode steps (engine calls).
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,

    /// Softmax temperature; floored at 1e-5 by the sampler.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Nucleus threshold.
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Keep the k most likely tokens. 0 = disabled.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Argmax decoding; temperature, top-k and top-p are ignored.
    #[serde(default)]
    pub use_greedy: bool,

    /// Seed for reproducible sampling. Entropy-seeded when absent.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Trailing-ellipsis stop rule. `null` disables it.
    #[serde(default = "default_early_stop")]
    pub early_stop: Option<EarlyStop>,
}

fn default_max_new_tokens() -> usize {
    256
}
fn default_temperature() -> f32 {
    0.15
}
fn default_top_p() -> f32 {
    0.85
}
fn default_top_k() -> usize {
    20
}
fn default_early_stop() -> Option<EarlyStop> {
    Some(EarlyStop::default())
}

impl Default for GenerationConfig {
    fn default() -> Self {
        GenerationConfig {
            max_new_tokens: default_max_new_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            use_greedy: false,
            seed: None,
            early_stop: default_early_stop(),
        }
    }
}

impl GenerationConfig {
    /// Greedy decoding with the default budget.
    pub fn greedy() -> Self {
        GenerationConfig {
            use_greedy: true,
            ..Self::default()
        }
    }

    /// Pull every field into the range the settings screen allows.
    pub fn clamped(mut self) -> Self {
        self.max_new_tokens = self
            .max_new_tokens
            .clamp(*limits::MAX_NEW_TOKENS.start(), *limits::MAX_NEW_TOKENS.end());
        self.top_k = self
            .top_k
            .clamp(*limits::TOP_K.start(), *limits::TOP_K.end());
        self.top_p = clamp_f32(self.top_p, *limits::TOP_P.start(), *limits::TOP_P.end());
        self.temperature = clamp_f32(
            self.temperature,
            *limits::TEMPERATURE.start(),
            *limits::TEMPERATURE.end(),
        );
        self
    }

    /// Sampler for one generation.
    pub fn sampler(&self) -> Sampler {
        let sampler = Sampler::new()
            .with_greedy(self.use_greedy)
            .with_temperature(self.temperature)
            .with_top_k(self.top_k)
            .with_top_p(self.top_p);
        match self.seed {
            Some(seed) => sampler.with_seed(seed),
            None => sampler,
        }
    }
}

fn clamp_f32(v: f32, lo: f32, hi: f32) -> f32 {
    if v.is_nan() {
        lo
    } else {
        v.clamp(lo, hi)
    }
}

/// Conversation policy for a chat session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Stored messages sent with each turn, after the system instruction.
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// System instruction for document-grounded turns.
    #[serde(default = "default_grounded_system_prompt")]
    pub grounded_system_prompt: String,

    /// Chunks retrieved per grounded question.
    #[serde(default = "default_retrieval_top_k")]
    pub retrieval_top_k: usize,

    /// Character budget for retrieved context.
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
}

fn default_history_window() -> usize {
    6
}
fn default_system_prompt() -> String {
    "You are a concise and accurate assistant. \
     If you are not sure, say you don't know. \
     Do not invent facts. \
     Use bullet points when helpful."
        .to_string()
}
fn default_grounded_system_prompt() -> String {
    "Answer ONLY using the provided document context. \
     If the answer is not in the context, say: 'Not found in the document.' \
     Do not add extra facts."
        .to_string()
}
fn default_retrieval_top_k() -> usize {
    3
}
fn default_max_context_chars() -> usize {
    2048
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            history_window: default_history_window(),
            system_prompt: default_system_prompt(),
            grounded_system_prompt: default_grounded_system_prompt(),
            retrieval_top_k: default_retrieval_top_k(),
            max_context_chars: default_max_context_chars(),
        }
    }
}

/// Application settings file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub session: SessionSettings,

    /// Directory holding one subdirectory per downloaded model.
    #[serde(default)]
    pub models_dir: Option<PathBuf>,

    /// Path of an `extra_models.json` registry extension.
    #[serde(default)]
    pub extra_models: Option<PathBuf>,
}

impl AppConfig {
    /// Load a settings file. Generation settings are clamped to the slider ranges.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            OnllmError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json(&data)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let mut config: AppConfig = serde_json::from_str(json)?;
        config.generation = config.generation.clamped();
        Ok(config)
    }
}
