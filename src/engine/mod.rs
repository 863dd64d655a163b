//! Step-by-step text generation.
//!
//! One [`DecodeLoop::run`] call is one generation:
//! - **Prefill**: the whole prompt goes through the engine with an empty past.
//! - **Decode**: the sampled token is fed back one position at a time, with the
//!   engine's present key/values becoming the next step's past.
//!
//! The loop ends on an EOS token, the step budget, the early-stop rule or
//! cancellation. Cancellation is polled once per step, before the engine call.

pub mod actor;

use std::time::{Duration, Instant};

use onllm_engine::{EngineError, StepInputs};
use onllm_kv::KVCacheState;
use onllm_tokenizer::{TextStream, TokenId};
use tokio_util::sync::CancellationToken;

use crate::config::GenerationConfig;
use crate::error::Result;
use crate::model::LoadedModel;

/// Statistics from a generation run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationStats {
    /// Number of tokens in the prompt.
    pub prompt_tokens: usize,

    /// Number of engine steps that produced a token (EOS included).
    pub generated_tokens: usize,

    /// Time for the prefill step in milliseconds.
    pub prefill_time_ms: f64,

    /// Time for the remaining steps in milliseconds.
    pub decode_time_ms: f64,

    /// Tokens per second during decode.
    pub tokens_per_second: f64,
}

/// Why a completed generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfSequence,
    MaxTokens,
    EarlyStop,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StopReason::EndOfSequence => "eos",
            StopReason::MaxTokens => "max_tokens",
            StopReason::EarlyStop => "early_stop",
        })
    }
}

/// Text and bookkeeping of a generation that ran to completion.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub stop_reason: StopReason,
    pub stats: GenerationStats,
}

/// Result of [`DecodeLoop::run`]. A cancelled run produces no text.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutcome {
    Completed(Generation),
    Cancelled,
}

/// Drives the engine, cache and sampler for one model and one config.
pub struct DecodeLoop<'a> {
    model: &'a LoadedModel,
    config: &'a GenerationConfig,
}

impl<'a> DecodeLoop<'a> {
    pub fn new(model: &'a LoadedModel, config: &'a GenerationConfig) -> Self {
        DecodeLoop { model, config }
    }

    /// Generate from `prompt`. `on_partial` receives each non-empty decoded
    /// fragment in order. The cache is continued from its current length, so
    /// pass a freshly initialized one for a new generation.
    pub fn run<F>(
        &self,
        prompt: &[TokenId],
        cache: &mut KVCacheState,
        cancel: &CancellationToken,
        mut on_partial: F,
    ) -> Result<DecodeOutcome>
    where
        F: FnMut(&str),
    {
        if prompt.is_empty() {
            return Err(EngineError::Inference("empty prompt".into()).into());
        }

        let spec = &self.model.spec;
        let tokenizer = self.model.tokenizer.as_ref();
        let past = cache.seq_len() as i64;

        let mut input_ids: Vec<i64> = prompt.iter().map(|&t| i64::from(t)).collect();
        let mut position_ids: Vec<i64> = (past..past + input_ids.len() as i64).collect();
        let mut attention_mask: Vec<i64> = if spec.needs_attention_mask {
            vec![1; cache.seq_len() + input_ids.len()]
        } else {
            Vec::new()
        };

        let mut sampler = self.config.sampler();
        let mut stream = TextStream::new();
        let mut stats = GenerationStats {
            prompt_tokens: prompt.len(),
            ..GenerationStats::default()
        };
        let mut stop_reason = StopReason::MaxTokens;

        let start = Instant::now();
        let mut decode_start = None;

        for step in 0..self.config.max_new_tokens {
            if cancel.is_cancelled() {
                tracing::debug!(step, "generation cancelled");
                return Ok(DecodeOutcome::Cancelled);
            }

            let outputs = self.model.backend.run(StepInputs {
                input_ids: &input_ids,
                attention_mask: spec.needs_attention_mask.then_some(attention_mask.as_slice()),
                position_ids: &position_ids,
                past: &*cache,
            })?;
            if decode_start.is_none() {
                stats.prefill_time_ms = ms(start.elapsed());
                decode_start = Some(Instant::now());
            }

            let index = sampler.sample(outputs.logits.last_row(0)?)?;
            let token = TokenId::try_from(index)
                .map_err(|_| EngineError::Shape(format!("token index {index} out of range")))?;
            cache.advance_all(outputs.present)?;
            stats.generated_tokens += 1;

            if spec.needs_attention_mask {
                attention_mask.push(1);
            }
            let next_position = position_ids.last().map_or(past, |p| p + 1);
            position_ids = vec![next_position];
            input_ids = vec![i64::from(token)];

            tracing::debug!(step, token, seq_len = cache.seq_len(), "decode step");

            if spec.is_eos(token) {
                stop_reason = StopReason::EndOfSequence;
                break;
            }
            if cancel.is_cancelled() {
                tracing::debug!(step, "generation cancelled");
                return Ok(DecodeOutcome::Cancelled);
            }

            let fragment = stream.push(tokenizer, token)?;
            if !fragment.is_empty() {
                on_partial(&fragment);
            }

            if let Some(rule) = &self.config.early_stop {
                if rule.should_stop(stream.text()) {
                    stop_reason = StopReason::EarlyStop;
                    break;
                }
            }
        }

        if let Some(decode_start) = decode_start {
            let decode_time = decode_start.elapsed();
            stats.decode_time_ms = ms(decode_time);
            let decode_tokens = stats.generated_tokens.saturating_sub(1);
            if decode_tokens > 0 && decode_time > Duration::ZERO {
                stats.tokens_per_second = decode_tokens as f64 / decode_time.as_secs_f64();
            }
        }

        tracing::info!(
            model = %spec.name,
            prompt_tokens = stats.prompt_tokens,
            generated_tokens = stats.generated_tokens,
            stop_reason = %stop_reason,
            prefill_ms = stats.prefill_time_ms,
            decode_ms = stats.decode_time_ms,
            tokens_per_second = stats.tokens_per_second,
            "generation finished"
        );

        Ok(DecodeOutcome::Completed(Generation {
            text: stream.into_text(),
            stop_reason,
            stats,
        }))
    }
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
