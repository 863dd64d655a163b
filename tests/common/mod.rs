//! Shared fixtures: a scripted decoder backend and a ChatML model around it.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use crossbeam_channel::Receiver;
use onllm::{LoadedModel, ModelRegistry, ModelSpec};
use onllm_engine::{
    EngineError, InferenceBackend, Logits, ModelDescriptor, Result, StepInputs, StepOutputs,
};
use onllm_kv::{KVShape, KVTensor, LayerKV};
use onllm_tokenizer::{CharTokenizer, TokenId, Tokenizer};

/// ChatML specials plus ASCII.
pub const VOCAB: usize = 3 + 128;
pub const LAYERS: usize = 2;
pub const KV_HEADS: usize = 2;
pub const HEAD_DIM: usize = 4;

/// `<|im_end|>` in [`CharTokenizer::chatml`].
pub const IM_END: TokenId = 2;

/// What the backend saw on one call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedStep {
    pub input_ids: Vec<i64>,
    pub attention_mask: Option<Vec<i64>>,
    pub position_ids: Vec<i64>,
    pub past_len: usize,
}

#[derive(Default)]
struct Recorder {
    steps: Vec<RecordedStep>,
    /// Calls since the last call with an empty past.
    in_generation: usize,
    generations: usize,
}

/// Emits a fixed token sequence, one per step; the last token repeats once the
/// script runs out. A new generation (empty past) restarts the script.
pub struct ScriptedBackend {
    script: Vec<TokenId>,
    fail_at: Option<usize>,
    gate: Option<Receiver<()>>,
    recorder: Mutex<Recorder>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<TokenId>) -> Self {
        Self {
            script,
            fail_at: None,
            gate: None,
            recorder: Mutex::new(Recorder::default()),
        }
    }

    /// Emit the characters of `text`, then `<|im_end|>`.
    pub fn reply(text: &str) -> Self {
        let tok = CharTokenizer::chatml();
        let mut script: Vec<TokenId> = text.chars().map(|c| tok.char_id(c)).collect();
        script.push(IM_END);
        Self::new(script)
    }

    /// Emit `c` forever.
    pub fn endless(c: char) -> Self {
        Self::new(vec![CharTokenizer::chatml().char_id(c)])
    }

    /// Fail on the given step of every generation.
    pub fn failing_at(mut self, step: usize) -> Self {
        self.fail_at = Some(step);
        self
    }

    /// Wait for a permit (or a dropped sender) inside every call.
    pub fn gated(mut self, gate: Receiver<()>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn steps(&self) -> Vec<RecordedStep> {
        self.recorder.lock().unwrap().steps.clone()
    }

    pub fn generations(&self) -> usize {
        self.recorder.lock().unwrap().generations
    }

    /// Prompt text of every generation's first call.
    pub fn prompts(&self) -> Vec<String> {
        let tok = CharTokenizer::chatml();
        self.steps()
            .iter()
            .filter(|s| s.past_len == 0)
            .map(|s| {
                let ids: Vec<TokenId> = s.input_ids.iter().map(|&t| t as TokenId).collect();
                tok.decode(&ids, false).unwrap()
            })
            .collect()
    }
}

impl InferenceBackend for ScriptedBackend {
    fn run(&self, inputs: StepInputs<'_>) -> Result<StepOutputs> {
        let step = {
            let mut rec = self.recorder.lock().unwrap();
            if inputs.past.seq_len() == 0 {
                rec.in_generation = 0;
                rec.generations += 1;
            }
            rec.steps.push(RecordedStep {
                input_ids: inputs.input_ids.to_vec(),
                attention_mask: inputs.attention_mask.map(|m| m.to_vec()),
                position_ids: inputs.position_ids.to_vec(),
                past_len: inputs.past.seq_len(),
            });
            rec.in_generation += 1;
            rec.in_generation - 1
        };

        if let Some(gate) = &self.gate {
            let _ = gate.recv();
        }
        if self.fail_at == Some(step) {
            return Err(EngineError::Inference(format!("scripted failure at step {step}")));
        }

        let token = self
            .script
            .get(step)
            .or(self.script.last())
            .copied()
            .unwrap_or(IM_END) as usize;

        let n = inputs.input_ids.len();
        let mut data = vec![0.0; n * VOCAB];
        data[(n - 1) * VOCAB + token] = 10.0;

        let shape = KVShape::new(1, KV_HEADS, inputs.past.seq_len() + n, HEAD_DIM);
        let present = (0..LAYERS)
            .map(|_| LayerKV::new(KVTensor::zeros(shape), KVTensor::zeros(shape)))
            .collect();

        Ok(StepOutputs {
            logits: Logits::new([1, n, VOCAB], data)?,
            present,
        })
    }
}

/// The built-in SmolLM2 entry over a ChatML char tokenizer and `backend`.
pub fn chatml_model(backend: Arc<dyn InferenceBackend>, needs_mask: bool) -> LoadedModel {
    let registry = ModelRegistry::builtin();
    let mut entry = registry.get("smollm2-135m").unwrap().clone();
    entry.att_mask = needs_mask;

    let descriptor = ModelDescriptor::from_json(&format!(
        r#"{{"num_hidden_layers": {LAYERS}, "num_key_value_heads": {KV_HEADS}, "head_dim": {HEAD_DIM}}}"#
    ))
    .unwrap();
    let tokenizer = CharTokenizer::chatml();
    let spec = ModelSpec::resolve("smollm2-135m", &entry, &descriptor, &tokenizer).unwrap();
    LoadedModel::new(spec, Arc::new(tokenizer), backend)
}
