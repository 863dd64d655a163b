//! # onllm-engine
//!
//! The "narrow waist" between onllm's decode loop and the tensor runtime that executes
//! the decoder graph. The decode loop only sees [`InferenceBackend`]; swapping ONNX
//! Runtime for a stub, or for another runtime, does not change generation code.
//!
//! ## Graph contract
//!
//! One call to [`InferenceBackend::run`] is one decoder step:
//!
//! | Input | Shape |
//! |-------|-------|
//! | `input_ids` | `[batch, n]` |
//! | `attention_mask` (optional) | `[batch, past + n]` |
//! | `position_ids` | `[batch, n]` |
//! | `past_key_values.{layer}.{key,value}` | `[batch, kv_heads, past, head_dim]` |
//!
//! It returns `logits` `[batch, n, vocab]` and `present.{layer}.{key,value}` with the
//! new positions already concatenated onto the past.
//!
//! ### Interior Mutability
//! `run` takes `&self` so a loaded model can be shared behind an `Arc` between the
//! session and its worker thread. Backends that need `&mut` access guard it internally.

pub mod descriptor;
#[cfg(feature = "onnx")]
pub mod onnx;

pub use descriptor::ModelDescriptor;
#[cfg(feature = "onnx")]
pub use onnx::OnnxBackend;

use onllm_kv::{KVCacheState, KVError, KVKind, LayerKV};

pub type Result<T> = std::result::Result<T, EngineError>;

/// Error type for engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Model loading failed: {0}")]
    ModelLoad(String),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Missing engine output: {0}")]
    MissingOutput(String),
    #[error("Invalid tensor shape: {0}")]
    Shape(String),
    #[error("KV cache error: {0}")]
    Cache(#[from] KVError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Input name of a past cache tensor.
pub fn past_input_name(layer: usize, kind: KVKind) -> String {
    format!("past_key_values.{layer}.{kind}")
}

/// Output name of a present cache tensor.
pub fn present_output_name(layer: usize, kind: KVKind) -> String {
    format!("present.{layer}.{kind}")
}

/// Logits for every input position: `[batch, positions, vocab]`, flattened.
#[derive(Debug, Clone, PartialEq)]
pub struct Logits {
    shape: [usize; 3],
    data: Vec<f32>,
}

impl Logits {
    pub fn new(shape: [usize; 3], data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected || expected == 0 {
            return Err(EngineError::Shape(format!(
                "logits {:?} need {} values, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Logits for a single position of a single row: `[1, 1, vocab]`.
    pub fn single(row: Vec<f32>) -> Result<Self> {
        Self::new([1, 1, row.len()], row)
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn vocab_size(&self) -> usize {
        self.shape[2]
    }

    /// Row for the last input position of `batch`.
    pub fn last_row(&self, batch: usize) -> Result<&[f32]> {
        let [batches, positions, vocab] = self.shape;
        if batch >= batches {
            return Err(EngineError::Shape(format!(
                "batch {batch} out of range for logits {:?}",
                self.shape
            )));
        }
        let start = (batch * positions + positions - 1) * vocab;
        Ok(&self.data[start..start + vocab])
    }
}

/// Everything one decoder step consumes. Batch size is 1.
#[derive(Debug, Clone, Copy)]
pub struct StepInputs<'a> {
    pub input_ids: &'a [i64],
    /// Present only for models that require an explicit mask.
    pub attention_mask: Option<&'a [i64]>,
    pub position_ids: &'a [i64],
    pub past: &'a KVCacheState,
}

/// Everything one decoder step produces.
#[derive(Debug, Clone)]
pub struct StepOutputs {
    pub logits: Logits,
    /// One entry per layer, in layer order.
    pub present: Vec<LayerKV>,
}

/// The black-box tensor runtime executing the decoder graph.
pub trait InferenceBackend: Send + Sync {
    /// Run one decoder step.
    fn run(&self, inputs: StepInputs<'_>) -> Result<StepOutputs>;
}
