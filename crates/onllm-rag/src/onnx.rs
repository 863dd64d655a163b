//! Sentence embeddings from an exported encoder (MiniLM and friends).
//!
//! The model directory holds `tokenizer.json` and `model.onnx`. Token states
//! are mean-pooled over the attention mask and L2-normalized.

use std::path::Path;
use std::sync::Mutex;

use onllm_tokenizer::{HfTokenizer, Tokenizer};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{DynValue, Tensor};

use crate::{Embedder, RagError, Result};

/// Longest token sequence fed to the encoder.
const MAX_TOKENS: usize = 256;

/// Encoder graph executed by ONNX Runtime.
pub struct OnnxEmbedder {
    session: Mutex<Session>,
    tokenizer: HfTokenizer,
    input_names: Vec<String>,
    output_name: String,
    dimension: usize,
}

fn embedding_err(e: impl std::fmt::Display) -> RagError {
    RagError::Embedding(e.to_string())
}

fn i64_value(values: Vec<i64>) -> Result<DynValue> {
    Tensor::from_array((vec![1i64, values.len() as i64], values))
        .map(|t| t.into_dyn())
        .map_err(embedding_err)
}

impl OnnxEmbedder {
    /// Load `tokenizer.json` and `model.onnx` from `dir`.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let tokenizer = HfTokenizer::from_file(&dir.join("tokenizer.json")).map_err(embedding_err)?;
        let path = dir.join("model.onnx");
        let session = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.commit_from_file(&path))
            .map_err(|e| RagError::Embedding(format!("failed to load {}: {e}", path.display())))?;

        let input_names: Vec<String> = session.inputs.iter().map(|i| i.name.clone()).collect();
        let output_name = session
            .outputs
            .iter()
            .find(|o| o.name == "last_hidden_state")
            .or_else(|| session.outputs.first())
            .map(|o| o.name.clone())
            .ok_or_else(|| RagError::Embedding("encoder has no outputs".into()))?;

        let mut embedder = Self {
            session: Mutex::new(session),
            tokenizer,
            input_names,
            output_name,
            dimension: 0,
        };
        embedder.dimension = embedder.encode("hello")?.len();
        tracing::info!(path = %path.display(), dimension = embedder.dimension, "embedding model ready");
        Ok(embedder)
    }

    fn accepts(&self, name: &str) -> bool {
        self.input_names.iter().any(|n| n == name)
    }

    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let mut ids = self.tokenizer.encode(text, true).map_err(embedding_err)?;
        if ids.len() > MAX_TOKENS {
            // Keep the closing special token.
            let last = ids[ids.len() - 1];
            ids.truncate(MAX_TOKENS - 1);
            ids.push(last);
        }
        if ids.is_empty() {
            return Err(RagError::Embedding("text produced no tokens".into()));
        }
        let n = ids.len();

        let mut feed: Vec<(String, DynValue)> = Vec::with_capacity(3);
        feed.push((
            "input_ids".to_string(),
            i64_value(ids.iter().map(|&t| i64::from(t)).collect())?,
        ));
        if self.accepts("attention_mask") {
            feed.push(("attention_mask".to_string(), i64_value(vec![1; n])?));
        }
        if self.accepts("token_type_ids") {
            feed.push(("token_type_ids".to_string(), i64_value(vec![0; n])?));
        }

        let mut session = self
            .session
            .lock()
            .map_err(|_| RagError::Embedding("encoder session lock poisoned".into()))?;
        let outputs = session.run(feed).map_err(embedding_err)?;
        let (shape, data) = outputs
            .get(self.output_name.as_str())
            .ok_or_else(|| RagError::Embedding(format!("missing output {}", self.output_name)))?
            .try_extract_tensor::<f32>()
            .map_err(embedding_err)?;

        let dims: &[i64] = shape;
        let (tokens, width) = match *dims {
            [1, t, d] if t > 0 && d > 0 => (t as usize, d as usize),
            _ => return Err(RagError::Embedding(format!("unexpected output shape {dims:?}"))),
        };
        if data.len() != tokens * width {
            return Err(RagError::Embedding("output data does not match its shape".into()));
        }
        Ok(mean_pool(data, tokens, width))
    }
}

/// Average of `tokens` rows of `width`, scaled to unit length.
fn mean_pool(data: &[f32], tokens: usize, width: usize) -> Vec<f32> {
    let mut pooled = vec![0.0f32; width];
    for row in data.chunks_exact(width).take(tokens) {
        for (p, &x) in pooled.iter_mut().zip(row) {
            *p += x;
        }
    }
    for p in pooled.iter_mut() {
        *p /= tokens as f32;
    }
    let norm = pooled.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for p in pooled.iter_mut() {
            *p /= norm;
        }
    }
    pooled
}

impl Embedder for OnnxEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.encode(text)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
