//! Decoder geometry read from a model's `config.json`.
//!
//! Only the fields the KV cache needs are required; everything else HuggingFace
//! writes into the file is ignored.

use std::path::Path;

use serde::Deserialize;

use crate::{EngineError, Result};

/// Geometry of a decoder-only model.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelDescriptor {
    /// Number of transformer layers (one key and one value cache tensor each).
    pub num_hidden_layers: usize,

    /// Number of query heads. Used to derive `head_dim` and as the KV head
    /// count for models without grouped-query attention.
    #[serde(default)]
    pub num_attention_heads: usize,

    /// Number of key/value heads (GQA). Falls back to `num_attention_heads`.
    #[serde(default)]
    pub num_key_value_heads: usize,

    /// Dimension of each attention head.
    /// Computed as hidden_size / num_attention_heads when absent.
    #[serde(default)]
    pub head_dim: usize,

    #[serde(default)]
    pub hidden_size: usize,

    #[serde(default)]
    pub vocab_size: usize,

    #[serde(default)]
    pub model_type: String,
}

impl ModelDescriptor {
    /// Read and resolve `config.json`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            EngineError::ModelLoad(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json(&data)
    }

    /// Parse and resolve descriptor JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut descriptor: ModelDescriptor = serde_json::from_str(json)?;
        descriptor.resolve()?;
        Ok(descriptor)
    }

    /// Fill derived fields and check that the cache geometry is usable.
    pub fn resolve(&mut self) -> Result<()> {
        if self.num_key_value_heads == 0 {
            self.num_key_value_heads = self.num_attention_heads;
        }
        if self.head_dim == 0 && self.num_attention_heads > 0 {
            self.head_dim = self.hidden_size / self.num_attention_heads;
        }

        if self.num_hidden_layers == 0 || self.num_key_value_heads == 0 || self.head_dim == 0 {
            return Err(EngineError::ModelLoad(format!(
                "incomplete model geometry: layers={}, kv_heads={}, head_dim={}",
                self.num_hidden_layers, self.num_key_value_heads, self.head_dim
            )));
        }
        Ok(())
    }

    /// Bytes of cache per generated position (key + value, all layers, f32).
    pub fn kv_bytes_per_position(&self) -> usize {
        self.num_hidden_layers * 2 * self.num_key_value_heads * self.head_dim * std::mem::size_of::<f32>()
    }
}
