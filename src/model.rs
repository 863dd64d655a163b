//! Model registry, resolved model specs and loaded model handles.
//!
//! A model directory holds `config.json` (geometry), `tokenizer.json` and the
//! exported decoder at `onnx/model_int8.onnx`. The registry knows which models
//! exist and how to talk to them (role tags, EOS strings, mask requirement).
//!
//! Document-grounded mode uses a separate sentence-embedding model whose
//! directory holds `tokenizer.json` and `model.onnx`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use onllm_engine::{InferenceBackend, ModelDescriptor};
use onllm_kv::{KVCacheState, KVResult};
use onllm_tokenizer::{TokenId, Tokenizer};
use serde::{Deserialize, Serialize};

use crate::error::{OnllmError, Result};
use crate::prompt::ChatTemplate;

/// Files every model directory must contain, relative to its root.
pub const REQUIRED_FILES: [&str; 3] = ["config.json", "tokenizer.json", "onnx/model_int8.onnx"];

/// Files an embedding model directory must contain.
pub const EMBEDDING_REQUIRED_FILES: [&str; 2] = ["tokenizer.json", "model.onnx"];

/// Name of the model shipped in the built-in registry.
pub const DEFAULT_MODEL: &str = "smollm2-135m";

/// Name of the built-in sentence-embedding model for document mode.
pub const DEFAULT_EMBEDDING_MODEL: &str = "all-MiniLM-L6-V2";

/// Registry record for one downloadable model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    #[serde(default)]
    pub name: String,

    /// Archive download location.
    #[serde(default)]
    pub url: String,

    /// Human-readable download size.
    #[serde(default)]
    pub size: String,

    /// `android` (runs everywhere), `warn` (may be slow on phones) or a desktop tag.
    #[serde(default)]
    pub platform: String,

    /// Chat role tags: `[init, start, end]`. Empty for embedding models.
    #[serde(default)]
    pub tokens: Vec<String>,

    /// Extra token strings that end generation, besides the end tag.
    #[serde(default)]
    pub eos_ids: Vec<String>,

    /// Whether the graph takes an `attention_mask` input.
    #[serde(default)]
    pub att_mask: bool,
}

/// Where the registry is being used; phones only accept some entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Android,
    Desktop,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "android") {
            Platform::Android
        } else {
            Platform::Desktop
        }
    }

    pub fn accepts(&self, entry: &ModelEntry) -> bool {
        match self {
            Platform::Android => matches!(entry.platform.as_str(), "android" | "warn"),
            Platform::Desktop => true,
        }
    }
}

/// Known models by name.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelEntry>,
    embedding_models: BTreeMap<String, ModelEntry>,
}

impl ModelRegistry {
    /// Registry with the built-in SmolLM2 chat model and MiniLM embedding model.
    pub fn builtin() -> Self {
        let entry = ModelEntry {
            name: DEFAULT_MODEL.to_string(),
            url: "https://github.com/daslearning-org/OnLLM/releases/download/vOnnxModels/smollm2-135m.tar.gz"
                .to_string(),
            size: "95MB".to_string(),
            platform: "android".to_string(),
            tokens: vec![
                String::new(),
                "<|im_start|>".to_string(),
                "<|im_end|>".to_string(),
            ],
            eos_ids: vec!["<|endoftext|>".to_string()],
            att_mask: true,
        };
        let mut models = BTreeMap::new();
        models.insert(DEFAULT_MODEL.to_string(), entry);

        let embedder = ModelEntry {
            name: DEFAULT_EMBEDDING_MODEL.to_string(),
            url: "https://huggingface.co/daslearning/Embedding-Onnx/resolve/main/onnx/all-MiniLM-L6-V2.tar.gz?download=true"
                .to_string(),
            size: "85MB".to_string(),
            platform: "android".to_string(),
            tokens: Vec::new(),
            eos_ids: Vec::new(),
            att_mask: true,
        };
        let mut embedding_models = BTreeMap::new();
        embedding_models.insert(DEFAULT_EMBEDDING_MODEL.to_string(), embedder);

        Self {
            models,
            embedding_models,
        }
    }

    pub fn empty() -> Self {
        Self {
            models: BTreeMap::new(),
            embedding_models: BTreeMap::new(),
        }
    }

    /// Add entries the platform accepts. Existing names are kept. Returns the
    /// names that were added.
    pub fn merge_extra(
        &mut self,
        extra: BTreeMap<String, ModelEntry>,
        platform: Platform,
    ) -> Vec<String> {
        let mut added = Vec::new();
        for (name, mut entry) in extra {
            if self.models.contains_key(&name) {
                tracing::debug!(model = %name, "registry entry already present, skipping");
                continue;
            }
            if !platform.accepts(&entry) {
                tracing::debug!(model = %name, platform = %entry.platform, "registry entry not for this platform");
                continue;
            }
            if let Err(e) = ChatTemplate::from_tags(&entry.tokens) {
                tracing::warn!(model = %name, error = %e, "registry entry skipped");
                continue;
            }
            if entry.name.is_empty() {
                entry.name = name.clone();
            }
            self.models.insert(name.clone(), entry);
            added.push(name);
        }
        added
    }

    /// Merge an `extra_models.json` file (a map of name to entry). Entries
    /// that do not parse are skipped with a warning.
    pub fn load_extra(&mut self, path: &Path, platform: Platform) -> Result<Vec<String>> {
        let data = std::fs::read_to_string(path)?;
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(&data)?;
        let mut extra = BTreeMap::new();
        for (name, value) in raw {
            match serde_json::from_value::<ModelEntry>(value) {
                Ok(entry) => {
                    extra.insert(name, entry);
                }
                Err(e) => tracing::warn!(model = %name, error = %e, "malformed registry entry skipped"),
            }
        }
        let added = self.merge_extra(extra, platform);
        tracing::info!(path = %path.display(), added = added.len(), "extra models merged");
        Ok(added)
    }

    pub fn get(&self, name: &str) -> Option<&ModelEntry> {
        self.models.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ModelEntry)> {
        self.models.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Sentence-embedding model for document mode.
    pub fn embedding_model(&self, name: &str) -> Option<&ModelEntry> {
        self.embedding_models.get(name)
    }

    pub fn embedding_models(&self) -> impl Iterator<Item = (&str, &ModelEntry)> {
        self.embedding_models.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Required files missing from a model directory.
pub fn check_model_files(dir: &Path) -> Vec<PathBuf> {
    REQUIRED_FILES
        .iter()
        .map(|f| dir.join(f))
        .filter(|p| !p.is_file())
        .collect()
}

/// Required files missing from an embedding model directory.
pub fn check_embedding_model_files(dir: &Path) -> Vec<PathBuf> {
    EMBEDDING_REQUIRED_FILES
        .iter()
        .map(|f| dir.join(f))
        .filter(|p| !p.is_file())
        .collect()
}

/// Everything the decode loop needs to know about the selected model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub name: String,
    pub template: ChatTemplate,
    /// Tokens that end generation: the end tag, then each `eos_ids` string.
    pub eos_ids: Vec<TokenId>,
    pub num_layers: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub needs_attention_mask: bool,
}

impl ModelSpec {
    /// Combine a registry entry, the model's geometry and its vocabulary.
    /// EOS strings the vocabulary does not know are skipped with a warning.
    pub fn resolve(
        name: &str,
        entry: &ModelEntry,
        descriptor: &ModelDescriptor,
        tokenizer: &dyn Tokenizer,
    ) -> Result<Self> {
        let template = ChatTemplate::from_tags(&entry.tokens)?;

        let mut eos_ids = Vec::new();
        for token in std::iter::once(&template.end).chain(entry.eos_ids.iter()) {
            match tokenizer.token_to_id(token) {
                Some(id) if !eos_ids.contains(&id) => eos_ids.push(id),
                Some(_) => {}
                None => tracing::warn!(model = %name, token = %token, "EOS token not in vocabulary"),
            }
        }
        if eos_ids.is_empty() {
            return Err(OnllmError::Model(format!(
                "model {name} has no resolvable end-of-sequence token"
            )));
        }

        Ok(Self {
            name: name.to_string(),
            template,
            eos_ids,
            num_layers: descriptor.num_hidden_layers,
            num_kv_heads: descriptor.num_key_value_heads,
            head_dim: descriptor.head_dim,
            needs_attention_mask: entry.att_mask,
        })
    }

    pub fn is_eos(&self, token: TokenId) -> bool {
        self.eos_ids.contains(&token)
    }

    /// An empty cache with this model's geometry (batch 1).
    pub fn new_cache(&self) -> KVResult<KVCacheState> {
        KVCacheState::initialize(1, self.num_layers, self.num_kv_heads, self.head_dim)
    }
}

/// A selected model: spec plus the shared tokenizer and engine handles.
/// Read-only after load, shared with the worker thread.
#[derive(Clone)]
pub struct LoadedModel {
    pub spec: ModelSpec,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub backend: Arc<dyn InferenceBackend>,
}

impl LoadedModel {
    pub fn new(
        spec: ModelSpec,
        tokenizer: Arc<dyn Tokenizer>,
        backend: Arc<dyn InferenceBackend>,
    ) -> Self {
        Self {
            spec,
            tokenizer,
            backend,
        }
    }

    /// Load a model directory with ONNX Runtime and its `tokenizer.json`.
    #[cfg(feature = "onnx")]
    pub fn from_dir(name: &str, entry: &ModelEntry, dir: &Path) -> Result<Self> {
        use onllm_engine::OnnxBackend;
        use onllm_tokenizer::HfTokenizer;

        let missing = check_model_files(dir);
        if !missing.is_empty() {
            return Err(OnllmError::Model(format!(
                "model {name} is incomplete, missing: {}",
                missing
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        let descriptor = ModelDescriptor::from_file(&dir.join("config.json"))?;
        let tokenizer = HfTokenizer::from_file(&dir.join("tokenizer.json"))?;
        let spec = ModelSpec::resolve(name, entry, &descriptor, &tokenizer)?;
        let backend = OnnxBackend::from_file(&dir.join(REQUIRED_FILES[2]), descriptor)?;

        tracing::info!(
            model = %name,
            layers = spec.num_layers,
            kv_heads = spec.num_kv_heads,
            head_dim = spec.head_dim,
            "model loaded"
        );
        Ok(Self::new(spec, Arc::new(tokenizer), Arc::new(backend)))
    }
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel").field("spec", &self.spec).finish_non_exhaustive()
    }
}
