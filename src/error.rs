//! Error types for the onllm crate.

use onllm_engine::EngineError;
use onllm_kv::KVError;
use onllm_rag::RagError;
use onllm_sampling::SamplingError;
use onllm_tokenizer::TokenizerError;
use thiserror::Error;

/// Top-level error type for onllm operations.
#[derive(Error, Debug)]
pub enum OnllmError {
    #[error("Model error: {0}")]
    Model(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(#[from] TokenizerError),

    #[error("Inference error: {0}")]
    Engine(#[from] EngineError),

    #[error("Cache error: {0}")]
    Cache(#[from] KVError),

    #[error("Sampling error: {0}")]
    Sampling(#[from] SamplingError),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RagError),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OnllmError>;

/// Why [`ChatSession::submit`](crate::ChatSession::submit) refused a message.
///
/// Rejections are synchronous: no background work is started.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Please select a model first!")]
    NoModel,

    #[error("Please wait for the current response")]
    Busy,

    #[error("Please type a message!")]
    EmptyInput,

    #[error("The generation worker is not running")]
    WorkerUnavailable,
}

impl OnllmError {
    /// The wrapped error's own message, without this type's category prefix.
    pub fn reason(&self) -> String {
        match self {
            OnllmError::Model(m) | OnllmError::Worker(m) | OnllmError::Config(m) => m.clone(),
            OnllmError::Tokenizer(e) => e.to_string(),
            OnllmError::Engine(e) => e.to_string(),
            OnllmError::Cache(e) => e.to_string(),
            OnllmError::Sampling(e) => e.to_string(),
            OnllmError::Retrieval(e) => e.to_string(),
            OnllmError::Io(e) => e.to_string(),
            OnllmError::Json(e) => e.to_string(),
        }
    }
}
