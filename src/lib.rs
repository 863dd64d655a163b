//! On-device chat text generation.
//!
//! onllm turns a conversation into a token prompt, runs a decoder graph step by
//! step with a growing key/value cache, samples tokens and streams the decoded
//! text back to the caller.
//!
//! - [`prompt`]: role-tag chat templates ([`ChatTemplate`]).
//! - [`engine`]: the decode loop and its background worker.
//! - [`session`]: [`ChatSession`], history and the submit/cancel/event contract.
//! - [`model`]: the model registry and loaded model handles.
//!
//! The tensor runtime is behind [`onllm_engine::InferenceBackend`]; enable the
//! `onnx` feature for ONNX Runtime and HuggingFace tokenizers.

pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod model;
pub mod prompt;
pub mod session;

pub use config::{AppConfig, EarlyStop, GenerationConfig, SessionSettings};
pub use conversation::{Conversation, Message, Role};
pub use engine::{DecodeLoop, DecodeOutcome, Generation, GenerationStats, StopReason};
pub use error::{OnllmError, Result, SubmitError};
pub use model::{
    check_embedding_model_files, check_model_files, LoadedModel, ModelEntry, ModelRegistry,
    ModelSpec, Platform,
};
pub use prompt::ChatTemplate;
pub use session::{ChatResult, ChatSession, ResultRole, SessionEvent, SessionState};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
