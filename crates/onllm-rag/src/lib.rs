//! # onllm-rag
//!
//! Document-grounded answering for onllm.
//! A document is split into overlapping word chunks, chunks are ranked against the
//! question, and the best ones are injected into a single grounded user message.
//!
//! Ranking is dense ([`EmbeddingIndex`], cosine over sentence embeddings) when an
//! [`Embedder`] is available and lexical ([`DocumentIndex`], TF-IDF) otherwise.
//! The `onnx` feature adds [`OnnxEmbedder`] for exported MiniLM-style encoders.

pub mod config;
pub mod embedding;
pub mod error;
pub mod index;
pub mod ingest;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod prompt;

pub use config::RagConfig;
pub use embedding::{cosine_similarity, Embedder, EmbeddingIndex};
pub use error::{RagError, Result};
pub use index::{split_chunks, DocumentIndex};
pub use ingest::{spawn_embedding_ingest, spawn_ingest};
#[cfg(feature = "onnx")]
pub use onnx::OnnxEmbedder;
pub use prompt::{Citation, GroundedPromptBuilder};

/// Represents a retrieved document chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub score: f32,
}

/// Core trait for retrieval.
pub trait Retriever: Send + Sync {
    /// Retrieve the `top_k` most relevant chunks for a query, best first.
    fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<Chunk>>;
}
