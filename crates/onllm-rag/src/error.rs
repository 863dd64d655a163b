//! Error types for onllm-rag.

/// Result type for onllm-rag operations.
pub type Result<T> = std::result::Result<T, RagError>;

/// Errors that can occur while ingesting or querying a document.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error("failed to read document: {0}")]
    Io(#[from] std::io::Error),

    #[error("document {0} has no text")]
    EmptyDocument(String),

    #[error("retrieval failed: {0}")]
    Retrieval(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("ingestion worker failed: {0}")]
    Worker(String),
}
