//! Configuration for document chunking.
//!
//! How many chunks a question retrieves and how much context the grounded
//! prompt may carry are per-question settings passed to
//! [`Retriever::retrieve`](crate::Retriever::retrieve) and
//! [`GroundedPromptBuilder`](crate::GroundedPromptBuilder).

/// Configuration for splitting documents into chunks.
#[derive(Clone, Debug, PartialEq)]
pub struct RagConfig {
    /// Words per chunk.
    pub chunk_words: usize,

    /// Words shared between consecutive chunks.
    pub overlap_words: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            chunk_words: 120,
            overlap_words: 20,
        }
    }
}

impl RagConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set chunk size in words.
    pub fn with_chunk_words(mut self, n: usize) -> Self {
        self.chunk_words = n;
        self
    }

    /// Set overlap in words.
    pub fn with_overlap_words(mut self, n: usize) -> Self {
        self.overlap_words = n;
        self
    }

    /// Step between chunk starts; always at least one word.
    pub fn stride(&self) -> usize {
        self.chunk_words.max(1).saturating_sub(self.overlap_words).max(1)
    }
}
