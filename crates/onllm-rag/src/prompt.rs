//! Grounded prompt builder with citation support.
//!
//! Turns retrieved chunks and a question into the single user message sent in
//! document-grounded mode.

use crate::Chunk;

/// A citation referencing a chunk used in the prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct Citation {
    /// Citation index (e.g., [1], [2]).
    pub index: usize,
    /// Chunk identifier.
    pub source_id: String,
    /// Relevance score from retrieval.
    pub score: f32,
}

/// Builds the grounded user message.
///
/// The prompt format:
/// ```text
/// Context:
/// [1] <chunk text>
/// [2] <chunk text>
///
/// Using only the context above, answer the question.
///
/// Question: <user query>
/// ```
pub struct GroundedPromptBuilder {
    chunks: Vec<Chunk>,
    max_context_chars: usize,
}

impl GroundedPromptBuilder {
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            max_context_chars: 2048,
        }
    }

    /// Set maximum context length in characters.
    pub fn max_context_chars(mut self, max: usize) -> Self {
        self.max_context_chars = max;
        self
    }

    pub fn add_chunk(&mut self, chunk: Chunk) {
        self.chunks.push(chunk);
    }

    pub fn with_chunks(mut self, chunks: impl IntoIterator<Item = Chunk>) -> Self {
        self.chunks.extend(chunks);
        self
    }

    /// Build the grounded prompt. Chunks are included best-first until the
    /// context budget is reached.
    pub fn build(&self, query: &str) -> (String, Vec<Citation>) {
        let mut prompt = String::from("Context:\n");
        let mut citations = Vec::new();
        let mut total_chars = 0;

        let mut sorted: Vec<_> = self.chunks.iter().collect();
        sorted.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        for chunk in sorted {
            let idx = citations.len() + 1;
            let line = format!("[{}] {}\n", idx, chunk.text.trim());
            let line_chars = line.chars().count();
            if total_chars + line_chars > self.max_context_chars {
                break;
            }

            total_chars += line_chars;
            prompt.push_str(&line);
            citations.push(Citation {
                index: idx,
                source_id: chunk.id.clone(),
                score: chunk.score,
            });
        }

        prompt.push_str("\nUsing only the context above, answer the question.\n\n");
        prompt.push_str(&format!("Question: {}\n", query.trim()));

        (prompt, citations)
    }
}

impl Default for GroundedPromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}
