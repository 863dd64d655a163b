//! Dense retrieval over sentence embeddings.
//!
//! Chunks are embedded once at ingest time; a question is embedded on each
//! retrieval and ranked against them by cosine similarity. This finds chunks
//! that answer a paraphrased question with none of its words.

use std::sync::Arc;

use crate::index::{by_score_desc, chunk_id, split_chunks};
use crate::{Chunk, RagConfig, RagError, Result, Retriever};

/// Maps text to a fixed-size vector.
pub trait Embedder: Send + Sync {
    /// Embed a single text.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts, in order.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Length of every vector this embedder returns.
    fn dimension(&self) -> usize;
}

/// Cosine similarity; zero when either vector has no length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[derive(Debug, Clone)]
struct EmbeddedChunk {
    id: String,
    text: String,
    vector: Vec<f32>,
}

/// Chunks of one document with their embeddings.
pub struct EmbeddingIndex {
    source: String,
    chunks: Vec<EmbeddedChunk>,
    embedder: Arc<dyn Embedder>,
}

impl EmbeddingIndex {
    /// Split `text` into word windows and embed each one.
    ///
    /// # Errors
    /// `EmptyDocument` when the text has no words; `Embedding` when the
    /// embedder fails or returns vectors of the wrong size.
    pub fn build(
        source: impl Into<String>,
        text: &str,
        config: &RagConfig,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let source = source.into();
        let texts = split_chunks(text, config);
        if texts.is_empty() {
            return Err(RagError::EmptyDocument(source));
        }

        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let vectors = embedder.embed_batch(&refs)?;
        if vectors.len() != texts.len() {
            return Err(RagError::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }

        let dimension = embedder.dimension();
        let mut chunks = Vec::with_capacity(texts.len());
        for (i, (text, vector)) in texts.into_iter().zip(vectors).enumerate() {
            check_dimension(&vector, dimension)?;
            chunks.push(EmbeddedChunk {
                id: chunk_id(&source, i),
                text,
                vector,
            });
        }

        tracing::debug!(source = %source, chunks = chunks.len(), dimension, "document embedded");
        Ok(Self {
            source,
            chunks,
            embedder,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

fn check_dimension(vector: &[f32], dimension: usize) -> Result<()> {
    if vector.len() != dimension {
        return Err(RagError::Embedding(format!(
            "expected dimension {dimension}, got {}",
            vector.len()
        )));
    }
    Ok(())
}

impl Retriever for EmbeddingIndex {
    fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<Chunk>> {
        let query_vector = self.embedder.embed(query)?;
        check_dimension(&query_vector, self.embedder.dimension())?;

        let mut scored: Vec<Chunk> = self
            .chunks
            .iter()
            .map(|c| Chunk {
                id: c.id.clone(),
                text: c.text.clone(),
                score: cosine_similarity(&query_vector, &c.vector),
            })
            .filter(|c| c.score.is_finite())
            .collect();

        scored.sort_by(by_score_desc);
        scored.truncate(top_k);
        Ok(scored)
    }
}

impl std::fmt::Debug for EmbeddingIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingIndex")
            .field("source", &self.source)
            .field("chunks", &self.chunks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Vector of word lengths, padded to four.
    struct LengthEmbedder;

    impl Embedder for LengthEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut v: Vec<f32> = text.split_whitespace().map(|w| w.len() as f32).take(4).collect();
            v.resize(4, 0.0);
            Ok(v)
        }

        fn dimension(&self) -> usize {
            4
        }
    }

    struct WrongSize;

    impl Embedder for WrongSize {
        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0; 3])
        }

        fn dimension(&self) -> usize {
            4
        }
    }

    #[test]
    fn cosine_of_parallel_and_orthogonal() {
        assert!((cosine_similarity(&[1.0, 2.0], &[2.0, 4.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn chunks_match_lexical_index() {
        let config = RagConfig::new().with_chunk_words(2).with_overlap_words(0);
        let index = EmbeddingIndex::build("d", "a bb ccc", &config, Arc::new(LengthEmbedder)).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.chunks[1].id, "d#1");
        assert_eq!(index.chunks[1].text, "ccc");
    }

    #[test]
    fn wrong_dimension_is_rejected() {
        let err = EmbeddingIndex::build("d", "a b", &RagConfig::default(), Arc::new(WrongSize)).unwrap_err();
        assert!(matches!(err, RagError::Embedding(_)));
    }

    #[test]
    fn empty_document_rejected() {
        assert!(matches!(
            EmbeddingIndex::build("d", " ", &RagConfig::default(), Arc::new(LengthEmbedder)),
            Err(RagError::EmptyDocument(_))
        ));
    }
}
