//! In-memory chunk index with lexical TF-IDF ranking.

use std::collections::{HashMap, HashSet};

use crate::{Chunk, RagConfig, RagError, Result, Retriever};

#[derive(Debug, Clone)]
struct IndexedChunk {
    id: String,
    text: String,
    term_counts: HashMap<String, usize>,
    n_terms: usize,
}

/// Chunks of one document plus the statistics needed to rank them.
#[derive(Debug, Clone)]
pub struct DocumentIndex {
    source: String,
    chunks: Vec<IndexedChunk>,
    doc_freq: HashMap<String, usize>,
}

/// Lowercased alphanumeric terms of `text`.
pub fn terms(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// Overlapping word windows of `text`; empty when it has no words.
pub fn split_chunks(text: &str, config: &RagConfig) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    split_words(&words, config)
}

fn split_words(words: &[&str], config: &RagConfig) -> Vec<String> {
    let size = config.chunk_words.max(1);
    let stride = config.stride();
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < words.len() {
        let end = (start + size).min(words.len());
        chunks.push(words[start..end].join(" "));
        if end == words.len() {
            break;
        }
        start += stride;
    }
    chunks
}

pub(crate) fn chunk_id(source: &str, index: usize) -> String {
    format!("{source}#{index}")
}

pub(crate) fn by_score_desc(a: &Chunk, b: &Chunk) -> std::cmp::Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(std::cmp::Ordering::Equal)
}

impl DocumentIndex {
    /// Split `text` into overlapping word windows and index them.
    ///
    /// # Errors
    /// `EmptyDocument` when the text has no words.
    pub fn build(source: impl Into<String>, text: &str, config: &RagConfig) -> Result<Self> {
        let source = source.into();
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.is_empty() {
            return Err(RagError::EmptyDocument(source));
        }

        let chunks: Vec<IndexedChunk> = split_words(&words, config)
            .into_iter()
            .enumerate()
            .map(|(i, text)| {
                let mut term_counts = HashMap::new();
                let mut n_terms = 0;
                for term in terms(&text) {
                    *term_counts.entry(term).or_insert(0) += 1;
                    n_terms += 1;
                }
                IndexedChunk {
                    id: chunk_id(&source, i),
                    text,
                    term_counts,
                    n_terms,
                }
            })
            .collect();

        let mut doc_freq = HashMap::new();
        for chunk in &chunks {
            for term in chunk.term_counts.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
        }

        tracing::debug!(source = %source, words = words.len(), chunks = chunks.len(), "document indexed");
        Ok(Self {
            source,
            chunks,
            doc_freq,
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

    fn score(&self, chunk: &IndexedChunk, query_terms: &HashSet<String>) -> f32 {
        if chunk.n_terms == 0 {
            return 0.0;
        }
        let n = self.chunks.len() as f32;
        let raw: f32 = query_terms
            .iter()
            .filter_map(|t| {
                let tf = *chunk.term_counts.get(t)? as f32;
                let df = *self.doc_freq.get(t)? as f32;
                Some((1.0 + tf.ln()) * (1.0 + n / df).ln())
            })
            .sum();
        raw / (chunk.n_terms as f32).sqrt()
    }
}

impl Retriever for DocumentIndex {
    fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<Chunk>> {
        let query_terms: HashSet<String> = terms(query).collect();
        let mut scored: Vec<Chunk> = self
            .chunks
            .iter()
            .map(|c| Chunk {
                id: c.id.clone(),
                text: c.text.clone(),
                score: self.score(c, &query_terms),
            })
            .filter(|c| c.score > 0.0)
            .collect();

        scored.sort_by(by_score_desc);
        scored.truncate(top_k);
        Ok(scored)
    }
}
