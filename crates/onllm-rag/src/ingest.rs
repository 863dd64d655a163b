//! Background document ingestion.
//!
//! Reading and indexing a document can take a while on a phone, so it runs on its own
//! thread; the result arrives on a channel the caller polls on its own turn.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver};

use crate::{DocumentIndex, Embedder, EmbeddingIndex, RagConfig, RagError, Result};

/// Read a UTF-8 text document and index it lexically on a background thread.
///
/// Exactly one message is delivered on the returned channel.
pub fn spawn_ingest(path: impl Into<PathBuf>, config: RagConfig) -> Receiver<Result<DocumentIndex>> {
    spawn_indexer(path.into(), move |source, text| {
        DocumentIndex::build(source, text, &config)
    })
}

/// Read a UTF-8 text document and embed its chunks on a background thread.
///
/// Exactly one message is delivered on the returned channel.
pub fn spawn_embedding_ingest(
    path: impl Into<PathBuf>,
    config: RagConfig,
    embedder: Arc<dyn Embedder>,
) -> Receiver<Result<EmbeddingIndex>> {
    spawn_indexer(path.into(), move |source, text| {
        EmbeddingIndex::build(source, text, &config, embedder)
    })
}

fn spawn_indexer<T, F>(path: PathBuf, build: F) -> Receiver<Result<T>>
where
    T: Send + 'static,
    F: FnOnce(String, &str) -> Result<T> + Send + 'static,
{
    let (tx, rx) = bounded(1);

    let worker_tx = tx.clone();
    let spawned = thread::Builder::new()
        .name("doc-ingest".into())
        .spawn(move || {
            let result = read(&path).and_then(|(source, text)| build(source, &text));
            match &result {
                Ok(_) => tracing::info!(path = %path.display(), "document ready"),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "document ingestion failed"),
            }
            let _ = worker_tx.send(result);
        });

    if let Err(e) = spawned {
        let _ = tx.send(Err(RagError::Worker(e.to_string())));
    }
    rx
}

fn read(path: &Path) -> Result<(String, String)> {
    let text = std::fs::read_to_string(path)?;
    let source = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok((source, text))
}
