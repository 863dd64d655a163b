//! Integration tests for onllm-engine.
//!
//! Validates:
//! - A backend implementing the graph contract can drive a KV cache step by step
//! - Present tensors returned by a backend are accepted by `KVCacheState::advance_all`
//! - Descriptor loading from disk

use std::io::Write;
use std::sync::Mutex;

use onllm_engine::*;
use onllm_kv::{KVCacheState, KVShape, KVTensor, LayerKV};

/// Backend that grows the cache by the number of input ids and records what it saw.
struct EchoBackend {
    layers: usize,
    heads: usize,
    head_dim: usize,
    vocab: usize,
    seen: Mutex<Vec<(Vec<i64>, Option<Vec<i64>>, Vec<i64>, usize)>>,
}

impl InferenceBackend for EchoBackend {
    fn run(&self, inputs: StepInputs<'_>) -> Result<StepOutputs> {
        self.seen.lock().unwrap().push((
            inputs.input_ids.to_vec(),
            inputs.attention_mask.map(|m| m.to_vec()),
            inputs.position_ids.to_vec(),
            inputs.past.seq_len(),
        ));

        let seq = inputs.past.seq_len() + inputs.input_ids.len();
        let shape = KVShape::new(1, self.heads, seq, self.head_dim);
        let present = (0..self.layers)
            .map(|_| LayerKV::new(KVTensor::zeros(shape), KVTensor::zeros(shape)))
            .collect();

        let n = inputs.input_ids.len();
        let mut data = vec![0.0; n * self.vocab];
        let last = *inputs.input_ids.last().unwrap() as usize;
        data[(n - 1) * self.vocab + (last + 1) % self.vocab] = 1.0;
        Ok(StepOutputs {
            logits: Logits::new([1, n, self.vocab], data)?,
            present,
        })
    }
}

#[test]
fn backend_drives_cache_growth() {
    let backend = EchoBackend {
        layers: 2,
        heads: 2,
        head_dim: 4,
        vocab: 10,
        seen: Mutex::new(Vec::new()),
    };
    let mut cache = KVCacheState::initialize(1, 2, 2, 4).unwrap();

    let prompt = [3i64, 4, 5];
    let positions = [0i64, 1, 2];
    let mask = [1i64; 3];
    let out = backend
        .run(StepInputs {
            input_ids: &prompt,
            attention_mask: Some(&mask),
            position_ids: &positions,
            past: &cache,
        })
        .unwrap();
    assert_eq!(out.logits.last_row(0).unwrap()[6], 1.0);
    cache.advance_all(out.present).unwrap();
    assert_eq!(cache.seq_len(), 3);

    let out = backend
        .run(StepInputs {
            input_ids: &[6],
            attention_mask: None,
            position_ids: &[3],
            past: &cache,
        })
        .unwrap();
    cache.advance_all(out.present).unwrap();
    assert_eq!(cache.seq_len(), 4);

    let seen = backend.seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].3, 0);
    assert_eq!(seen[1], (vec![6], None, vec![3], 3));
}

#[test]
fn descriptor_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"num_hidden_layers": 30, "num_key_value_heads": 3, "head_dim": 64}}"#
    )
    .unwrap();

    let d = ModelDescriptor::from_file(file.path()).unwrap();
    assert_eq!(d.num_hidden_layers, 30);
    assert_eq!(d.num_key_value_heads, 3);
    assert_eq!(d.head_dim, 64);
}

#[test]
fn descriptor_missing_file_is_load_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = ModelDescriptor::from_file(&dir.path().join("config.json")).unwrap_err();
    assert!(matches!(err, EngineError::ModelLoad(_)));
}
