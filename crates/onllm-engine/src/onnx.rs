//! ONNX Runtime backend.
//!
//! Loads an exported decoder (`onnx/model_int8.onnx` in the model directory) and
//! runs one step per call. The `ort` session needs `&mut` access to run, so it
//! lives behind a mutex; a session is only ever driven by one decode loop at a time.

use std::path::Path;
use std::sync::Mutex;

use onllm_kv::{KVKind, KVShape, KVTensor, LayerKV};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{DynValue, Tensor};

use crate::{
    past_input_name, present_output_name, EngineError, InferenceBackend, Logits, ModelDescriptor,
    Result, StepInputs, StepOutputs,
};

/// Decoder graph executed by ONNX Runtime.
pub struct OnnxBackend {
    session: Mutex<Session>,
    input_names: Vec<String>,
    output_names: Vec<String>,
    descriptor: ModelDescriptor,
}

impl OnnxBackend {
    /// Build a session from an `.onnx` file.
    pub fn from_file(path: &Path, descriptor: ModelDescriptor) -> Result<Self> {
        let session = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.commit_from_file(path))
            .map_err(|e| {
                EngineError::ModelLoad(format!("failed to load {}: {e}", path.display()))
            })?;

        let input_names: Vec<String> = session.inputs.iter().map(|i| i.name.clone()).collect();
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        tracing::info!(
            path = %path.display(),
            inputs = input_names.len(),
            outputs = output_names.len(),
            "onnx session ready"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_names,
            output_names,
            descriptor,
        })
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    fn accepts(&self, name: &str) -> bool {
        self.input_names.iter().any(|n| n == name)
    }

    /// Name of the present tensor for a layer/kind; positional when the graph
    /// does not use the `present.*` naming.
    fn present_name(&self, layer: usize, kind: KVKind) -> Result<String> {
        let named = present_output_name(layer, kind);
        if self.output_names.iter().any(|n| *n == named) {
            return Ok(named);
        }
        let slot = match kind {
            KVKind::Key => 0,
            KVKind::Value => 1,
        };
        self.output_names
            .get(1 + layer * 2 + slot)
            .cloned()
            .ok_or(EngineError::MissingOutput(named))
    }
}

fn ids_value(values: &[i64]) -> Result<DynValue> {
    Tensor::from_array((vec![1i64, values.len() as i64], values.to_vec()))
        .map(|t| t.into_dyn())
        .map_err(|e| EngineError::Inference(e.to_string()))
}

fn kv_value(tensor: &KVTensor) -> Result<DynValue> {
    let shape: Vec<i64> = tensor.shape().dims().iter().map(|&d| d as i64).collect();
    Tensor::from_array((shape, tensor.data().to_vec()))
        .map(|t| t.into_dyn())
        .map_err(|e| EngineError::Inference(e.to_string()))
}

fn dims<const N: usize>(name: &str, shape: &[i64]) -> Result<[usize; N]> {
    if shape.len() != N || shape.iter().any(|&d| d < 0) {
        return Err(EngineError::Shape(format!("{name}: expected rank {N}, got {shape:?}")));
    }
    let mut out = [0usize; N];
    for (o, &d) in out.iter_mut().zip(shape) {
        *o = d as usize;
    }
    Ok(out)
}

impl InferenceBackend for OnnxBackend {
    fn run(&self, inputs: StepInputs<'_>) -> Result<StepOutputs> {
        let mut feed: Vec<(String, DynValue)> = Vec::with_capacity(3 + inputs.past.n_layers() * 2);
        feed.push(("input_ids".to_string(), ids_value(inputs.input_ids)?));
        if let Some(mask) = inputs.attention_mask {
            if self.accepts("attention_mask") {
                feed.push(("attention_mask".to_string(), ids_value(mask)?));
            }
        }
        if self.accepts("position_ids") {
            feed.push(("position_ids".to_string(), ids_value(inputs.position_ids)?));
        }
        for (layer, kv) in inputs.past.layers().iter().enumerate() {
            for kind in KVKind::ALL {
                feed.push((past_input_name(layer, kind), kv_value(kv.get(kind))?));
            }
        }

        let mut session = self
            .session
            .lock()
            .map_err(|_| EngineError::Inference("onnx session lock poisoned".to_string()))?;
        let outputs = session
            .run(feed)
            .map_err(|e| EngineError::Inference(e.to_string()))?;

        let logits_name = self
            .output_names
            .iter()
            .find(|n| n.as_str() == "logits")
            .or_else(|| self.output_names.first())
            .ok_or_else(|| EngineError::MissingOutput("logits".to_string()))?;
        let (shape, data) = outputs
            .get(logits_name.as_str())
            .ok_or_else(|| EngineError::MissingOutput(logits_name.clone()))?
            .try_extract_tensor::<f32>()
            .map_err(|e| EngineError::Inference(e.to_string()))?;
        let logits = Logits::new(dims::<3>("logits", shape)?, data.to_vec())?;

        let mut present = Vec::with_capacity(inputs.past.n_layers());
        for layer in 0..inputs.past.n_layers() {
            let mut pair = Vec::with_capacity(2);
            for kind in KVKind::ALL {
                let name = self.present_name(layer, kind)?;
                let (shape, data) = outputs
                    .get(name.as_str())
                    .ok_or_else(|| EngineError::MissingOutput(name.clone()))?
                    .try_extract_tensor::<f32>()
                    .map_err(|e| EngineError::Inference(e.to_string()))?;
                let [b, h, s, d] = dims::<4>(&name, shape)?;
                pair.push(KVTensor::new(KVShape::new(b, h, s, d), data.to_vec())?);
            }
            let value = pair.pop();
            let key = pair.pop();
            match (key, value) {
                (Some(key), Some(value)) => present.push(LayerKV::new(key, value)),
                _ => return Err(EngineError::MissingOutput(present_output_name(layer, KVKind::Key))),
            }
        }

        Ok(StepOutputs { logits, present })
    }
}
