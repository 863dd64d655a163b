//! # onllm-kv
//!
//! Key/value cache state for onllm's decode loop.
//!
//! Supports:
//! - **Initialize**: one key and one value tensor per layer, all at sequence length 0
//! - **Advance**: replace every tensor with the engine's `present` output for the step
//! - **Atomic steps**: a step is staged with [`KVUpdate`] and only committed when every
//!   layer/kind pair is present with a consistent shape
//! - **Memory tracking**: byte accounting over the stored tensors
//!
//! Tensors are laid out `[batch, heads, seq_len, head_dim]`, the layout decoder-only
//! ONNX exports use for `past_key_values.*` and `present.*`.

use std::fmt;

/// Shape of one cache tensor: `[batch, heads, seq_len, head_dim]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KVShape {
    pub batch: usize,
    pub n_heads: usize,
    pub seq_len: usize,
    pub head_dim: usize,
}

impl KVShape {
    pub fn new(batch: usize, n_heads: usize, seq_len: usize, head_dim: usize) -> Self {
        Self {
            batch,
            n_heads,
            seq_len,
            head_dim,
        }
    }

    pub fn total_elements(&self) -> usize {
        self.batch * self.n_heads * self.seq_len * self.head_dim
    }

    pub fn dims(&self) -> [usize; 4] {
        [self.batch, self.n_heads, self.seq_len, self.head_dim]
    }

    /// Same batch, head count and head dimension; sequence length may differ.
    pub fn compatible_with(&self, other: &KVShape) -> bool {
        self.batch == other.batch && self.n_heads == other.n_heads && self.head_dim == other.head_dim
    }

    fn with_seq_len(self, seq_len: usize) -> Self {
        Self { seq_len, ..self }
    }
}

impl fmt::Display for KVShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[batch:{}, heads:{}, seq:{}, dim:{}]",
            self.batch, self.n_heads, self.seq_len, self.head_dim
        )
    }
}

/// Which half of a layer's cache a tensor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KVKind {
    Key,
    Value,
}

impl KVKind {
    pub const ALL: [KVKind; 2] = [KVKind::Key, KVKind::Value];

    /// Name used in engine input/output names (`past_key_values.0.key`).
    pub fn as_str(&self) -> &'static str {
        match self {
            KVKind::Key => "key",
            KVKind::Value => "value",
        }
    }

    fn slot(self) -> usize {
        match self {
            KVKind::Key => 0,
            KVKind::Value => 1,
        }
    }
}

impl fmt::Display for KVKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for KV cache operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KVError {
    #[error("Invalid cache geometry: {0}")]
    InvalidGeometry(String),

    #[error("Tensor data length mismatch for {shape}: expected {expected}, got {got}")]
    DataLength {
        shape: KVShape,
        expected: usize,
        got: usize,
    },

    #[error("Layer {layer} out of range (cache has {n_layers} layers)")]
    LayerOutOfRange { layer: usize, n_layers: usize },

    #[error("Shape mismatch at layer {layer} {kind}: expected {expected}, got {got}")]
    ShapeMismatch {
        layer: usize,
        kind: KVKind,
        expected: KVShape,
        got: KVShape,
    },

    #[error("Layer {layer} {kind} staged twice in one step")]
    DuplicateEntry { layer: usize, kind: KVKind },

    #[error("Layer {layer} {kind} missing from step")]
    MissingEntry { layer: usize, kind: KVKind },

    #[error("Sequence length diverged at layer {layer} {kind}: expected {expected}, got {got}")]
    SeqLenMismatch {
        layer: usize,
        kind: KVKind,
        expected: usize,
        got: usize,
    },

    #[error("Cache did not grow: current seq_len {current}, step seq_len {got}")]
    NotAdvanced { current: usize, got: usize },
}

pub type KVResult<T> = Result<T, KVError>;

/// One key or value tensor, flattened row-major over [`KVShape::dims`].
#[derive(Debug, Clone, PartialEq)]
pub struct KVTensor {
    shape: KVShape,
    data: Vec<f32>,
}

impl KVTensor {
    /// Wrap flattened data, checking its length against `shape`.
    pub fn new(shape: KVShape, data: Vec<f32>) -> KVResult<Self> {
        let expected = shape.total_elements();
        if data.len() != expected {
            return Err(KVError::DataLength {
                shape,
                expected,
                got: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    /// A zero-length tensor (`seq_len == 0`).
    pub fn empty(batch: usize, n_heads: usize, head_dim: usize) -> Self {
        Self {
            shape: KVShape::new(batch, n_heads, 0, head_dim),
            data: Vec::new(),
        }
    }

    /// A zero-filled tensor of the given shape.
    pub fn zeros(shape: KVShape) -> Self {
        Self {
            data: vec![0.0; shape.total_elements()],
            shape,
        }
    }

    pub fn shape(&self) -> KVShape {
        self.shape
    }

    pub fn seq_len(&self) -> usize {
        self.shape.seq_len
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn memory_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }
}

/// Key and value tensors of one transformer layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerKV {
    pub key: KVTensor,
    pub value: KVTensor,
}

impl LayerKV {
    pub fn new(key: KVTensor, value: KVTensor) -> Self {
        Self { key, value }
    }

    pub fn get(&self, kind: KVKind) -> &KVTensor {
        match kind {
            KVKind::Key => &self.key,
            KVKind::Value => &self.value,
        }
    }

    fn get_mut(&mut self, kind: KVKind) -> &mut KVTensor {
        match kind {
            KVKind::Key => &mut self.key,
            KVKind::Value => &mut self.value,
        }
    }
}

/// Cache for every layer of one generation.
///
/// # Invariants
/// - Every layer holds both a key and a value tensor
/// - All tensors share batch, head count, head dimension and sequence length
/// - Sequence length only grows between [`clear`](Self::clear) calls
#[derive(Debug, Clone)]
pub struct KVCacheState {
    layers: Vec<LayerKV>,
    batch: usize,
    n_heads: usize,
    head_dim: usize,
}

impl KVCacheState {
    /// Create a cache with every (layer, kind) present at sequence length 0.
    ///
    /// # Errors
    /// `InvalidGeometry` when any dimension is zero.
    pub fn initialize(
        batch: usize,
        num_layers: usize,
        num_kv_heads: usize,
        head_dim: usize,
    ) -> KVResult<Self> {
        if batch == 0 || num_layers == 0 || num_kv_heads == 0 || head_dim == 0 {
            return Err(KVError::InvalidGeometry(format!(
                "batch={batch}, layers={num_layers}, kv_heads={num_kv_heads}, head_dim={head_dim}"
            )));
        }

        let layers = (0..num_layers)
            .map(|_| {
                LayerKV::new(
                    KVTensor::empty(batch, num_kv_heads, head_dim),
                    KVTensor::empty(batch, num_kv_heads, head_dim),
                )
            })
            .collect();

        Ok(Self {
            layers,
            batch,
            n_heads: num_kv_heads,
            head_dim,
        })
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Current sequence length, shared by every tensor.
    pub fn seq_len(&self) -> usize {
        self.layers[0].key.seq_len()
    }

    /// Shape every tensor currently has.
    pub fn shape(&self) -> KVShape {
        KVShape::new(self.batch, self.n_heads, self.seq_len(), self.head_dim)
    }

    pub fn layers(&self) -> &[LayerKV] {
        &self.layers
    }

    pub fn layer(&self, layer: usize) -> Option<&LayerKV> {
        self.layers.get(layer)
    }

    pub fn get(&self, layer: usize, kind: KVKind) -> Option<&KVTensor> {
        self.layers.get(layer).map(|l| l.get(kind))
    }

    /// Open a step. Nothing changes until [`KVUpdate::commit`] succeeds.
    pub fn update(&mut self) -> KVUpdate<'_> {
        let staged = vec![[None, None]; self.layers.len()];
        KVUpdate {
            cache: self,
            staged,
        }
    }

    /// Replace every layer in one step, in layer order.
    pub fn advance_all(&mut self, present: Vec<LayerKV>) -> KVResult<usize> {
        let mut step = self.update();
        for (layer, kv) in present.into_iter().enumerate() {
            step.advance(layer, KVKind::Key, kv.key)?;
            step.advance(layer, KVKind::Value, kv.value)?;
        }
        step.commit()
    }

    /// Drop all cached positions, keeping the geometry.
    pub fn clear(&mut self) {
        for layer in &mut self.layers {
            layer.key = KVTensor::empty(self.batch, self.n_heads, self.head_dim);
            layer.value = KVTensor::empty(self.batch, self.n_heads, self.head_dim);
        }
    }

    /// Bytes held across all layers.
    pub fn memory_bytes(&self) -> usize {
        self.layers
            .iter()
            .map(|l| l.key.memory_bytes() + l.value.memory_bytes())
            .sum()
    }
}

/// A staged cache step.
///
/// Each [`advance`](Self::advance) is checked immediately against the cache geometry;
/// [`commit`](Self::commit) checks the step as a whole. Dropping an uncommitted update
/// leaves the cache untouched.
pub struct KVUpdate<'a> {
    cache: &'a mut KVCacheState,
    staged: Vec<[Option<KVTensor>; 2]>,
}

impl KVUpdate<'_> {
    /// Stage the engine's present tensor for one layer/kind.
    pub fn advance(&mut self, layer: usize, kind: KVKind, tensor: KVTensor) -> KVResult<()> {
        let n_layers = self.staged.len();
        let expected = self.cache.shape();
        let slot = self
            .staged
            .get_mut(layer)
            .ok_or(KVError::LayerOutOfRange { layer, n_layers })?;

        if !tensor.shape().compatible_with(&expected) {
            return Err(KVError::ShapeMismatch {
                layer,
                kind,
                expected: expected.with_seq_len(tensor.seq_len()),
                got: tensor.shape(),
            });
        }

        let entry = &mut slot[kind.slot()];
        if entry.is_some() {
            return Err(KVError::DuplicateEntry { layer, kind });
        }
        *entry = Some(tensor);
        Ok(())
    }

    /// Apply the step. Returns the new sequence length.
    ///
    /// # Errors
    /// - `MissingEntry`: a layer/kind was not staged
    /// - `SeqLenMismatch`: staged tensors disagree on sequence length
    /// - `NotAdvanced`: the sequence length did not grow
    pub fn commit(self) -> KVResult<usize> {
        let current = self.cache.seq_len();
        let mut step_len = None;

        for (layer, slot) in self.staged.iter().enumerate() {
            for kind in KVKind::ALL {
                let tensor = slot[kind.slot()]
                    .as_ref()
                    .ok_or(KVError::MissingEntry { layer, kind })?;
                match step_len {
                    None => step_len = Some(tensor.seq_len()),
                    Some(expected) if expected != tensor.seq_len() => {
                        return Err(KVError::SeqLenMismatch {
                            layer,
                            kind,
                            expected,
                            got: tensor.seq_len(),
                        });
                    }
                    Some(_) => {}
                }
            }
        }

        let new_len = step_len.unwrap_or(current);
        if new_len <= current {
            return Err(KVError::NotAdvanced {
                current,
                got: new_len,
            });
        }

        for (layer, slot) in self.staged.into_iter().enumerate() {
            for (kind, tensor) in KVKind::ALL.into_iter().zip(slot) {
                if let Some(tensor) = tensor {
                    *self.cache.layers[layer].get_mut(kind) = tensor;
                }
            }
        }

        Ok(new_len)
    }
}
