//! Checkpoint sources: named tensors enumerated in a stable load order.
//!
//! - [`SafetensorsDir`]: every `*.safetensors` shard in a directory, memory-mapped
//! - [`MemoryCheckpoint`]: tensors held in memory (synthetic models, tests)

pub mod safetensors;

use std::collections::BTreeSet;

use crate::error::InferenceError;
use crate::tensor::HostTensor;

pub use safetensors::SafetensorsDir;

/// A set of named tensors that can be read on demand.
///
/// Names are reported in load order: shard by shard (lexicographic file
/// order), and by name within a shard. A name may appear more than once when
/// it is present in several shards; the later occurrence wins during loading.
pub trait CheckpointSource {
    /// Every tensor name in load order, one entry per stored tensor.
    fn tensor_names(&self) -> Vec<&str>;

    /// Read the tensor at `index` of [`tensor_names`](Self::tensor_names).
    fn tensor(&self, index: usize) -> Result<HostTensor<'_>, InferenceError>;

    /// The distinct set of tensor names.
    fn name_set(&self) -> BTreeSet<&str> {
        self.tensor_names().into_iter().collect()
    }
}

/// An in-memory checkpoint. Tensors are enumerated in insertion order.
#[derive(Debug, Default, Clone)]
pub struct MemoryCheckpoint {
    tensors: Vec<(String, HostTensor<'static>)>,
}

impl MemoryCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a tensor. Pushing an existing name adds a second entry that
    /// is loaded after the first.
    pub fn push(&mut self, name: impl Into<String>, tensor: HostTensor<'static>) {
        self.tensors.push((name.into(), tensor));
    }

    /// Builder-style [`push`](Self::push).
    pub fn with(mut self, name: impl Into<String>, tensor: HostTensor<'static>) -> Self {
        self.push(name, tensor);
        self
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

impl CheckpointSource for MemoryCheckpoint {
    fn tensor_names(&self) -> Vec<&str> {
        self.tensors.iter().map(|(name, _)| name.as_str()).collect()
    }

    fn tensor(&self, index: usize) -> Result<HostTensor<'_>, InferenceError> {
        self.tensors
            .get(index)
            .map(|(_, t)| t.view())
            .ok_or_else(|| {
                InferenceError::Checkpoint(format!(
                    "tensor index {} out of range ({} tensors)",
                    index,
                    self.tensors.len()
                ))
            })
    }
}
