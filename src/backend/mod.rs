//! Native engine contract.
//!
//! Defines the [`NativeEngine`] trait: the capability set the model handle and
//! loader consume from a compute engine. The engine owns device memory,
//! weight tensors and KV-cache state; this crate only holds opaque handles.
//!
//! - [`cpu::CpuEngine`]: pure-Rust reference engine (always available)
//! - `llaisys::LlaisysEngine`: bridge to the native shared library (feature `llaisys`)

pub mod cpu;
#[cfg(feature = "llaisys")]
pub mod llaisys;
#[cfg(test)]
pub(crate) mod scripted;

use std::fmt;
use std::str::FromStr;

use crate::engine::sampler::SamplingConfig;
use crate::error::InferenceError;
use crate::model::config::ModelMeta;
use crate::model::weights::WeightTable;

/// Device placement requested at model creation.
///
/// Discriminants are the native engine's device tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DeviceType {
    Cpu = 0,
    Nvidia = 1,
}

impl DeviceType {
    pub fn tag(&self) -> i32 {
        *self as i32
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Cpu => write!(f, "cpu"),
            DeviceType::Nvidia => write!(f, "nvidia"),
        }
    }
}

impl FromStr for DeviceType {
    type Err = InferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceType::Cpu),
            "nvidia" | "cuda" | "gpu" => Ok(DeviceType::Nvidia),
            other => Err(InferenceError::InvalidArgument(format!(
                "unknown device '{}' (expected cpu or nvidia)",
                other
            ))),
        }
    }
}

/// Operations a compute engine exposes to the model handle.
///
/// `Model` is the engine's model instance; `Tensor` is a copyable handle to
/// one engine-allocated weight tensor. All methods mirror one native entry
/// point and are called from a single thread per model.
pub trait NativeEngine: Send + Sync {
    type Model: Send;
    type Tensor: Copy + fmt::Debug + Send;

    /// Human-readable name for logs.
    fn name(&self) -> &str;

    /// Allocate a model and its weight tensors. `None` on failure.
    fn create_model(
        &self,
        meta: &ModelMeta,
        device: DeviceType,
        device_ids: &[i32],
    ) -> Option<Self::Model>;

    /// Release a model. Called at most once per created model.
    fn destroy_model(&self, model: Self::Model);

    /// The weight table allocated for `model`.
    fn model_weights(&self, model: &Self::Model) -> Option<WeightTable<Self::Tensor>>;

    /// Copy contiguous bytes of the model dtype into `tensor`.
    fn load_tensor(
        &self,
        model: &mut Self::Model,
        tensor: Self::Tensor,
        data: &[u8],
    ) -> Result<(), InferenceError>;

    /// Run one inference step over `tokens` and return the next token, or a
    /// negative value on failure. Advances the KV cache by `tokens.len()`.
    fn infer_step(&self, model: &mut Self::Model, tokens: &[i64], sampling: &SamplingConfig) -> i64;

    /// Forget all cached positions.
    fn reset_cache(&self, model: &mut Self::Model);
}
