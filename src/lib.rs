pub mod error;
pub mod tensor;
pub mod checkpoint;
pub mod backend;
pub mod model;
pub mod engine;
pub mod runtime;
pub mod cli;

pub use error::InferenceError;
pub use backend::{DeviceType, NativeEngine};
pub use engine::{generate, GenerationConfig, Generator, Pretrained, SamplingConfig};
pub use model::{CheckpointLoader, LoadOptions, ModelHandle, ModelMeta};
