//! High-level inference APIs.
//!
//! - [`Generator`]: prefill plus single-token decode over a loaded model
//! - [`Pretrained`]: checkpoint directory to ready generator
//! - [`sampler`]: temperature / top-k / top-p sampling used inside engines

pub mod generate;
pub mod pretrained;
pub mod sampler;

pub use generate::{
    GenerationConfig, GenerationOutput, Generator, SharedGenerator, StopReason,
    DEFAULT_MAX_NEW_TOKENS,
};
pub use pretrained::{generate, Pretrained};
pub use sampler::SamplingConfig;
