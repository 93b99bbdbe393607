//! Model metadata, weight table, checkpoint loading and the model handle.
//!
//! - [`config`]: [`ModelMeta`] from `config.json`, [`LoadOptions`]
//! - [`weights`]: slot identifiers and the engine-owned [`WeightTable`]
//! - [`names`]: checkpoint name → slot resolution ([`QWEN2`] scheme)
//! - [`loader`]: [`CheckpointLoader`], populating a handle from a checkpoint
//! - [`handle`]: [`ModelHandle`], exclusive owner of one engine model
//! - [`cache`]: per-layer KV cache used by the reference engine

pub mod cache;
pub mod config;
pub mod handle;
pub mod loader;
pub mod names;
pub mod weights;

pub use cache::KvCache;
pub use config::{LoadOptions, ModelMeta};
pub use handle::ModelHandle;
pub use loader::{CheckpointLoader, LoadReport};
pub use names::{EmbeddingPlan, NameResolver, NamingScheme, QWEN2};
pub use weights::{GlobalSlot, LayerSlot, Slot, WeightTable};
