// Model metadata extracted from a HuggingFace `config.json`.

use std::path::Path;

use serde_json::Value;
use tracing::{info, warn};

use crate::error::InferenceError;
use crate::tensor::DataType;

/// Default ceiling on the maximum sequence length, bounding KV-cache memory.
pub const DEFAULT_MAX_SEQ_CEILING: usize = 4096;

/// Qwen2 end-of-text token, used when `config.json` has no `eos_token_id`.
pub const DEFAULT_END_TOKEN: i64 = 151643;

/// Options that shape metadata extraction and checkpoint loading.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Upper bound applied to `max_position_embeddings`.
    pub max_seq_ceiling: usize,
    /// Force the weight dtype instead of reading `torch_dtype`.
    pub dtype: Option<DataType>,
    /// Fail validation when any per-layer slot is left unloaded.
    pub require_layer_weights: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            max_seq_ceiling: DEFAULT_MAX_SEQ_CEILING,
            dtype: None,
            require_layer_weights: true,
        }
    }
}

/// Immutable model metadata shared with the native engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelMeta {
    pub dtype: DataType,
    pub num_layers: usize,
    pub hidden_size: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub ffn_hidden: usize,
    pub max_seq_len: usize,
    pub vocab_size: usize,
    pub norm_eps: f32,
    pub rope_theta: f32,
    pub end_token: i64,
}

impl ModelMeta {
    /// Read and validate `config.json` from a checkpoint directory.
    pub fn from_dir(dir: impl AsRef<Path>, options: &LoadOptions) -> Result<Self, InferenceError> {
        let path = dir.as_ref().join("config.json");
        let text = std::fs::read_to_string(&path)?;
        let value: Value = serde_json::from_str(&text)?;
        Self::from_hf_config(&value, options)
    }

    /// Build metadata from a parsed HuggingFace config.
    ///
    /// `max_position_embeddings` is clamped to `options.max_seq_ceiling`.
    pub fn from_hf_config(config: &Value, options: &LoadOptions) -> Result<Self, InferenceError> {
        let num_layers = require_usize(config, "num_hidden_layers")?;
        let hidden_size = require_usize(config, "hidden_size")?;
        let num_heads = require_usize(config, "num_attention_heads")?;
        let ffn_hidden = require_usize(config, "intermediate_size")?;
        let vocab_size = require_usize(config, "vocab_size")?;

        let num_kv_heads = get_usize(config, "num_key_value_heads").unwrap_or(num_heads);
        let raw_max_seq = get_usize(config, "max_position_embeddings").unwrap_or(2048);
        let norm_eps = get_f32(config, "rms_norm_eps").unwrap_or(1e-6);
        let rope_theta = get_f32(config, "rope_theta").unwrap_or(10000.0);

        let end_token = match config.get("eos_token_id") {
            Some(Value::Array(ids)) => ids.first().and_then(Value::as_i64),
            Some(v) => v.as_i64(),
            None => None,
        }
        .unwrap_or(DEFAULT_END_TOKEN);

        let dtype = match options.dtype {
            Some(dtype) => dtype,
            None => match config.get("torch_dtype").and_then(Value::as_str) {
                Some(name) => DataType::from_torch_dtype(name).ok_or_else(|| {
                    InferenceError::InvalidArgument(format!("unsupported torch_dtype '{}'", name))
                })?,
                None => DataType::BF16,
            },
        };

        if num_heads == 0 {
            return Err(InferenceError::InvalidArgument(
                "num_attention_heads must be non-zero".to_string(),
            ));
        }

        let max_seq_len = raw_max_seq.min(options.max_seq_ceiling);
        if max_seq_len < raw_max_seq {
            warn!(
                requested = raw_max_seq,
                ceiling = options.max_seq_ceiling,
                "Clamping max sequence length"
            );
        }

        let meta = ModelMeta {
            dtype,
            num_layers,
            hidden_size,
            num_heads,
            num_kv_heads,
            head_dim: hidden_size / num_heads,
            ffn_hidden,
            max_seq_len,
            vocab_size,
            norm_eps,
            rope_theta,
            end_token,
        };
        meta.validate()?;

        info!(
            dtype = %meta.dtype,
            num_layers = meta.num_layers,
            hidden_size = meta.hidden_size,
            num_heads = meta.num_heads,
            num_kv_heads = meta.num_kv_heads,
            head_dim = meta.head_dim,
            ffn_hidden = meta.ffn_hidden,
            max_seq_len = meta.max_seq_len,
            vocab_size = meta.vocab_size,
            "Model metadata"
        );

        Ok(meta)
    }

    /// Check the structural invariants. Called before any native allocation.
    pub fn validate(&self) -> Result<(), InferenceError> {
        let dims = [
            ("num_layers", self.num_layers),
            ("hidden_size", self.hidden_size),
            ("num_heads", self.num_heads),
            ("num_kv_heads", self.num_kv_heads),
            ("head_dim", self.head_dim),
            ("ffn_hidden", self.ffn_hidden),
            ("max_seq_len", self.max_seq_len),
            ("vocab_size", self.vocab_size),
        ];
        if let Some((name, _)) = dims.iter().find(|(_, v)| *v == 0) {
            return Err(InferenceError::InvalidArgument(format!(
                "{} must be non-zero",
                name
            )));
        }
        if self.hidden_size % self.num_heads != 0 {
            return Err(InferenceError::InvalidArgument(format!(
                "hidden_size ({}) must be divisible by num_heads ({})",
                self.hidden_size, self.num_heads
            )));
        }
        if self.head_dim * self.num_heads != self.hidden_size {
            return Err(InferenceError::InvalidArgument(format!(
                "head_dim ({}) * num_heads ({}) != hidden_size ({})",
                self.head_dim, self.num_heads, self.hidden_size
            )));
        }
        if self.num_heads % self.num_kv_heads != 0 {
            return Err(InferenceError::InvalidArgument(format!(
                "num_heads ({}) must be divisible by num_kv_heads ({})",
                self.num_heads, self.num_kv_heads
            )));
        }
        if self.end_token < 0 {
            return Err(InferenceError::InvalidArgument(format!(
                "end_token must be non-negative, got {}",
                self.end_token
            )));
        }
        Ok(())
    }

    /// Width of the key/value projections: `num_kv_heads * head_dim`.
    pub fn kv_dim(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }
}

fn get_usize(config: &Value, key: &str) -> Option<usize> {
    config.get(key).and_then(Value::as_u64).map(|v| v as usize)
}

fn get_f32(config: &Value, key: &str) -> Option<f32> {
    config.get(key).and_then(Value::as_f64).map(|v| v as f32)
}

fn require_usize(config: &Value, key: &str) -> Result<usize, InferenceError> {
    get_usize(config, key).ok_or_else(|| InferenceError::MissingKey(key.to_string()))
}
