//! Pure-Rust reference engine for Qwen2-style decoders.
//!
//! Implements [`NativeEngine`] on the host CPU: embedding lookup, RMSNorm,
//! biased Q/K/V projections, NeoX (rotate-half) RoPE, causal grouped-query
//! attention over a per-layer KV cache, SwiGLU MLP, final norm and LM head.
//! Weights are widened to f32 at load time. No unsafe code.

use tracing::{debug, trace, warn};

use crate::engine::sampler::{sample_token, SamplingConfig, XorShiftRng};
use crate::error::InferenceError;
use crate::model::cache::KvCache;
use crate::model::config::ModelMeta;
use crate::model::weights::{GlobalSlot, LayerSlot, Slot, WeightTable};
use crate::tensor::widen_to_f32;

use super::{DeviceType, NativeEngine};

/// CPU reference engine. Stateless; all state lives in [`CpuModel`].
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuEngine;

impl CpuEngine {
    pub fn new() -> Self {
        debug!("Initialized CpuEngine");
        Self
    }
}

/// Handle to one weight tensor of a [`CpuModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuTensor(usize);

/// Weight storage: one f32 buffer per slot, empty until loaded.
#[derive(Debug)]
struct CpuWeights {
    table: WeightTable<CpuTensor>,
    shapes: Vec<Vec<usize>>,
    data: Vec<Vec<f32>>,
}

impl CpuWeights {
    fn get(&self, slot: Slot) -> Result<&[f32], InferenceError> {
        let CpuTensor(index) = self
            .table
            .get(slot)
            .ok_or_else(|| InferenceError::Backend(format!("no tensor for slot {}", slot)))?;
        let data = &self.data[index];
        if data.is_empty() {
            return Err(InferenceError::Backend(format!("weight {} not loaded", slot)));
        }
        Ok(data)
    }

    fn layer(&self, slot: LayerSlot, layer: usize) -> Result<&[f32], InferenceError> {
        self.get(Slot::Layer(slot, layer))
    }
}

/// A model instance of the CPU engine.
#[derive(Debug)]
pub struct CpuModel {
    meta: ModelMeta,
    weights: CpuWeights,
    cache: KvCache,
    /// Seeded on the first step after a reset.
    rng: Option<XorShiftRng>,
}

impl CpuModel {
    /// Positions currently held in the KV cache.
    pub fn cached_positions(&self) -> usize {
        self.cache.len()
    }

    /// Run the decoder over `tokens` at positions `pos..pos + n` and return
    /// the logits of the last token.
    fn forward(&mut self, tokens: &[i64]) -> Result<Vec<f32>, InferenceError> {
        let meta = &self.meta;
        let n = tokens.len();
        let hs = meta.hidden_size;
        let q_dim = meta.num_heads * meta.head_dim;
        let kv_dim = meta.kv_dim();
        let di = meta.ffn_hidden;

        if n == 0 {
            return Err(InferenceError::InvalidArgument("empty token batch".to_string()));
        }
        if let Some(&bad) = tokens.iter().find(|&&t| t < 0 || t as u64 >= meta.vocab_size as u64) {
            return Err(InferenceError::InvalidArgument(format!(
                "token {} outside vocabulary of {}",
                bad, meta.vocab_size
            )));
        }
        if !self.cache.has_room(n) {
            return Err(InferenceError::Inference(format!(
                "context full: {} cached + {} new > {}",
                self.cache.len(),
                n,
                meta.max_seq_len
            )));
        }

        let pos = self.cache.len();
        trace!(n_tokens = n, pos, "CPU forward");

        let embed = self.weights.get(Slot::Global(GlobalSlot::InputEmbedding))?;
        let mut x = Vec::with_capacity(n * hs);
        for &t in tokens {
            let row = t as usize;
            x.extend_from_slice(&embed[row * hs..(row + 1) * hs]);
        }

        for layer in 0..meta.num_layers {
            let w = &self.weights;

            // Attention block
            let h = rms_norm(&x, w.layer(LayerSlot::AttnNorm, layer)?, hs, meta.norm_eps);
            let mut q = linear(&h, n, hs, w.layer(LayerSlot::AttnQ, layer)?, q_dim);
            add_bias(&mut q, w.layer(LayerSlot::AttnQBias, layer)?);
            let mut k = linear(&h, n, hs, w.layer(LayerSlot::AttnK, layer)?, kv_dim);
            add_bias(&mut k, w.layer(LayerSlot::AttnKBias, layer)?);
            let mut v = linear(&h, n, hs, w.layer(LayerSlot::AttnV, layer)?, kv_dim);
            add_bias(&mut v, w.layer(LayerSlot::AttnVBias, layer)?);

            rope_neox(&mut q, n, meta.num_heads, meta.head_dim, pos, meta.rope_theta);
            rope_neox(&mut k, n, meta.num_kv_heads, meta.head_dim, pos, meta.rope_theta);

            self.cache.append(layer, &k, &v, n)?;
            let attn = causal_attention(
                &q,
                self.cache.get_k(layer),
                self.cache.get_v(layer),
                n,
                pos,
                meta.num_heads,
                meta.num_kv_heads,
                meta.head_dim,
            );
            let o = linear(&attn, n, q_dim, w.layer(LayerSlot::AttnOutput, layer)?, hs);
            add_in_place(&mut x, &o);

            // MLP block
            let h = rms_norm(&x, w.layer(LayerSlot::MlpNorm, layer)?, hs, meta.norm_eps);
            let gate = linear(&h, n, hs, w.layer(LayerSlot::MlpGate, layer)?, di);
            let up = linear(&h, n, hs, w.layer(LayerSlot::MlpUp, layer)?, di);
            let act = swiglu(&gate, &up);
            let down = linear(&act, n, di, w.layer(LayerSlot::MlpDown, layer)?, hs);
            add_in_place(&mut x, &down);
        }

        let last = &x[(n - 1) * hs..];
        let normed = rms_norm(
            last,
            self.weights.get(Slot::Global(GlobalSlot::FinalNorm))?,
            hs,
            meta.norm_eps,
        );
        let logits = linear(
            &normed,
            1,
            hs,
            self.weights.get(Slot::Global(GlobalSlot::OutputEmbedding))?,
            meta.vocab_size,
        );
        Ok(logits)
    }
}

impl NativeEngine for CpuEngine {
    type Model = CpuModel;
    type Tensor = CpuTensor;

    fn name(&self) -> &str {
        "cpu"
    }

    fn create_model(
        &self,
        meta: &ModelMeta,
        device: DeviceType,
        device_ids: &[i32],
    ) -> Option<CpuModel> {
        if device != DeviceType::Cpu {
            warn!(device = %device, "CPU engine cannot place a model on this device");
            return None;
        }
        if device_ids.len() > 1 {
            debug!(device_ids = ?device_ids, "CPU engine ignores extra device ids");
        }

        let mut shapes = Vec::new();
        let table = WeightTable::build(meta.num_layers, |slot| {
            shapes.push(slot.shape(meta));
            CpuTensor(shapes.len() - 1)
        });
        let data = vec![Vec::new(); shapes.len()];

        debug!(tensors = shapes.len(), max_seq_len = meta.max_seq_len, "Allocated CPU model");
        Some(CpuModel {
            meta: meta.clone(),
            weights: CpuWeights {
                table,
                shapes,
                data,
            },
            cache: KvCache::new(meta),
            rng: None,
        })
    }

    fn destroy_model(&self, model: CpuModel) {
        debug!(num_layers = model.meta.num_layers, "Released CPU model");
    }

    fn model_weights(&self, model: &CpuModel) -> Option<WeightTable<CpuTensor>> {
        Some(model.weights.table.clone())
    }

    fn load_tensor(
        &self,
        model: &mut CpuModel,
        tensor: CpuTensor,
        data: &[u8],
    ) -> Result<(), InferenceError> {
        let CpuTensor(index) = tensor;
        let shape = model
            .weights
            .shapes
            .get(index)
            .ok_or_else(|| InferenceError::Backend(format!("unknown tensor handle {}", index)))?;
        let n_elements: usize = shape.iter().product();
        let expected = n_elements * model.meta.dtype.size_in_bytes();
        if data.len() != expected {
            return Err(InferenceError::Backend(format!(
                "tensor {} of shape {:?} needs {} bytes of {}, got {}",
                index,
                shape,
                expected,
                model.meta.dtype,
                data.len()
            )));
        }
        model.weights.data[index] = widen_to_f32(model.meta.dtype, data);
        Ok(())
    }

    fn infer_step(&self, model: &mut CpuModel, tokens: &[i64], sampling: &SamplingConfig) -> i64 {
        match model.forward(tokens) {
            Ok(logits) => {
                model.cache.advance(tokens.len());
                let rng = model
                    .rng
                    .get_or_insert_with(|| XorShiftRng::new(sampling.effective_seed()));
                sample_token(&logits, sampling, rng) as i64
            }
            Err(e) => {
                model.cache.rollback();
                warn!(error = %e, n_tokens = tokens.len(), "CPU inference step failed");
                -1
            }
        }
    }

    fn reset_cache(&self, model: &mut CpuModel) {
        model.cache.clear();
        model.rng = None;
    }
}

// ---- kernels ----

/// `x[n, in_dim] · w[out_dim, in_dim]^T -> [n, out_dim]`
fn linear(x: &[f32], n: usize, in_dim: usize, w: &[f32], out_dim: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; n * out_dim];
    for i in 0..n {
        let row = &x[i * in_dim..(i + 1) * in_dim];
        for j in 0..out_dim {
            let w_row = &w[j * in_dim..(j + 1) * in_dim];
            out[i * out_dim + j] = row.iter().zip(w_row).map(|(a, b)| a * b).sum();
        }
    }
    out
}

/// Add a bias row to every row of `x`.
fn add_bias(x: &mut [f32], bias: &[f32]) {
    for row in x.chunks_mut(bias.len()) {
        for (v, b) in row.iter_mut().zip(bias) {
            *v += b;
        }
    }
}

fn add_in_place(x: &mut [f32], y: &[f32]) {
    for (a, b) in x.iter_mut().zip(y) {
        *a += b;
    }
}

/// Per row: `x * rsqrt(mean(x^2) + eps) * weight`
fn rms_norm(x: &[f32], weight: &[f32], hidden: usize, eps: f32) -> Vec<f32> {
    let mut out = vec![0.0f32; x.len()];
    for (row, dst) in x.chunks(hidden).zip(out.chunks_mut(hidden)) {
        let mean_sq = row.iter().map(|v| v * v).sum::<f32>() / hidden as f32;
        let inv = 1.0 / (mean_sq + eps).sqrt();
        for ((d, &v), &w) in dst.iter_mut().zip(row).zip(weight) {
            *d = v * inv * w;
        }
    }
    out
}

/// `silu(gate) * up`
fn swiglu(gate: &[f32], up: &[f32]) -> Vec<f32> {
    gate.iter()
        .zip(up)
        .map(|(&g, &u)| g / (1.0 + (-g).exp()) * u)
        .collect()
}

/// Rotate-half RoPE in place over `[n, n_heads * head_dim]`, pairing
/// `x[i]` with `x[i + head_dim/2]`. Row `r` is at absolute position `pos + r`.
fn rope_neox(x: &mut [f32], n: usize, n_heads: usize, head_dim: usize, pos: usize, theta: f32) {
    let half = head_dim / 2;
    let freqs: Vec<f32> = (0..half)
        .map(|i| theta.powf(-((2 * i) as f32) / head_dim as f32))
        .collect();
    let row_dim = n_heads * head_dim;
    for r in 0..n {
        let abs_pos = (pos + r) as f32;
        for head in 0..n_heads {
            let offset = r * row_dim + head * head_dim;
            for (i, &freq) in freqs.iter().enumerate() {
                let (sin, cos) = (abs_pos * freq).sin_cos();
                let a = x[offset + i];
                let b = x[offset + i + half];
                x[offset + i] = a * cos - b * sin;
                x[offset + i + half] = b * cos + a * sin;
            }
        }
    }
}

/// Causal grouped-query attention for `n` new queries at positions
/// `pos..pos + n`, against cached K/V of `pos + n` rows.
#[allow(clippy::too_many_arguments)]
fn causal_attention(
    q: &[f32],
    k: &[f32],
    v: &[f32],
    n: usize,
    pos: usize,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
) -> Vec<f32> {
    let q_dim = num_heads * head_dim;
    let kv_dim = num_kv_heads * head_dim;
    let heads_per_kv = num_heads / num_kv_heads;
    let scale = 1.0 / (head_dim as f32).sqrt();
    let mut out = vec![0.0f32; n * q_dim];

    for i in 0..n {
        let visible = pos + i + 1;
        for h in 0..num_heads {
            let kv_head = h / heads_per_kv;
            let q_off = i * q_dim + h * head_dim;
            let q_head = &q[q_off..q_off + head_dim];

            let mut scores: Vec<f32> = (0..visible)
                .map(|j| {
                    let k_off = j * kv_dim + kv_head * head_dim;
                    let dot: f32 = q_head
                        .iter()
                        .zip(&k[k_off..k_off + head_dim])
                        .map(|(a, b)| a * b)
                        .sum();
                    dot * scale
                })
                .collect();

            let max_score = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let mut sum_exp = 0.0f32;
            for s in scores.iter_mut() {
                *s = (*s - max_score).exp();
                sum_exp += *s;
            }
            let inv_sum = if sum_exp > 0.0 { 1.0 / sum_exp } else { 0.0 };

            let dst = &mut out[q_off..q_off + head_dim];
            for (j, &p) in scores.iter().enumerate() {
                let v_off = j * kv_dim + kv_head * head_dim;
                for (d, &vv) in dst.iter_mut().zip(&v[v_off..v_off + head_dim]) {
                    *d += p * inv_sum * vv;
                }
            }
        }
    }
    out
}
