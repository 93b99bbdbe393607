// KV cache for autoregressive generation.
//
// Stores the rotated K and the V projections of every processed position for
// each layer, so a decode step only projects the new token.

use crate::error::InferenceError;

use super::config::ModelMeta;

/// Per-layer KV cache.
///
/// Capacity is `max_seq_len` positions across all layers. During a step every
/// layer appends its new K/V rows, then [`advance`](Self::advance) moves the
/// shared position counter.
#[derive(Debug, Clone)]
pub struct KvCache {
    /// Per-layer K cache: up to max_seq_len * kv_dim values.
    k_cache: Vec<Vec<f32>>,
    /// Per-layer V cache: up to max_seq_len * kv_dim values.
    v_cache: Vec<Vec<f32>>,
    /// Number of positions filled so far (same across all layers).
    pos: usize,
    max_seq_len: usize,
    /// num_kv_heads * head_dim
    kv_dim: usize,
    num_layers: usize,
}

impl KvCache {
    /// Create an empty cache for the given model.
    ///
    /// Buffers grow on demand up to `max_seq_len` positions.
    pub fn new(meta: &ModelMeta) -> Self {
        let num_layers = meta.num_layers;
        Self {
            k_cache: vec![Vec::new(); num_layers],
            v_cache: vec![Vec::new(); num_layers],
            pos: 0,
            max_seq_len: meta.max_seq_len,
            kv_dim: meta.kv_dim(),
            num_layers,
        }
    }

    /// Whether `n_tokens` more positions fit.
    pub fn has_room(&self, n_tokens: usize) -> bool {
        self.pos + n_tokens <= self.max_seq_len
    }

    /// Append new K/V values for a single layer.
    ///
    /// `k_new` and `v_new` each hold `n_tokens * kv_dim` elements.
    pub fn append(
        &mut self,
        layer: usize,
        k_new: &[f32],
        v_new: &[f32],
        n_tokens: usize,
    ) -> Result<(), InferenceError> {
        if layer >= self.num_layers {
            return Err(InferenceError::Inference(format!(
                "KV cache layer index {} out of bounds (num_layers={})",
                layer, self.num_layers
            )));
        }
        let expected_len = n_tokens * self.kv_dim;
        if k_new.len() != expected_len || v_new.len() != expected_len {
            return Err(InferenceError::Inference(format!(
                "KV cache append: expected {} elements ({}*{}), got k={} v={}",
                expected_len,
                n_tokens,
                self.kv_dim,
                k_new.len(),
                v_new.len()
            )));
        }
        if !self.has_room(n_tokens) {
            return Err(InferenceError::Inference(format!(
                "KV cache overflow: pos={} + n_tokens={} > max_seq_len={}",
                self.pos, n_tokens, self.max_seq_len
            )));
        }
        self.k_cache[layer].extend_from_slice(k_new);
        self.v_cache[layer].extend_from_slice(v_new);
        Ok(())
    }

    /// Cached K values for a layer, including rows appended this step.
    ///
    /// # Panics
    ///
    /// Panics if `layer >= num_layers`.
    pub fn get_k(&self, layer: usize) -> &[f32] {
        &self.k_cache[layer]
    }

    /// Cached V values for a layer.
    ///
    /// # Panics
    ///
    /// Panics if `layer >= num_layers`.
    pub fn get_v(&self, layer: usize) -> &[f32] {
        &self.v_cache[layer]
    }

    /// Number of positions filled before the current step.
    pub fn len(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    /// Advance the position counter after all layers have processed a step.
    pub fn advance(&mut self, n_tokens: usize) {
        self.pos += n_tokens;
    }

    /// Drop rows appended past the position counter (a step that failed
    /// part-way through the layers).
    pub fn rollback(&mut self) {
        let keep = self.pos * self.kv_dim;
        for k in &mut self.k_cache {
            k.truncate(keep);
        }
        for v in &mut self.v_cache {
            v.truncate(keep);
        }
    }

    /// Reset the cache for a new sequence.
    pub fn clear(&mut self) {
        self.pos = 0;
        for k in &mut self.k_cache {
            k.clear();
        }
        for v in &mut self.v_cache {
            v.clear();
        }
    }

    pub fn kv_dim(&self) -> usize {
        self.kv_dim
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DataType;

    fn test_meta(num_layers: usize) -> ModelMeta {
        ModelMeta {
            dtype: DataType::F32,
            num_layers,
            hidden_size: 8,
            num_heads: 2,
            num_kv_heads: 2,
            head_dim: 4,
            ffn_hidden: 32,
            max_seq_len: 64,
            vocab_size: 16,
            norm_eps: 1e-6,
            rope_theta: 10000.0,
            end_token: 15,
        }
    }

    #[test]
    fn test_new_cache() {
        let cache = KvCache::new(&test_meta(2));
        assert_eq!(cache.len(), 0);
        assert!(cache.is_empty());
        assert_eq!(cache.kv_dim(), 8); // 2 heads * 4 dim
        assert_eq!(cache.num_layers(), 2);
        assert_eq!(cache.max_seq_len(), 64);
    }

    #[test]
    fn test_append_sequential() {
        let mut cache = KvCache::new(&test_meta(1));
        let kv_dim = cache.kv_dim();

        cache.append(0, &vec![1.0; kv_dim], &vec![10.0; kv_dim], 1).unwrap();
        cache.advance(1);
        cache.append(0, &vec![2.0; kv_dim], &vec![20.0; kv_dim], 1).unwrap();
        cache.advance(1);
        assert_eq!(cache.len(), 2);

        let k_all = cache.get_k(0);
        assert_eq!(k_all.len(), 2 * kv_dim);
        assert!(k_all[..kv_dim].iter().all(|&x| x == 1.0));
        assert!(k_all[kv_dim..].iter().all(|&x| x == 2.0));
        assert!(cache.get_v(0)[kv_dim..].iter().all(|&x| x == 20.0));
    }

    #[test]
    fn test_multi_layer() {
        let mut cache = KvCache::new(&test_meta(3));
        let kv_dim = cache.kv_dim();

        for layer in 0..3 {
            let k = vec![(layer + 1) as f32; kv_dim];
            let v = vec![(layer + 10) as f32; kv_dim];
            cache.append(layer, &k, &v, 1).unwrap();
        }
        cache.advance(1);

        assert!(cache.get_k(0).iter().all(|&x| x == 1.0));
        assert!(cache.get_k(2).iter().all(|&x| x == 3.0));
        assert!(cache.get_v(1).iter().all(|&x| x == 11.0));
    }

    #[test]
    fn test_overflow_returns_error() {
        let mut meta = test_meta(1);
        meta.max_seq_len = 2;
        let mut cache = KvCache::new(&meta);
        let kv_dim = cache.kv_dim();

        cache.append(0, &vec![1.0; 2 * kv_dim], &vec![2.0; 2 * kv_dim], 2).unwrap();
        cache.advance(2);
        assert!(!cache.has_room(1));

        let result = cache.append(0, &vec![3.0; kv_dim], &vec![4.0; kv_dim], 1);
        assert!(result.is_err());
    }

    #[test]
    fn test_wrong_size_and_layer_errors() {
        let mut cache = KvCache::new(&test_meta(2));
        let kv_dim = cache.kv_dim();

        assert!(cache.append(0, &[1.0, 2.0], &[3.0, 4.0], 1).is_err());

        let err = cache.append(2, &vec![1.0; kv_dim], &vec![2.0; kv_dim], 1).unwrap_err();
        assert!(err.to_string().contains("out of bounds"), "{}", err);
    }

    #[test]
    fn test_rollback_discards_partial_step() {
        let mut cache = KvCache::new(&test_meta(2));
        let kv_dim = cache.kv_dim();
        for layer in 0..2 {
            cache.append(layer, &vec![1.0; kv_dim], &vec![1.0; kv_dim], 1).unwrap();
        }
        cache.advance(1);

        // Second step only reached layer 0.
        cache.append(0, &vec![2.0; kv_dim], &vec![2.0; kv_dim], 1).unwrap();
        cache.rollback();
        assert_eq!(cache.get_k(0).len(), kv_dim);
        assert_eq!(cache.get_k(1).len(), kv_dim);
    }

    #[test]
    fn test_clear_then_reuse() {
        let mut cache = KvCache::new(&test_meta(1));
        let kv_dim = cache.kv_dim();

        cache.append(0, &vec![1.0; 2 * kv_dim], &vec![2.0; 2 * kv_dim], 2).unwrap();
        cache.advance(2);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get_k(0).len(), 0);

        cache.append(0, &vec![3.0; kv_dim], &vec![4.0; kv_dim], 1).unwrap();
        cache.advance(1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get_k(0).iter().all(|&x| x == 3.0));
        assert!(cache.get_v(0).iter().all(|&x| x == 4.0));
    }
}
