// Weight table: the fixed set of engine-allocated tensors a model consumes.

use std::fmt;

use super::config::ModelMeta;

/// Model-level weight slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GlobalSlot {
    /// Token embedding table: [vocab_size, hidden_size]
    InputEmbedding,
    /// Output projection (lm_head): [vocab_size, hidden_size]
    OutputEmbedding,
    /// Final normalization weight: [hidden_size]
    FinalNorm,
}

impl GlobalSlot {
    pub const ALL: [GlobalSlot; 3] = [
        GlobalSlot::InputEmbedding,
        GlobalSlot::OutputEmbedding,
        GlobalSlot::FinalNorm,
    ];

    fn ordinal(self) -> usize {
        self as usize
    }
}

/// Per-layer weight slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LayerSlot {
    AttnNorm,
    AttnQ,
    AttnQBias,
    AttnK,
    AttnKBias,
    AttnV,
    AttnVBias,
    AttnOutput,
    MlpNorm,
    MlpGate,
    MlpUp,
    MlpDown,
}

impl LayerSlot {
    pub const ALL: [LayerSlot; 12] = [
        LayerSlot::AttnNorm,
        LayerSlot::AttnQ,
        LayerSlot::AttnQBias,
        LayerSlot::AttnK,
        LayerSlot::AttnKBias,
        LayerSlot::AttnV,
        LayerSlot::AttnVBias,
        LayerSlot::AttnOutput,
        LayerSlot::MlpNorm,
        LayerSlot::MlpGate,
        LayerSlot::MlpUp,
        LayerSlot::MlpDown,
    ];

    fn ordinal(self) -> usize {
        self as usize
    }
}

/// A position in the weight table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    Global(GlobalSlot),
    Layer(LayerSlot, usize),
}

impl Slot {
    /// The shape the engine allocates for this slot.
    pub fn shape(&self, meta: &ModelMeta) -> Vec<usize> {
        let hs = meta.hidden_size;
        let q_dim = meta.num_heads * meta.head_dim;
        let kv_dim = meta.kv_dim();
        let di = meta.ffn_hidden;
        match self {
            Slot::Global(GlobalSlot::InputEmbedding) | Slot::Global(GlobalSlot::OutputEmbedding) => {
                vec![meta.vocab_size, hs]
            }
            Slot::Global(GlobalSlot::FinalNorm) => vec![hs],
            Slot::Layer(slot, _) => match slot {
                LayerSlot::AttnNorm | LayerSlot::MlpNorm => vec![hs],
                LayerSlot::AttnQ => vec![q_dim, hs],
                LayerSlot::AttnQBias => vec![q_dim],
                LayerSlot::AttnK | LayerSlot::AttnV => vec![kv_dim, hs],
                LayerSlot::AttnKBias | LayerSlot::AttnVBias => vec![kv_dim],
                LayerSlot::AttnOutput => vec![hs, q_dim],
                LayerSlot::MlpGate | LayerSlot::MlpUp => vec![di, hs],
                LayerSlot::MlpDown => vec![hs, di],
            },
        }
    }

    /// Every slot of a model with `num_layers` layers, globals first.
    pub fn all(num_layers: usize) -> impl Iterator<Item = Slot> {
        GlobalSlot::ALL.into_iter().map(Slot::Global).chain(
            (0..num_layers).flat_map(|layer| {
                LayerSlot::ALL.into_iter().map(move |slot| Slot::Layer(slot, layer))
            }),
        )
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Global(g) => write!(f, "{:?}", g),
            Slot::Layer(l, i) => write!(f, "layers[{}].{:?}", i, l),
        }
    }
}

/// Engine-owned tensor handles for every slot of a model.
///
/// `T` is the engine's opaque tensor handle type. The table only names the
/// tensors; their storage belongs to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightTable<T> {
    pub in_embed: T,
    pub out_embed: T,
    pub out_norm_w: T,
    pub attn_norm_w: Vec<T>,
    pub attn_q_w: Vec<T>,
    pub attn_q_b: Vec<T>,
    pub attn_k_w: Vec<T>,
    pub attn_k_b: Vec<T>,
    pub attn_v_w: Vec<T>,
    pub attn_v_b: Vec<T>,
    pub attn_o_w: Vec<T>,
    pub mlp_norm_w: Vec<T>,
    pub mlp_gate_w: Vec<T>,
    pub mlp_up_w: Vec<T>,
    pub mlp_down_w: Vec<T>,
}

impl<T: Copy> WeightTable<T> {
    /// Build a table by asking `alloc` for the handle of each slot.
    pub fn build(num_layers: usize, mut alloc: impl FnMut(Slot) -> T) -> Self {
        let mut layer = |slot: LayerSlot| -> Vec<T> {
            (0..num_layers).map(|i| alloc(Slot::Layer(slot, i))).collect()
        };
        let attn_norm_w = layer(LayerSlot::AttnNorm);
        let attn_q_w = layer(LayerSlot::AttnQ);
        let attn_q_b = layer(LayerSlot::AttnQBias);
        let attn_k_w = layer(LayerSlot::AttnK);
        let attn_k_b = layer(LayerSlot::AttnKBias);
        let attn_v_w = layer(LayerSlot::AttnV);
        let attn_v_b = layer(LayerSlot::AttnVBias);
        let attn_o_w = layer(LayerSlot::AttnOutput);
        let mlp_norm_w = layer(LayerSlot::MlpNorm);
        let mlp_gate_w = layer(LayerSlot::MlpGate);
        let mlp_up_w = layer(LayerSlot::MlpUp);
        let mlp_down_w = layer(LayerSlot::MlpDown);
        Self {
            in_embed: alloc(Slot::Global(GlobalSlot::InputEmbedding)),
            out_embed: alloc(Slot::Global(GlobalSlot::OutputEmbedding)),
            out_norm_w: alloc(Slot::Global(GlobalSlot::FinalNorm)),
            attn_norm_w,
            attn_q_w,
            attn_q_b,
            attn_k_w,
            attn_k_b,
            attn_v_w,
            attn_v_b,
            attn_o_w,
            mlp_norm_w,
            mlp_gate_w,
            mlp_up_w,
            mlp_down_w,
        }
    }

    /// Number of layers in every per-layer array (0 if the arrays disagree).
    pub fn num_layers(&self) -> usize {
        let n = self.attn_norm_w.len();
        let consistent = LayerSlot::ALL.iter().all(|&s| self.layer_array(s).len() == n);
        if consistent {
            n
        } else {
            0
        }
    }

    fn layer_array(&self, slot: LayerSlot) -> &[T] {
        match slot {
            LayerSlot::AttnNorm => &self.attn_norm_w,
            LayerSlot::AttnQ => &self.attn_q_w,
            LayerSlot::AttnQBias => &self.attn_q_b,
            LayerSlot::AttnK => &self.attn_k_w,
            LayerSlot::AttnKBias => &self.attn_k_b,
            LayerSlot::AttnV => &self.attn_v_w,
            LayerSlot::AttnVBias => &self.attn_v_b,
            LayerSlot::AttnOutput => &self.attn_o_w,
            LayerSlot::MlpNorm => &self.mlp_norm_w,
            LayerSlot::MlpGate => &self.mlp_gate_w,
            LayerSlot::MlpUp => &self.mlp_up_w,
            LayerSlot::MlpDown => &self.mlp_down_w,
        }
    }

    /// Handle for `slot`, or `None` if the layer index is out of range.
    pub fn get(&self, slot: Slot) -> Option<T> {
        match slot {
            Slot::Global(GlobalSlot::InputEmbedding) => Some(self.in_embed),
            Slot::Global(GlobalSlot::OutputEmbedding) => Some(self.out_embed),
            Slot::Global(GlobalSlot::FinalNorm) => Some(self.out_norm_w),
            Slot::Layer(s, i) => self.layer_array(s).get(i).copied(),
        }
    }
}

/// Tracks which weight-table slots have received data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedSlots {
    num_layers: usize,
    bits: Vec<bool>,
}

impl LoadedSlots {
    pub fn new(num_layers: usize) -> Self {
        Self {
            num_layers,
            bits: vec![false; GlobalSlot::ALL.len() + num_layers * LayerSlot::ALL.len()],
        }
    }

    fn index(&self, slot: Slot) -> Option<usize> {
        match slot {
            Slot::Global(g) => Some(g.ordinal()),
            Slot::Layer(s, i) if i < self.num_layers => {
                Some(GlobalSlot::ALL.len() + i * LayerSlot::ALL.len() + s.ordinal())
            }
            Slot::Layer(..) => None,
        }
    }

    pub fn mark(&mut self, slot: Slot) {
        if let Some(i) = self.index(slot) {
            self.bits[i] = true;
        }
    }

    pub fn is_loaded(&self, slot: Slot) -> bool {
        self.index(slot).map_or(false, |i| self.bits[i])
    }

    /// Number of loaded slots.
    pub fn count(&self) -> usize {
        self.bits.iter().filter(|&&b| b).count()
    }

    /// Slots not yet loaded, globals first.
    pub fn missing(&self) -> Vec<Slot> {
        Slot::all(self.num_layers)
            .filter(|&s| !self.is_loaded(s))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DataType;

    fn meta() -> ModelMeta {
        ModelMeta {
            dtype: DataType::F32,
            num_layers: 2,
            hidden_size: 8,
            num_heads: 2,
            num_kv_heads: 1,
            head_dim: 4,
            ffn_hidden: 16,
            max_seq_len: 32,
            vocab_size: 10,
            norm_eps: 1e-6,
            rope_theta: 10000.0,
            end_token: 9,
        }
    }

    #[test]
    fn test_slot_shapes() {
        let m = meta();
        assert_eq!(Slot::Global(GlobalSlot::InputEmbedding).shape(&m), vec![10, 8]);
        assert_eq!(Slot::Global(GlobalSlot::FinalNorm).shape(&m), vec![8]);
        assert_eq!(Slot::Layer(LayerSlot::AttnQ, 0).shape(&m), vec![8, 8]);
        assert_eq!(Slot::Layer(LayerSlot::AttnK, 1).shape(&m), vec![4, 8]);
        assert_eq!(Slot::Layer(LayerSlot::AttnVBias, 1).shape(&m), vec![4]);
        assert_eq!(Slot::Layer(LayerSlot::AttnOutput, 0).shape(&m), vec![8, 8]);
        assert_eq!(Slot::Layer(LayerSlot::MlpDown, 0).shape(&m), vec![8, 16]);
    }

    #[test]
    fn test_all_slots_count() {
        assert_eq!(Slot::all(2).count(), 3 + 2 * 12);
        assert_eq!(Slot::all(0).count(), 3);
    }

    #[test]
    fn test_build_assigns_distinct_handles() {
        let mut next = 0u32;
        let table = WeightTable::build(2, |_| {
            next += 1;
            next
        });
        assert_eq!(table.num_layers(), 2);
        let mut handles: Vec<u32> = Slot::all(2).map(|s| table.get(s).unwrap()).collect();
        handles.sort();
        handles.dedup();
        assert_eq!(handles.len(), 27);
        assert_eq!(table.get(Slot::Layer(LayerSlot::MlpUp, 2)), None);
    }

    #[test]
    fn test_loaded_slots_tracking() {
        let mut loaded = LoadedSlots::new(2);
        assert_eq!(loaded.missing().len(), 27);

        loaded.mark(Slot::Global(GlobalSlot::FinalNorm));
        loaded.mark(Slot::Layer(LayerSlot::AttnQ, 1));
        loaded.mark(Slot::Layer(LayerSlot::AttnQ, 5)); // out of range, ignored

        assert!(loaded.is_loaded(Slot::Global(GlobalSlot::FinalNorm)));
        assert!(loaded.is_loaded(Slot::Layer(LayerSlot::AttnQ, 1)));
        assert!(!loaded.is_loaded(Slot::Layer(LayerSlot::AttnQ, 0)));
        assert_eq!(loaded.count(), 2);
        assert_eq!(loaded.missing()[0], Slot::Global(GlobalSlot::InputEmbedding));
    }

    #[test]
    fn test_slot_display() {
        assert_eq!(Slot::Layer(LayerSlot::MlpGate, 3).to_string(), "layers[3].MlpGate");
        assert_eq!(Slot::Global(GlobalSlot::FinalNorm).to_string(), "FinalNorm");
    }
}
