//! Checkpoint tensor name → weight-table slot resolution.
//!
//! A [`NamingScheme`] is a static table for one model family. Global rules
//! match a dotted suffix (`embed_tokens.weight` matches
//! `model.embed_tokens.weight`); per-layer names have the shape
//! `<prefix>.layers.<index>.<component>` and `<component>` is looked up in
//! the scheme's component table.
//!
//! Whether the input embedding also fills the output-embedding slot is
//! decided once, from the full name set, by [`EmbeddingPlan::decide`].

use tracing::debug;

use crate::error::InferenceError;

use super::weights::{GlobalSlot, LayerSlot, Slot};

/// A model-level tensor name rule.
#[derive(Debug, Clone, Copy)]
pub struct GlobalRule {
    /// Dotted suffix the checkpoint name must end with.
    pub pattern: &'static str,
    /// Name a checkpoint of this family uses for the slot.
    pub canonical: &'static str,
    pub slot: GlobalSlot,
}

/// Static naming table for one checkpoint family.
#[derive(Debug, Clone, Copy)]
pub struct NamingScheme {
    pub family: &'static str,
    pub globals: &'static [GlobalRule],
    /// Path segment that introduces a layer index.
    pub layers_segment: &'static str,
    /// Prefix of canonical per-layer names, up to and including the segment.
    pub layer_prefix: &'static str,
    pub components: &'static [(&'static str, LayerSlot)],
}

/// HuggingFace Qwen2 naming.
pub static QWEN2: NamingScheme = NamingScheme {
    family: "qwen2",
    globals: &[
        GlobalRule {
            pattern: "embed_tokens.weight",
            canonical: "model.embed_tokens.weight",
            slot: GlobalSlot::InputEmbedding,
        },
        GlobalRule {
            pattern: "lm_head.weight",
            canonical: "lm_head.weight",
            slot: GlobalSlot::OutputEmbedding,
        },
        GlobalRule {
            pattern: "norm.weight",
            canonical: "model.norm.weight",
            slot: GlobalSlot::FinalNorm,
        },
    ],
    layers_segment: "layers",
    layer_prefix: "model.layers",
    components: &[
        ("input_layernorm.weight", LayerSlot::AttnNorm),
        ("self_attn.q_proj.weight", LayerSlot::AttnQ),
        ("self_attn.q_proj.bias", LayerSlot::AttnQBias),
        ("self_attn.k_proj.weight", LayerSlot::AttnK),
        ("self_attn.k_proj.bias", LayerSlot::AttnKBias),
        ("self_attn.v_proj.weight", LayerSlot::AttnV),
        ("self_attn.v_proj.bias", LayerSlot::AttnVBias),
        ("self_attn.o_proj.weight", LayerSlot::AttnOutput),
        ("post_attention_layernorm.weight", LayerSlot::MlpNorm),
        ("mlp.gate_proj.weight", LayerSlot::MlpGate),
        ("mlp.up_proj.weight", LayerSlot::MlpUp),
        ("mlp.down_proj.weight", LayerSlot::MlpDown),
    ],
};

impl NamingScheme {
    /// The checkpoint name this family uses for `slot`.
    pub fn canonical_name(&self, slot: Slot) -> Option<String> {
        match slot {
            Slot::Global(g) => self
                .globals
                .iter()
                .find(|r| r.slot == g)
                .map(|r| r.canonical.to_string()),
            Slot::Layer(l, index) => self
                .components
                .iter()
                .find(|(_, s)| *s == l)
                .map(|(component, _)| format!("{}.{}.{}", self.layer_prefix, index, component)),
        }
    }

    fn match_global(&self, name: &str) -> Option<GlobalSlot> {
        self.globals
            .iter()
            .find(|r| matches_dotted_suffix(name, r.pattern))
            .map(|r| r.slot)
    }

    /// Split `<prefix>.layers.<index>.<component>` into `(index, component)`.
    /// The index is returned unparsed.
    fn split_layer_name<'n>(&self, name: &'n str) -> Option<(&'n str, &'n str)> {
        let seg = self.layers_segment;
        for (pos, _) in name.match_indices(seg) {
            let starts_segment = pos == 0 || name.as_bytes()[pos - 1] == b'.';
            let rest = &name[pos + seg.len()..];
            if !starts_segment {
                continue;
            }
            if let Some(rest) = rest.strip_prefix('.') {
                if let Some((index, component)) = rest.split_once('.') {
                    if !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()) {
                        return Some((index, component));
                    }
                }
            }
        }
        None
    }
}

fn matches_dotted_suffix(name: &str, pattern: &str) -> bool {
    match name.strip_suffix(pattern) {
        Some(head) => head.is_empty() || head.ends_with('.'),
        None => false,
    }
}

/// How the output-embedding slot is populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingPlan {
    /// No output-projection tensor in the checkpoint: the input embedding
    /// is written to both embedding slots.
    Tied,
    /// The checkpoint carries its own output projection.
    Separate,
}

impl EmbeddingPlan {
    /// Decide from the complete set of checkpoint names.
    pub fn decide<'n>(scheme: &NamingScheme, names: impl IntoIterator<Item = &'n str>) -> Self {
        let has_output = names.into_iter().any(|name| {
            scheme.split_layer_name(name).is_none()
                && scheme.match_global(name) == Some(GlobalSlot::OutputEmbedding)
        });
        if has_output {
            EmbeddingPlan::Separate
        } else {
            EmbeddingPlan::Tied
        }
    }
}

/// Where one checkpoint tensor goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub primary: Slot,
    /// Second slot receiving the same bytes (tied embeddings).
    pub tied: Option<Slot>,
}

impl Resolved {
    pub fn slots(&self) -> impl Iterator<Item = Slot> {
        std::iter::once(self.primary).chain(self.tied)
    }
}

/// Resolves names for a model with a fixed layer count and embedding plan.
#[derive(Debug, Clone, Copy)]
pub struct NameResolver<'s> {
    scheme: &'s NamingScheme,
    num_layers: usize,
    plan: EmbeddingPlan,
}

impl<'s> NameResolver<'s> {
    /// Build a resolver, scanning `names` once to fix the embedding plan.
    pub fn new<'n>(
        scheme: &'s NamingScheme,
        num_layers: usize,
        names: impl IntoIterator<Item = &'n str>,
    ) -> Self {
        let plan = EmbeddingPlan::decide(scheme, names);
        debug!(family = scheme.family, ?plan, "Embedding plan");
        Self::with_plan(scheme, num_layers, plan)
    }

    pub fn with_plan(scheme: &'s NamingScheme, num_layers: usize, plan: EmbeddingPlan) -> Self {
        Self {
            scheme,
            num_layers,
            plan,
        }
    }

    pub fn plan(&self) -> EmbeddingPlan {
        self.plan
    }

    /// Resolve a checkpoint tensor name.
    ///
    /// Fails with `UnrecognizedWeightName` or `LayerIndexOutOfRange`; both
    /// are skippable during a load.
    pub fn resolve(&self, name: &str) -> Result<Resolved, InferenceError> {
        if let Some((index, component)) = self.scheme.split_layer_name(name) {
            let slot = self
                .scheme
                .components
                .iter()
                .find(|(c, _)| *c == component)
                .map(|(_, s)| *s)
                .ok_or_else(|| InferenceError::UnrecognizedWeightName(name.to_string()))?;
            // Digit-only strings only fail to parse on overflow.
            let index: usize = index.parse().unwrap_or(usize::MAX);
            if index >= self.num_layers {
                return Err(InferenceError::LayerIndexOutOfRange {
                    name: name.to_string(),
                    index,
                    num_layers: self.num_layers,
                });
            }
            return Ok(Resolved {
                primary: Slot::Layer(slot, index),
                tied: None,
            });
        }

        match self.scheme.match_global(name) {
            Some(GlobalSlot::InputEmbedding) => Ok(Resolved {
                primary: Slot::Global(GlobalSlot::InputEmbedding),
                tied: match self.plan {
                    EmbeddingPlan::Tied => Some(Slot::Global(GlobalSlot::OutputEmbedding)),
                    EmbeddingPlan::Separate => None,
                },
            }),
            Some(slot) => Ok(Resolved {
                primary: Slot::Global(slot),
                tied: None,
            }),
            None => Err(InferenceError::UnrecognizedWeightName(name.to_string())),
        }
    }
}
