// Scripted in-test engine: returns canned tokens and records every call.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::engine::sampler::SamplingConfig;
use crate::error::InferenceError;
use crate::model::config::ModelMeta;
use crate::model::weights::WeightTable;

use super::{DeviceType, NativeEngine};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Create(DeviceType, Vec<i32>),
    Destroy(u32),
    Load(u32, Vec<u8>),
    Infer(Vec<i64>),
    Reset,
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<Call>,
    replies: VecDeque<i64>,
    next_model: u32,
}

#[derive(Debug, Default)]
pub(crate) struct ScriptedEngine {
    state: Mutex<State>,
    fail_create: bool,
    no_weights: bool,
    fail_load: bool,
    /// Reply when the script runs out.
    fallback: i64,
}

#[derive(Debug)]
pub(crate) struct ScriptedModel {
    pub id: u32,
    num_layers: usize,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue tokens returned by successive `infer_step` calls.
    pub fn with_replies(self, replies: impl IntoIterator<Item = i64>) -> Self {
        self.state.lock().unwrap().replies.extend(replies);
        self
    }

    /// Reply with `token` once the scripted replies are used up.
    pub fn with_fallback(mut self, token: i64) -> Self {
        self.fallback = token;
        self
    }

    /// `create_model` returns `None`.
    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    /// `model_weights` returns `None`.
    pub fn without_weights(mut self) -> Self {
        self.no_weights = true;
        self
    }

    /// `load_tensor` returns a backend error.
    pub fn failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn infer_calls(&self) -> Vec<Vec<i64>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Infer(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    pub fn destroy_count(&self) -> usize {
        self.calls().iter().filter(|c| matches!(c, Call::Destroy(_))).count()
    }

    /// Bytes most recently loaded into tensor `handle`.
    pub fn loaded_bytes(&self, handle: u32) -> Option<Vec<u8>> {
        self.calls().into_iter().rev().find_map(|c| match c {
            Call::Load(h, bytes) if h == handle => Some(bytes),
            _ => None,
        })
    }
}

impl NativeEngine for ScriptedEngine {
    type Model = ScriptedModel;
    type Tensor = u32;

    fn name(&self) -> &str {
        "scripted"
    }

    fn create_model(
        &self,
        meta: &ModelMeta,
        device: DeviceType,
        device_ids: &[i32],
    ) -> Option<ScriptedModel> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Create(device, device_ids.to_vec()));
        if self.fail_create {
            return None;
        }
        state.next_model += 1;
        Some(ScriptedModel {
            id: state.next_model,
            num_layers: meta.num_layers,
        })
    }

    fn destroy_model(&self, model: ScriptedModel) {
        self.state.lock().unwrap().calls.push(Call::Destroy(model.id));
    }

    fn model_weights(&self, model: &ScriptedModel) -> Option<WeightTable<u32>> {
        if self.no_weights {
            return None;
        }
        // Handles are 1-based so 0 never names a tensor.
        let mut next = 0u32;
        Some(WeightTable::build(model.num_layers, |_| {
            next += 1;
            next
        }))
    }

    fn load_tensor(
        &self,
        _model: &mut ScriptedModel,
        tensor: u32,
        data: &[u8],
    ) -> Result<(), InferenceError> {
        if self.fail_load {
            return Err(InferenceError::Backend("scripted load failure".to_string()));
        }
        self.state
            .lock()
            .unwrap()
            .calls
            .push(Call::Load(tensor, data.to_vec()));
        Ok(())
    }

    fn infer_step(&self, _model: &mut ScriptedModel, tokens: &[i64], _sampling: &SamplingConfig) -> i64 {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Infer(tokens.to_vec()));
        state.replies.pop_front().unwrap_or(self.fallback)
    }

    fn reset_cache(&self, _model: &mut ScriptedModel) {
        self.state.lock().unwrap().calls.push(Call::Reset);
    }
}
