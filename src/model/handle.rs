// Model handle: owns one engine model instance and its weight table.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::{DeviceType, NativeEngine};
use crate::engine::sampler::SamplingConfig;
use crate::error::InferenceError;
use crate::runtime;

use super::config::ModelMeta;
use super::weights::{GlobalSlot, LoadedSlots, Slot, WeightTable};

/// Exclusive owner of a native model instance.
///
/// The model is destroyed exactly once: by [`destroy`](Self::destroy) or on
/// drop, whichever comes first. Inference is refused until every required
/// slot has been loaded and [`finish_loading`](Self::finish_loading) succeeded.
pub struct ModelHandle<E: NativeEngine> {
    engine: Arc<E>,
    model: Option<E::Model>,
    weights: WeightTable<E::Tensor>,
    meta: ModelMeta,
    device: DeviceType,
    loaded: LoadedSlots,
    ready: bool,
}

impl<E: NativeEngine> ModelHandle<E> {
    /// Allocate a model on `device`.
    ///
    /// Metadata is validated before the engine is called.
    pub fn create(
        engine: Arc<E>,
        meta: ModelMeta,
        device: DeviceType,
        device_ids: &[i32],
    ) -> Result<Self, InferenceError> {
        meta.validate()?;
        runtime::init();

        let model = engine.create_model(&meta, device, device_ids).ok_or_else(|| {
            InferenceError::ModelCreation(format!(
                "{} engine could not allocate a {}-layer model on {} {:?}",
                engine.name(),
                meta.num_layers,
                device,
                device_ids
            ))
        })?;

        let weights = match engine.model_weights(&model) {
            Some(w) if w.num_layers() == meta.num_layers => w,
            Some(w) => {
                let got = w.num_layers();
                engine.destroy_model(model);
                return Err(InferenceError::ModelCreation(format!(
                    "engine weight table has {} layers, expected {}",
                    got, meta.num_layers
                )));
            }
            None => {
                engine.destroy_model(model);
                return Err(InferenceError::ModelCreation(
                    "engine returned no weight table".to_string(),
                ));
            }
        };

        info!(
            engine = engine.name(),
            device = %device,
            device_ids = ?device_ids,
            num_layers = meta.num_layers,
            "Created model"
        );

        Ok(Self {
            engine,
            model: Some(model),
            weights,
            loaded: LoadedSlots::new(meta.num_layers),
            meta,
            device,
            ready: false,
        })
    }

    pub fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    pub fn device(&self) -> DeviceType {
        self.device
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Engine-owned weight table, for the checkpoint loader.
    pub fn weights(&self) -> &WeightTable<E::Tensor> {
        &self.weights
    }

    pub fn loaded(&self) -> &LoadedSlots {
        &self.loaded
    }

    pub fn is_ready(&self) -> bool {
        self.ready && self.model.is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.model.is_none()
    }

    fn model_mut(&mut self) -> Result<&mut E::Model, InferenceError> {
        self.model
            .as_mut()
            .ok_or_else(|| InferenceError::InvalidArgument("model handle was destroyed".to_string()))
    }

    /// Ingest contiguous bytes of the model dtype into `slot`.
    ///
    /// Reloading a slot overwrites it.
    pub fn load_slot(&mut self, slot: Slot, data: &[u8]) -> Result<(), InferenceError> {
        let tensor = self.weights.get(slot).ok_or_else(|| {
            InferenceError::InvalidArgument(format!("slot {} is outside the weight table", slot))
        })?;
        let engine = Arc::clone(&self.engine);
        let model = self.model_mut()?;
        engine.load_tensor(model, tensor, data)?;
        self.loaded.mark(slot);
        debug!(%slot, bytes = data.len(), "Loaded weight");
        Ok(())
    }

    /// Check that the weight table is populated and enable inference.
    ///
    /// Global slots are always required; per-layer slots only when
    /// `require_layer_weights` is set.
    pub fn finish_loading(&mut self, require_layer_weights: bool) -> Result<(), InferenceError> {
        let missing = self.loaded.missing();
        let missing_globals: Vec<GlobalSlot> = missing
            .iter()
            .filter_map(|s| match s {
                Slot::Global(g) => Some(*g),
                Slot::Layer(..) => None,
            })
            .collect();
        if !missing_globals.is_empty() {
            return Err(InferenceError::WeightValidation(format!(
                "required weights not loaded: {:?}",
                missing_globals
            )));
        }

        let missing_layers = missing.len();
        if missing_layers > 0 {
            if require_layer_weights {
                let first: Vec<String> = missing.iter().take(4).map(|s| s.to_string()).collect();
                return Err(InferenceError::WeightValidation(format!(
                    "{} per-layer weights not loaded (first: {})",
                    missing_layers,
                    first.join(", ")
                )));
            }
            warn!(missing = missing_layers, "Per-layer weights left unloaded");
        }

        self.ready = true;
        Ok(())
    }

    /// Clear the KV cache and position counter.
    pub fn reset(&mut self) {
        let engine = Arc::clone(&self.engine);
        match self.model.as_mut() {
            Some(model) => engine.reset_cache(model),
            None => warn!("reset on a destroyed model handle"),
        }
    }

    /// Run one inference step over `tokens` and return the next token.
    ///
    /// The KV cache advances by `tokens.len()` positions.
    pub fn infer(&mut self, tokens: &[i64], sampling: &SamplingConfig) -> Result<i64, InferenceError> {
        if tokens.is_empty() {
            return Err(InferenceError::InvalidArgument(
                "infer requires at least one token".to_string(),
            ));
        }
        if !self.ready {
            return Err(InferenceError::WeightValidation(
                "inference before weights were loaded".to_string(),
            ));
        }
        let engine = Arc::clone(&self.engine);
        let vocab_size = self.meta.vocab_size;
        let model = self.model_mut()?;

        let token = engine.infer_step(model, tokens, sampling);
        if token < 0 {
            return Err(InferenceError::Inference(format!(
                "engine returned {} for a {}-token step",
                token,
                tokens.len()
            )));
        }
        if token as u64 >= vocab_size as u64 {
            return Err(InferenceError::Inference(format!(
                "engine returned token {} outside vocabulary of {}",
                token, vocab_size
            )));
        }
        Ok(token)
    }

    /// Release the native model. Later calls are no-ops.
    pub fn destroy(&mut self) {
        if let Some(model) = self.model.take() {
            self.engine.destroy_model(model);
            self.ready = false;
            debug!(engine = self.engine.name(), "Destroyed model");
        }
    }
}

impl<E: NativeEngine> Drop for ModelHandle<E> {
    fn drop(&mut self) {
        self.destroy();
    }
}
