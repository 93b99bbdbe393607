// Checkpoint loader: routes checkpoint tensors into the engine's weight table.

use std::borrow::Cow;

use tracing::{debug, info, warn};

use crate::backend::NativeEngine;
use crate::checkpoint::CheckpointSource;
use crate::error::InferenceError;
use crate::tensor::{narrow_from_f32, widen_to_f32};

use super::config::LoadOptions;
use super::handle::ModelHandle;
use super::names::{EmbeddingPlan, NameResolver, NamingScheme};

/// Summary of one checkpoint load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    /// Checkpoint tensors written to at least one slot.
    pub loaded: usize,
    /// Checkpoint tensors skipped: unrecognized, out of range, wrong shape,
    /// unreadable, or rejected by the engine.
    pub skipped: usize,
    /// Slot writes that replaced an earlier tensor for the same slot.
    pub overwritten: usize,
    pub plan: EmbeddingPlan,
}

/// Loads a checkpoint into a [`ModelHandle`] using one naming scheme.
#[derive(Debug, Clone)]
pub struct CheckpointLoader<'s> {
    scheme: &'s NamingScheme,
    options: LoadOptions,
}

impl<'s> CheckpointLoader<'s> {
    pub fn new(scheme: &'s NamingScheme, options: LoadOptions) -> Self {
        Self { scheme, options }
    }

    /// Load every recognized tensor of `source`, then validate the table.
    ///
    /// The full name set is scanned first to fix the embedding plan. Tensors
    /// are loaded in source order, so a later duplicate overwrites an earlier
    /// one. A tensor that cannot be resolved, read, or ingested is logged and
    /// skipped; the final validation fails if that leaves a required slot
    /// empty.
    pub fn load<E: NativeEngine>(
        &self,
        handle: &mut ModelHandle<E>,
        source: &dyn CheckpointSource,
    ) -> Result<LoadReport, InferenceError> {
        if handle.is_destroyed() {
            return Err(InferenceError::InvalidArgument(
                "cannot load into a destroyed model handle".to_string(),
            ));
        }
        let meta = handle.meta().clone();
        let names = source.tensor_names();
        let resolver = NameResolver::new(self.scheme, meta.num_layers, names.iter().copied());

        let mut loaded = 0usize;
        let mut skipped = 0usize;
        let mut overwritten = 0usize;

        for (index, name) in names.iter().enumerate() {
            let resolved = match resolver.resolve(name) {
                Ok(resolved) => resolved,
                Err(e) if e.is_skippable() => {
                    warn!(tensor = *name, reason = %e, "Skipping checkpoint tensor");
                    skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let tensor = match source.tensor(index) {
                Ok(tensor) => tensor.contiguous(),
                Err(e) => {
                    warn!(tensor = *name, reason = %e, "Skipping unreadable checkpoint tensor");
                    skipped += 1;
                    continue;
                }
            };
            let expected = resolved.primary.shape(&meta);
            if tensor.shape() != expected.as_slice() {
                let e = InferenceError::ShapeMismatch {
                    name: name.to_string(),
                    expected,
                    actual: tensor.shape().to_vec(),
                };
                warn!(tensor = *name, reason = %e, "Skipping checkpoint tensor");
                skipped += 1;
                continue;
            }

            let raw = tensor.as_bytes().ok_or_else(|| {
                InferenceError::Checkpoint(format!("tensor '{}' is not contiguous", name))
            })?;
            let bytes: Cow<'_, [u8]> = if tensor.dtype() == meta.dtype {
                Cow::Borrowed(raw)
            } else {
                debug!(tensor = *name, from = %tensor.dtype(), to = %meta.dtype, "Converting dtype");
                Cow::Owned(narrow_from_f32(meta.dtype, &widen_to_f32(tensor.dtype(), raw)))
            };

            let mut ingested = false;
            for slot in resolved.slots() {
                let reload = handle.loaded().is_loaded(slot);
                match handle.load_slot(slot, &bytes) {
                    Ok(()) => {
                        if reload {
                            debug!(tensor = *name, %slot, "Overwrote earlier load");
                            overwritten += 1;
                        }
                        ingested = true;
                    }
                    Err(e) => warn!(tensor = *name, %slot, reason = %e, "Engine rejected weight"),
                }
            }
            if ingested {
                loaded += 1;
            } else {
                skipped += 1;
            }
        }

        handle.finish_loading(self.options.require_layer_weights)?;

        let report = LoadReport {
            loaded,
            skipped,
            overwritten,
            plan: resolver.plan(),
        };
        info!(
            loaded = report.loaded,
            skipped = report.skipped,
            overwritten = report.overwritten,
            tied = report.plan == EmbeddingPlan::Tied,
            "Loaded checkpoint"
        );
        Ok(report)
    }
}
