//! Checkpoint directory to ready generator, in one call.
//!
//! A checkpoint directory holds `config.json` plus one or more
//! `*.safetensors` shards. [`Pretrained::open`] reads the metadata, creates
//! the model on the requested device, and loads the weights; the model is
//! destroyed if any step after creation fails.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::backend::cpu::CpuEngine;
use crate::backend::{DeviceType, NativeEngine};
use crate::checkpoint::safetensors::SafetensorsDir;
use crate::error::InferenceError;
use crate::model::config::{LoadOptions, ModelMeta};
use crate::model::handle::ModelHandle;
use crate::model::loader::{CheckpointLoader, LoadReport};
use crate::model::names::QWEN2;

use super::generate::{GenerationConfig, GenerationOutput, Generator};
use super::sampler::SamplingConfig;

/// A loaded Qwen2 model ready for generation.
pub struct Pretrained<E: NativeEngine> {
    generator: Generator<E>,
    report: LoadReport,
}

impl<E: NativeEngine> Pretrained<E> {
    /// Open the checkpoint directory `dir` on `device`.
    pub fn open(
        engine: Arc<E>,
        dir: impl AsRef<Path>,
        device: DeviceType,
        device_ids: &[i32],
        options: &LoadOptions,
    ) -> Result<Self, InferenceError> {
        let dir = dir.as_ref();
        info!(path = %dir.display(), engine = engine.name(), device = %device, "Opening model");

        let meta = ModelMeta::from_dir(dir, options)?;
        let mut handle = ModelHandle::create(engine, meta, device, device_ids)?;

        let report = match load_into(&mut handle, dir, options) {
            Ok(report) => report,
            Err(e) => {
                handle.destroy();
                return Err(e);
            }
        };

        Ok(Self {
            generator: Generator::new(handle)?,
            report,
        })
    }

    pub fn meta(&self) -> &ModelMeta {
        self.generator.handle().meta()
    }

    pub fn report(&self) -> &LoadReport {
        &self.report
    }

    pub fn generator_mut(&mut self) -> &mut Generator<E> {
        &mut self.generator
    }

    /// Generate from `inputs`; returns the prompt followed by new tokens.
    pub fn generate(
        &mut self,
        inputs: &[i64],
        config: &GenerationConfig,
    ) -> Result<Vec<i64>, InferenceError> {
        self.generator.generate(inputs, config)
    }

    pub fn generate_full(
        &mut self,
        inputs: &[i64],
        config: &GenerationConfig,
    ) -> Result<GenerationOutput, InferenceError> {
        self.generator.generate_full(inputs, config)
    }
}

fn load_into<E: NativeEngine>(
    handle: &mut ModelHandle<E>,
    dir: &Path,
    options: &LoadOptions,
) -> Result<LoadReport, InferenceError> {
    let source = SafetensorsDir::open(dir)?;
    CheckpointLoader::new(&QWEN2, options.clone()).load(handle, &source)
}

/// One-call generation: open `model_path` on `device`, generate, release.
///
/// CPU uses the built-in reference engine. NVIDIA requires the `llaisys`
/// feature and loads the native library from its default name.
pub fn generate(
    model_path: impl AsRef<Path>,
    device: DeviceType,
    inputs: &[i64],
    max_new_tokens: usize,
    top_k: usize,
    top_p: f32,
    temperature: f32,
) -> Result<Vec<i64>, InferenceError> {
    let config = GenerationConfig {
        max_new_tokens,
        sampling: SamplingConfig {
            temperature,
            top_k,
            top_p,
            seed: None,
        },
        stop_tokens: Vec::new(),
    };
    let options = LoadOptions::default();

    match device {
        DeviceType::Cpu => Pretrained::open(Arc::new(CpuEngine::new()), model_path, device, &[0], &options)?
            .generate(inputs, &config),
        DeviceType::Nvidia => generate_native(model_path.as_ref(), inputs, &config, &options),
    }
}

#[cfg(feature = "llaisys")]
fn generate_native(
    model_path: &Path,
    inputs: &[i64],
    config: &GenerationConfig,
    options: &LoadOptions,
) -> Result<Vec<i64>, InferenceError> {
    use crate::backend::llaisys::LlaisysEngine;

    let engine = LlaisysEngine::open(LlaisysEngine::default_library_name())?;
    Pretrained::open(Arc::new(engine), model_path, DeviceType::Nvidia, &[0], options)?
        .generate(inputs, config)
}

#[cfg(not(feature = "llaisys"))]
fn generate_native(
    _model_path: &Path,
    _inputs: &[i64],
    _config: &GenerationConfig,
    _options: &LoadOptions,
) -> Result<Vec<i64>, InferenceError> {
    Err(InferenceError::Backend(
        "nvidia device requires building with the `llaisys` feature".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::backend::scripted::ScriptedEngine;
    use crate::checkpoint::safetensors::write_safetensors;
    use crate::checkpoint::CheckpointSource;
    use crate::model::handle::tests::tiny_meta;
    use crate::model::loader::tests::synthetic_checkpoint;
    use crate::tensor::{DataType, HostTensor};

    const CONFIG: &str = r#"{
        "architectures": ["Qwen2ForCausalLM"],
        "num_hidden_layers": 2,
        "hidden_size": 8,
        "num_attention_heads": 2,
        "num_key_value_heads": 2,
        "intermediate_size": 16,
        "max_position_embeddings": 16,
        "vocab_size": 32,
        "rms_norm_eps": 1e-6,
        "rope_theta": 10000.0,
        "eos_token_id": 31,
        "torch_dtype": "float32"
    }"#;

    /// Write config.json and a single shard, leaving out names in `omit`.
    fn write_checkpoint(dir: &Path, omit: &[&str]) {
        std::fs::write(dir.join("config.json"), CONFIG).unwrap();
        let ckpt = synthetic_checkpoint(&tiny_meta(), true, DataType::BF16);
        let mut tensors: BTreeMap<String, HostTensor<'static>> = BTreeMap::new();
        for (i, name) in ckpt.tensor_names().into_iter().enumerate() {
            if omit.contains(&name) {
                continue;
            }
            let tensor = ckpt.tensor(i).unwrap().into_owned();
            tensors.insert(name.to_string(), tensor);
        }
        write_safetensors(dir.join("model.safetensors"), &tensors).unwrap();
    }

    fn greedy(max_new_tokens: usize) -> GenerationConfig {
        GenerationConfig {
            max_new_tokens,
            sampling: SamplingConfig::greedy(),
            ..Default::default()
        }
    }

    #[test]
    fn test_open_and_generate_on_cpu() {
        let dir = tempfile::tempdir().unwrap();
        write_checkpoint(dir.path(), &[]);

        let mut model = Pretrained::open(
            Arc::new(CpuEngine::new()),
            dir.path(),
            DeviceType::Cpu,
            &[0],
            &LoadOptions::default(),
        )
        .unwrap();
        assert_eq!(model.meta().num_layers, 2);
        assert_eq!(model.meta().dtype, DataType::F32);
        assert_eq!(model.report().skipped, 0);

        let out = model.generate_full(&[5, 7, 9], &greedy(4)).unwrap();
        assert_eq!(&out.tokens[..3], &[5, 7, 9]);
        assert!(!out.generated().is_empty() && out.generated().len() <= 4);
        assert!(out.generated().iter().all(|&t| (0..32).contains(&t)));

        // Greedy decoding from a reset cache is reproducible.
        let again = model.generate_full(&[5, 7, 9], &greedy(4)).unwrap();
        assert_eq!(out, again);
    }

    #[test]
    fn test_one_call_generate() {
        let dir = tempfile::tempdir().unwrap();
        write_checkpoint(dir.path(), &[]);
        let out = generate(dir.path(), DeviceType::Cpu, &[3], 1, 1, 0.8, 0.8).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], 3);
    }

    #[test]
    fn test_load_failure_destroys_model() {
        let dir = tempfile::tempdir().unwrap();
        write_checkpoint(dir.path(), &["model.norm.weight"]);

        let engine = Arc::new(ScriptedEngine::new());
        let err = Pretrained::open(
            engine.clone(),
            dir.path(),
            DeviceType::Cpu,
            &[0],
            &LoadOptions::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, InferenceError::WeightValidation(_)));
        assert_eq!(engine.destroy_count(), 1);
    }

    #[test]
    fn test_missing_shards_destroys_model() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), CONFIG).unwrap();

        let engine = Arc::new(ScriptedEngine::new());
        assert!(Pretrained::open(
            engine.clone(),
            dir.path(),
            DeviceType::Cpu,
            &[0],
            &LoadOptions::default()
        )
        .is_err());
        assert_eq!(engine.destroy_count(), 1);
    }

    #[test]
    fn test_missing_config_never_creates_model() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(ScriptedEngine::new());
        let err = Pretrained::open(
            engine.clone(),
            dir.path(),
            DeviceType::Cpu,
            &[0],
            &LoadOptions::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, InferenceError::Io(_)));
        assert!(engine.calls().is_empty());
    }

    #[cfg(not(feature = "llaisys"))]
    #[test]
    fn test_nvidia_without_native_feature() {
        let dir = tempfile::tempdir().unwrap();
        write_checkpoint(dir.path(), &[]);
        let err = generate(dir.path(), DeviceType::Nvidia, &[1], 1, 1, 0.8, 0.8).unwrap_err();
        assert!(matches!(err, InferenceError::Backend(_)));
    }
}
