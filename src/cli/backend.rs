//! Engine selection from the CLI --engine flag.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use crate::backend::cpu::CpuEngine;
use crate::backend::DeviceType;
use crate::engine::generate::{GenerationConfig, GenerationOutput};
use crate::engine::pretrained::Pretrained;
use crate::error::InferenceError;
use crate::model::config::{LoadOptions, ModelMeta};
use crate::model::loader::LoadReport;

#[cfg(feature = "llaisys")]
use crate::backend::llaisys::LlaisysEngine;

/// Which engine runs the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// Reference engine on CPU, native library otherwise.
    Auto,
    Reference,
    Llaisys,
}

impl EngineKind {
    /// Concrete engine for `device`.
    pub fn resolve(self, device: DeviceType) -> EngineKind {
        match (self, device) {
            (EngineKind::Auto, DeviceType::Cpu) => EngineKind::Reference,
            (EngineKind::Auto, DeviceType::Nvidia) => EngineKind::Llaisys,
            (kind, _) => kind,
        }
    }
}

impl FromStr for EngineKind {
    type Err = InferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(EngineKind::Auto),
            "reference" | "cpu" => Ok(EngineKind::Reference),
            "llaisys" | "native" => Ok(EngineKind::Llaisys),
            other => Err(InferenceError::Backend(format!(
                "Unknown engine '{}'. Options: auto, reference, llaisys",
                other
            ))),
        }
    }
}

/// A loaded model on whichever engine was selected.
pub enum LoadedModel {
    Reference(Pretrained<CpuEngine>),
    #[cfg(feature = "llaisys")]
    Llaisys(Pretrained<LlaisysEngine>),
}

impl LoadedModel {
    pub fn engine_name(&self) -> &'static str {
        match self {
            LoadedModel::Reference(_) => "reference",
            #[cfg(feature = "llaisys")]
            LoadedModel::Llaisys(_) => "llaisys",
        }
    }

    pub fn meta(&self) -> &ModelMeta {
        match self {
            LoadedModel::Reference(m) => m.meta(),
            #[cfg(feature = "llaisys")]
            LoadedModel::Llaisys(m) => m.meta(),
        }
    }

    pub fn report(&self) -> &LoadReport {
        match self {
            LoadedModel::Reference(m) => m.report(),
            #[cfg(feature = "llaisys")]
            LoadedModel::Llaisys(m) => m.report(),
        }
    }

    pub fn generate_stream(
        &mut self,
        inputs: &[i64],
        config: &GenerationConfig,
        callback: impl FnMut(i64) -> bool,
    ) -> Result<GenerationOutput, InferenceError> {
        match self {
            LoadedModel::Reference(m) => m.generator_mut().generate_stream(inputs, config, callback),
            #[cfg(feature = "llaisys")]
            LoadedModel::Llaisys(m) => m.generator_mut().generate_stream(inputs, config, callback),
        }
    }
}

/// Open the checkpoint directory `dir` with the engine named by `engine`.
///
/// `library` overrides the native library path for the llaisys engine.
pub fn open_model(
    engine: Option<&str>,
    library: Option<&Path>,
    dir: &Path,
    device: DeviceType,
    device_ids: &[i32],
    options: &LoadOptions,
) -> Result<LoadedModel, InferenceError> {
    let kind = EngineKind::from_str(engine.unwrap_or("auto"))?.resolve(device);

    match kind {
        EngineKind::Reference => {
            let model = Pretrained::open(Arc::new(CpuEngine::new()), dir, device, device_ids, options)?;
            Ok(LoadedModel::Reference(model))
        }
        EngineKind::Llaisys | EngineKind::Auto => open_native(library, dir, device, device_ids, options),
    }
}

#[cfg(feature = "llaisys")]
fn open_native(
    library: Option<&Path>,
    dir: &Path,
    device: DeviceType,
    device_ids: &[i32],
    options: &LoadOptions,
) -> Result<LoadedModel, InferenceError> {
    let engine = match library {
        Some(path) => LlaisysEngine::open(path)?,
        None => LlaisysEngine::open(LlaisysEngine::default_library_name())?,
    };
    let model = Pretrained::open(Arc::new(engine), dir, device, device_ids, options)?;
    Ok(LoadedModel::Llaisys(model))
}

#[cfg(not(feature = "llaisys"))]
fn open_native(
    _library: Option<&Path>,
    _dir: &Path,
    _device: DeviceType,
    _device_ids: &[i32],
    _options: &LoadOptions,
) -> Result<LoadedModel, InferenceError> {
    Err(InferenceError::Backend(
        "llaisys engine not available (compile with --features llaisys)".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_kind_parse() {
        assert_eq!("auto".parse::<EngineKind>().unwrap(), EngineKind::Auto);
        assert_eq!("reference".parse::<EngineKind>().unwrap(), EngineKind::Reference);
        assert_eq!("llaisys".parse::<EngineKind>().unwrap(), EngineKind::Llaisys);
    }

    #[test]
    fn test_engine_kind_unknown() {
        match "tpu".parse::<EngineKind>() {
            Err(InferenceError::Backend(msg)) => {
                assert!(msg.contains("Unknown engine 'tpu'"), "Error: {}", msg);
            }
            other => panic!("Expected Backend error, got: {:?}", other),
        }
    }

    #[test]
    fn test_auto_resolves_by_device() {
        assert_eq!(EngineKind::Auto.resolve(DeviceType::Cpu), EngineKind::Reference);
        assert_eq!(EngineKind::Auto.resolve(DeviceType::Nvidia), EngineKind::Llaisys);
        assert_eq!(EngineKind::Reference.resolve(DeviceType::Nvidia), EngineKind::Reference);
    }

    #[cfg(not(feature = "llaisys"))]
    #[test]
    fn test_llaisys_without_feature() {
        let dir = tempfile::tempdir().unwrap();
        let result = open_model(
            Some("llaisys"),
            None,
            dir.path(),
            DeviceType::Cpu,
            &[0],
            &LoadOptions::default(),
        );
        match result {
            Err(InferenceError::Backend(msg)) => assert!(msg.contains("--features llaisys")),
            Err(other) => panic!("Expected Backend error, got: {:?}", other),
            Ok(_) => panic!("Expected error without the llaisys feature"),
        }
    }

    #[test]
    fn test_reference_engine_missing_config() {
        let dir = tempfile::tempdir().unwrap();
        let result = open_model(None, None, dir.path(), DeviceType::Cpu, &[0], &LoadOptions::default());
        assert!(matches!(result, Err(InferenceError::Io(_))));
    }
}
