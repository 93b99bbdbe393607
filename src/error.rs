use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Missing metadata key: {0}")]
    MissingKey(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Model creation failed: {0}")]
    ModelCreation(String),

    #[error("Weight validation failed: {0}")]
    WeightValidation(String),

    #[error("Unrecognized weight name: {0}")]
    UnrecognizedWeightName(String),

    #[error("Layer index {index} out of range for '{name}' (model has {num_layers} layers)")]
    LayerIndexOutOfRange {
        name: String,
        index: usize,
        num_layers: usize,
    },

    #[error("Shape mismatch for '{name}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl InferenceError {
    /// Whether a checkpoint load may log this error and move on to the next tensor.
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            InferenceError::UnrecognizedWeightName(_)
                | InferenceError::LayerIndexOutOfRange { .. }
                | InferenceError::ShapeMismatch { .. }
        )
    }
}
