//! Inference-and-explanation pipeline.
//!
//! Raw upload bytes flow through five stages, strictly in order:
//! preprocess → classify → top finding → integrated gradients → overlay.
//! Each stage has its own error type; `PipelineError` unifies them at the
//! orchestrator boundary, where they are logged and collapsed into one
//! opaque client-facing failure.

pub mod attribution;
pub mod classifier;
pub mod glyphs;
pub mod model;
pub mod orchestrator;
pub mod overlay;
pub mod preprocess;
pub mod types;

pub use attribution::{IntegratedGradients, QuadratureRule};
pub use classifier::Classifier;
pub use model::{LinearNetwork, Model, Network, Vocabulary};
pub use orchestrator::AnalysisPipeline;
pub use overlay::{ColorMap, OverlayRenderer};
pub use preprocess::{ImagePreprocessor, XRayPreprocessor};
pub use types::*;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PreprocessingError {
    #[error("Image data is empty")]
    Empty,

    #[error("Image data exceeds {limit_mb}MB limit")]
    TooLarge { limit_mb: usize },

    #[error("Image is {width}x{height}, over the {max_pixels} pixel limit")]
    TooManyPixels {
        width: u32,
        height: u32,
        max_pixels: u64,
    },

    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Image has zero extent ({width}x{height})")]
    ZeroExtent { width: u32, height: u32 },

    #[error("Expected tensor shape ({expected}, {expected}), got {actual:?}")]
    Shape { expected: usize, actual: Vec<usize> },
}

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Expected input shape {expected:?}, got {actual:?}")]
    InputShape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Model returned {actual} scores, vocabulary has {expected} pathologies")]
    OutputShape { expected: usize, actual: usize },

    #[error("Model returned a non-finite score for {pathology}")]
    NonFinite { pathology: String },

    #[error("Inference backend failure: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum AttributionError {
    #[error("Target class {index} outside vocabulary of {size} pathologies")]
    TargetOutOfRange { index: usize, size: usize },

    #[error("Integrated gradients needs at least {minimum} step(s), got {steps}")]
    InvalidSteps { steps: usize, minimum: usize },

    #[error("Gradient shape {actual:?} does not match batch shape {expected:?}")]
    GradientShape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Attribution produced non-finite values")]
    NonFinite,

    #[error("Gradient backend failure: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum VisualizationError {
    #[error("Expected {what} shape ({expected}, {expected}), but got {actual:?}")]
    Shape {
        what: &'static str,
        expected: usize,
        actual: Vec<usize>,
    },

    #[error("PNG encoding failed: {0}")]
    Encode(String),
}

/// Fatal startup failures. Never produced while serving requests.
#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("Model file not found: {0}")]
    NotFound(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid pathology vocabulary: {0}")]
    Vocabulary(String),

    #[error("Model initialization: {0}")]
    Init(String),

    #[error("Built without an inference backend (enable the `onnx-runtime` feature)")]
    BackendUnavailable,
}

/// Any per-request pipeline failure, tagged by the stage that raised it.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Preprocessing failed: {0}")]
    Preprocessing(#[from] PreprocessingError),

    #[error("Inference failed: {0}")]
    Inference(#[from] InferenceError),

    #[error("Attribution failed: {0}")]
    Attribution(#[from] AttributionError),

    #[error("Visualization failed: {0}")]
    Visualization(#[from] VisualizationError),
}

impl PipelineError {
    /// Stage name for operator logs.
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::Preprocessing(_) => "preprocess",
            PipelineError::Inference(_) => "classify",
            PipelineError::Attribution(_) => "attribute",
            PipelineError::Visualization(_) => "render",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_follow_pipeline_order() {
        let errors = [
            PipelineError::from(PreprocessingError::Empty),
            PipelineError::from(InferenceError::Backend("oom".into())),
            PipelineError::from(AttributionError::NonFinite),
            PipelineError::from(VisualizationError::Encode("x".into())),
        ];
        let stages: Vec<_> = errors.iter().map(|e| e.stage()).collect();
        assert_eq!(stages, vec!["preprocess", "classify", "attribute", "render"]);
    }

    #[test]
    fn visualization_shape_error_names_both_shapes() {
        let err = VisualizationError::Shape {
            what: "attribution",
            expected: 224,
            actual: vec![112, 224],
        };
        let msg = err.to_string();
        assert!(msg.contains("(224, 224)"));
        assert!(msg.contains("[112, 224]"));
        assert!(msg.contains("attribution"));
    }
}
