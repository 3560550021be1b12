//! Pretrained network handle.
//!
//! `Model` owns the pathology vocabulary and a `Network` backend exposing the
//! two operations the pipeline needs: a forward pass and input gradients for
//! one output column. It is built once at startup and only ever shared
//! behind `Arc<Model>`; nothing mutates it afterwards.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use ndarray::{Array1, Array2, Array3, Array4, ArrayView4, Axis};

use super::{AttributionError, InferenceError, ModelLoadError};
use crate::config::INPUT_SIZE;

/// Output order of the DenseNet-121 "all" weights. Order decides score ties.
pub const DENSENET_ALL_PATHOLOGIES: [&str; 18] = [
    "Atelectasis",
    "Consolidation",
    "Infiltration",
    "Pneumothorax",
    "Edema",
    "Emphysema",
    "Fibrosis",
    "Effusion",
    "Pneumonia",
    "Pleural_Thickening",
    "Cardiomegaly",
    "Nodule",
    "Mass",
    "Hernia",
    "Lung Lesion",
    "Fracture",
    "Lung Opacity",
    "Enlarged Cardiomediastinum",
];

/// Optional vocabulary override inside the model directory.
pub const VOCABULARY_FILE: &str = "pathologies.json";
pub const CLASSIFIER_FILE: &str = "classifier.onnx";
pub const GRADIENTS_FILE: &str = "gradients.onnx";

// ═══════════════════════════════════════════════════════════
// Vocabulary
// ═══════════════════════════════════════════════════════════

/// Ordered, duplicate-free list of pathology names, one per network output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary(Vec<String>);

impl Vocabulary {
    pub fn new(names: Vec<String>) -> Result<Self, ModelLoadError> {
        if names.is_empty() {
            return Err(ModelLoadError::Vocabulary("vocabulary is empty".into()));
        }
        let mut seen = HashSet::with_capacity(names.len());
        for name in &names {
            if name.trim().is_empty() {
                return Err(ModelLoadError::Vocabulary("blank pathology name".into()));
            }
            if !seen.insert(name.as_str()) {
                return Err(ModelLoadError::Vocabulary(format!(
                    "duplicate pathology name: {name}"
                )));
            }
        }
        Ok(Self(names))
    }

    pub fn densenet_all() -> Self {
        Self(DENSENET_ALL_PATHOLOGIES.iter().map(|s| s.to_string()).collect())
    }

    /// Read a JSON array of names.
    pub fn from_file(path: &Path) -> Result<Self, ModelLoadError> {
        let raw = std::fs::read_to_string(path)?;
        let names: Vec<String> = serde_json::from_str(&raw)
            .map_err(|e| ModelLoadError::Vocabulary(format!("{}: {e}", path.display())))?;
        Self::new(names)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn index_of(&self, pathology: &str) -> Option<usize> {
        self.0.iter().position(|name| name == pathology)
    }
}

// ═══════════════════════════════════════════════════════════
// Network trait
// ═══════════════════════════════════════════════════════════

/// A differentiable classifier, treated as a black box.
pub trait Network: Send + Sync {
    /// Raw scores `[N, V]` for a batch `[N, 1, H, W]`. Inference only.
    fn forward(&self, batch: ArrayView4<'_, f32>) -> Result<Array2<f32>, InferenceError>;

    /// Gradient of output column `target` with respect to each batch element.
    /// Returns `[N, 1, H, W]`, same shape as `batch`.
    fn input_gradients(
        &self,
        batch: ArrayView4<'_, f32>,
        target: usize,
    ) -> Result<Array4<f32>, AttributionError>;
}

// ═══════════════════════════════════════════════════════════
// Model
// ═══════════════════════════════════════════════════════════

pub struct Model {
    vocabulary: Vocabulary,
    network: Box<dyn Network>,
}

impl Model {
    pub fn new(vocabulary: Vocabulary, network: Box<dyn Network>) -> Self {
        Self {
            vocabulary,
            network,
        }
    }

    /// Load the exported network and its vocabulary from `model_dir`.
    ///
    /// `model_dir` must contain `classifier.onnx` and `gradients.onnx`;
    /// `pathologies.json` is optional.
    pub fn load(model_dir: &Path, intra_threads: usize) -> Result<Self, ModelLoadError> {
        if !model_dir.is_dir() {
            return Err(ModelLoadError::NotFound(model_dir.to_path_buf()));
        }

        let vocabulary = load_vocabulary(model_dir)?;
        let network = load_network(model_dir, intra_threads)?;

        tracing::info!(
            dir = %model_dir.display(),
            pathologies = vocabulary.len(),
            "Model loaded successfully"
        );

        Ok(Self::new(vocabulary, network))
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn network(&self) -> &dyn Network {
        self.network.as_ref()
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("vocabulary", &self.vocabulary)
            .finish_non_exhaustive()
    }
}

fn load_vocabulary(model_dir: &Path) -> Result<Vocabulary, ModelLoadError> {
    let path = model_dir.join(VOCABULARY_FILE);
    if path.exists() {
        Vocabulary::from_file(&path)
    } else {
        Ok(Vocabulary::densenet_all())
    }
}

#[cfg(feature = "onnx-runtime")]
fn load_network(model_dir: &Path, intra_threads: usize) -> Result<Box<dyn Network>, ModelLoadError> {
    Ok(Box::new(OnnxNetwork::load(model_dir, intra_threads)?))
}

#[cfg(not(feature = "onnx-runtime"))]
fn load_network(_model_dir: &Path, _intra_threads: usize) -> Result<Box<dyn Network>, ModelLoadError> {
    Err(ModelLoadError::BackendUnavailable)
}

// ═══════════════════════════════════════════════════════════
// ONNX network, behind the `onnx-runtime` feature
// ═══════════════════════════════════════════════════════════

#[cfg(feature = "onnx-runtime")]
mod onnx {
    use super::{
        AttributionError, InferenceError, ModelLoadError, Network, CLASSIFIER_FILE,
        GRADIENTS_FILE,
    };
    use ndarray::{Array2, Array4, ArrayView4};
    use ort::session::Session;
    use ort::value::TensorRef;
    use std::path::Path;
    use std::sync::Mutex;

    /// DenseNet exported as two ONNX graphs:
    /// - `classifier.onnx`: `f32 [N,1,224,224]` → `f32 [N,V]`
    /// - `gradients.onnx`: `f32 [N,1,224,224]`, `i64 [1]` target → `f32 [N,1,224,224]`
    ///
    /// Sessions sit behind a Mutex because `Session::run` takes `&mut self`.
    /// Concurrent requests queue on it, which is also how the device is shared.
    pub struct OnnxNetwork {
        classifier: Mutex<Session>,
        gradients: Mutex<Session>,
    }

    impl OnnxNetwork {
        pub fn load(model_dir: &Path, intra_threads: usize) -> Result<Self, ModelLoadError> {
            let classifier = open_session(&model_dir.join(CLASSIFIER_FILE), intra_threads)?;
            let gradients = open_session(&model_dir.join(GRADIENTS_FILE), intra_threads)?;
            Ok(Self {
                classifier: Mutex::new(classifier),
                gradients: Mutex::new(gradients),
            })
        }
    }

    fn open_session(path: &Path, intra_threads: usize) -> Result<Session, ModelLoadError> {
        if !path.exists() {
            return Err(ModelLoadError::NotFound(path.to_path_buf()));
        }
        let session = Session::builder()
            .map_err(|e: ort::Error| ModelLoadError::Init(e.to_string()))?
            .with_intra_threads(intra_threads)
            .map_err(|e: ort::Error| ModelLoadError::Init(e.to_string()))?
            .commit_from_file(path)
            .map_err(|e: ort::Error| {
                ModelLoadError::Init(format!("ONNX load failed for {}: {e}", path.display()))
            })?;
        tracing::debug!(path = %path.display(), "ONNX session ready");
        Ok(session)
    }

    impl Network for OnnxNetwork {
        fn forward(&self, batch: ArrayView4<'_, f32>) -> Result<Array2<f32>, InferenceError> {
            let input = batch.as_standard_layout().into_owned();
            let batch_size = input.shape()[0];
            let input_tensor = TensorRef::from_array_view(&input)
                .map_err(|e| InferenceError::Backend(e.to_string()))?;

            let mut session = self
                .classifier
                .lock()
                .map_err(|_| InferenceError::Backend("Classifier session lock poisoned".into()))?;
            let outputs = session
                .run(ort::inputs![input_tensor])
                .map_err(|e| InferenceError::Backend(format!("ONNX inference failed: {e}")))?;

            let (shape, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| InferenceError::Backend(format!("Output extraction: {e}")))?;

            if shape.len() != 2 || shape[0] as usize != batch_size {
                return Err(InferenceError::Backend(format!(
                    "Unexpected output shape: {shape:?}, expected [{batch_size}, V]"
                )));
            }
            let classes = shape[1] as usize;
            Array2::from_shape_vec((batch_size, classes), data.to_vec())
                .map_err(|e| InferenceError::Backend(e.to_string()))
        }

        fn input_gradients(
            &self,
            batch: ArrayView4<'_, f32>,
            target: usize,
        ) -> Result<Array4<f32>, AttributionError> {
            let input = batch.as_standard_layout().into_owned();
            let dims = input.dim();
            let target_array = ndarray::arr1(&[target as i64]);

            let input_tensor = TensorRef::from_array_view(&input)
                .map_err(|e| AttributionError::Backend(e.to_string()))?;
            let target_tensor = TensorRef::from_array_view(&target_array)
                .map_err(|e| AttributionError::Backend(e.to_string()))?;

            let mut session = self
                .gradients
                .lock()
                .map_err(|_| AttributionError::Backend("Gradient session lock poisoned".into()))?;
            let outputs = session
                .run(ort::inputs![input_tensor, target_tensor])
                .map_err(|e| AttributionError::Backend(format!("ONNX gradient pass failed: {e}")))?;

            let (shape, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| AttributionError::Backend(format!("Output extraction: {e}")))?;

            let actual: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
            let expected = vec![dims.0, dims.1, dims.2, dims.3];
            if actual != expected {
                return Err(AttributionError::GradientShape { expected, actual });
            }
            Array4::from_shape_vec(dims, data.to_vec())
                .map_err(|e| AttributionError::Backend(e.to_string()))
        }
    }
}

#[cfg(feature = "onnx-runtime")]
pub use onnx::OnnxNetwork;

// ═══════════════════════════════════════════════════════════
// LinearNetwork: analytic stand-in
// ═══════════════════════════════════════════════════════════

/// Linear scorer `score_c(x) = <W_c, x> + b_c` with exact gradients.
///
/// Used wherever a real DenseNet is unavailable (tests, local smoke runs).
/// Because the gradient is constant, integrated gradients on it has a closed
/// form: `W_target * (x - baseline)`.
pub struct LinearNetwork {
    weights: Array3<f32>,
    bias: Array1<f32>,
}

impl LinearNetwork {
    /// `weights` is `[V, H, W]`, `bias` is `[V]`.
    pub fn new(weights: Array3<f32>, bias: Array1<f32>) -> Result<Self, ModelLoadError> {
        if weights.shape()[0] != bias.len() {
            return Err(ModelLoadError::Init(format!(
                "{} weight planes but {} biases",
                weights.shape()[0],
                bias.len()
            )));
        }
        Ok(Self { weights, bias })
    }

    /// Deterministic weights with a distinct spatial pattern per class.
    pub fn seeded(classes: usize) -> Self {
        let weights = Array3::from_shape_fn((classes, INPUT_SIZE, INPUT_SIZE), |(c, i, j)| {
            let freq = (c + 1) as f32;
            1e-6 * (freq * i as f32 * 0.05 + (c % 3 + 1) as f32 * j as f32 * 0.03).sin()
        });
        Self {
            weights,
            bias: Array1::zeros(classes),
        }
    }

    pub fn classes(&self) -> usize {
        self.bias.len()
    }

    fn check_batch(&self, batch: &ArrayView4<'_, f32>) -> Result<(), Vec<usize>> {
        let (_, channels, h, w) = batch.dim();
        let (_, wh, ww) = self.weights.dim();
        if channels != 1 || h != wh || w != ww {
            return Err(vec![1, wh, ww]);
        }
        Ok(())
    }
}

impl Network for LinearNetwork {
    fn forward(&self, batch: ArrayView4<'_, f32>) -> Result<Array2<f32>, InferenceError> {
        if let Err(plane) = self.check_batch(&batch) {
            let mut expected = vec![batch.shape()[0]];
            expected.extend(plane);
            return Err(InferenceError::InputShape {
                expected,
                actual: batch.shape().to_vec(),
            });
        }
        let n = batch.shape()[0];
        let mut scores = Array2::zeros((n, self.classes()));
        for (b, image) in batch.index_axis(Axis(1), 0).outer_iter().enumerate() {
            for (c, plane) in self.weights.outer_iter().enumerate() {
                scores[[b, c]] = (&plane * &image).sum() + self.bias[c];
            }
        }
        Ok(scores)
    }

    fn input_gradients(
        &self,
        batch: ArrayView4<'_, f32>,
        target: usize,
    ) -> Result<Array4<f32>, AttributionError> {
        if target >= self.classes() {
            return Err(AttributionError::TargetOutOfRange {
                index: target,
                size: self.classes(),
            });
        }
        if let Err(plane) = self.check_batch(&batch) {
            let mut expected = vec![batch.shape()[0]];
            expected.extend(plane);
            return Err(AttributionError::GradientShape {
                expected,
                actual: batch.shape().to_vec(),
            });
        }
        let plane = self.weights.index_axis(Axis(0), target);
        Ok(Array4::from_shape_fn(batch.dim(), |(_, _, i, j)| plane[[i, j]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn densenet_vocabulary_has_18_unique_names() {
        let vocab = Vocabulary::densenet_all();
        assert_eq!(vocab.len(), 18);
        assert_eq!(vocab.name(0), Some("Atelectasis"));
        assert_eq!(vocab.index_of("Pneumonia"), Some(8));
        assert!(Vocabulary::new(vocab.names().to_vec()).is_ok());
    }

    #[test]
    fn vocabulary_rejects_duplicates_and_empty() {
        assert!(Vocabulary::new(vec![]).is_err());
        assert!(Vocabulary::new(vec!["Mass".into(), "Mass".into()]).is_err());
        assert!(Vocabulary::new(vec!["Mass".into(), "  ".into()]).is_err());
    }

    #[test]
    fn vocabulary_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(VOCABULARY_FILE);
        std::fs::write(&path, r#"["Edema", "Mass", "Nodule"]"#).unwrap();
        let vocab = Vocabulary::from_file(&path).unwrap();
        assert_eq!(vocab.names(), &["Edema", "Mass", "Nodule"]);
    }

    #[test]
    fn vocabulary_from_malformed_json_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(VOCABULARY_FILE);
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            Vocabulary::from_file(&path),
            Err(ModelLoadError::Vocabulary(_))
        ));
    }

    #[test]
    fn debug_output_lists_vocabulary() {
        let vocab = Vocabulary::new(vec!["Edema".into(), "Mass".into()]).unwrap();
        let model = Model::new(vocab, Box::new(LinearNetwork::seeded(2)));
        let rendered = format!("{model:?}");
        assert!(rendered.starts_with("Model"), "got {rendered}");
        assert!(rendered.contains("Edema") && rendered.contains("Mass"));
    }

    #[test]
    fn load_missing_directory_fails() {
        let err = Model::load(Path::new("/definitely/not/a/model/dir"), 1).unwrap_err();
        assert!(matches!(err, ModelLoadError::NotFound(_)));
    }

    #[cfg(not(feature = "onnx-runtime"))]
    #[test]
    fn load_without_backend_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let err = Model::load(dir.path(), 1).unwrap_err();
        assert!(matches!(err, ModelLoadError::BackendUnavailable));
    }

    #[cfg(feature = "onnx-runtime")]
    #[test]
    fn load_without_onnx_files_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = Model::load(dir.path(), 1).unwrap_err();
        assert!(matches!(err, ModelLoadError::NotFound(_)));
    }

    #[test]
    fn linear_forward_matches_dot_product() {
        let weights = Array3::from_shape_fn((2, 2, 2), |(c, i, j)| (c + i + j) as f32);
        let net = LinearNetwork::new(weights, Array1::from(vec![0.5, -1.0])).unwrap();
        let batch = Array4::from_elem((1, 1, 2, 2), 1.0);
        let scores = net.forward(batch.view()).unwrap();
        // class 0: 0+1+1+2 = 4, class 1: 1+2+2+3 = 8
        assert_eq!(scores[[0, 0]], 4.5);
        assert_eq!(scores[[0, 1]], 7.0);
    }

    #[test]
    fn linear_rejects_wrong_spatial_shape() {
        let net = LinearNetwork::seeded(3);
        let batch = Array4::zeros((1, 1, 100, 100));
        assert!(matches!(
            net.forward(batch.view()),
            Err(InferenceError::InputShape { .. })
        ));
    }

    #[test]
    fn linear_gradient_is_weight_plane() {
        let net = LinearNetwork::seeded(4);
        let batch = Array4::zeros((3, 1, INPUT_SIZE, INPUT_SIZE));
        let grads = net.input_gradients(batch.view(), 2).unwrap();
        assert_eq!(grads.shape(), &[3, 1, INPUT_SIZE, INPUT_SIZE]);
        assert_eq!(grads[[2, 0, 5, 7]], net.weights[[2, 5, 7]]);
    }

    #[test]
    fn linear_gradient_rejects_bad_target() {
        let net = LinearNetwork::seeded(4);
        let batch = Array4::zeros((1, 1, INPUT_SIZE, INPUT_SIZE));
        assert!(matches!(
            net.input_gradients(batch.view(), 4),
            Err(AttributionError::TargetOutOfRange { index: 4, size: 4 })
        ));
    }

    #[test]
    fn mismatched_bias_rejected() {
        assert!(LinearNetwork::new(Array3::zeros((3, 2, 2)), Array1::zeros(2)).is_err());
    }
}
