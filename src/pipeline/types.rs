use ndarray::{Array2, Array4, ArrayView2, Axis};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use super::PreprocessingError;
use crate::config::INPUT_SIZE;

// ═══════════════════════════════════════════════════════════
// Tensors
// ═══════════════════════════════════════════════════════════

/// Single-channel 224x224 film, rescaled onto the network's input range.
///
/// The shape is checked on construction, so every stage downstream can rely
/// on it without re-validating.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTensor(Array2<f32>);

impl NormalizedTensor {
    pub fn new(data: Array2<f32>) -> Result<Self, PreprocessingError> {
        if data.dim() != (INPUT_SIZE, INPUT_SIZE) {
            return Err(PreprocessingError::Shape {
                expected: INPUT_SIZE,
                actual: data.shape().to_vec(),
            });
        }
        Ok(Self(data))
    }

    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.0.view()
    }

    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }

    /// Copy into the `[1, 1, H, W]` layout the network consumes.
    pub fn to_batch(&self) -> Array4<f32> {
        self.0
            .clone()
            .insert_axis(Axis(0))
            .insert_axis(Axis(0))
    }
}

/// Per-pixel contribution to one class score. Same spatial shape as the input.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributionMap(Array2<f32>);

impl AttributionMap {
    pub fn new(data: Array2<f32>) -> Self {
        Self(data)
    }

    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.0.view()
    }

    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }

    /// Total attribution. For integrated gradients this approximates
    /// `score(input) - score(baseline)`.
    pub fn total(&self) -> f32 {
        self.0.sum()
    }
}

// ═══════════════════════════════════════════════════════════
// Scores
// ═══════════════════════════════════════════════════════════

/// Score per pathology, kept in vocabulary order.
///
/// Order matters only for tie-breaking in [`PathologyScores::top`]; the JSON
/// form is an object keyed by pathology name.
#[derive(Debug, Clone, PartialEq)]
pub struct PathologyScores {
    entries: Vec<(String, f32)>,
}

impl PathologyScores {
    pub(crate) fn from_entries(entries: Vec<(String, f32)>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, pathology: &str) -> Option<f32> {
        self.entries
            .iter()
            .find(|(name, _)| name == pathology)
            .map(|(_, score)| *score)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.entries.iter().map(|(name, score)| (name.as_str(), *score))
    }

    /// Highest-scoring pathology. Ties go to the earliest entry in vocabulary order.
    pub fn top(&self) -> Option<TopFinding> {
        let mut best: Option<(usize, &str, f32)> = None;
        for (index, (name, score)) in self.entries.iter().enumerate() {
            match best {
                Some((_, _, best_score)) if *score <= best_score => {}
                _ => best = Some((index, name, *score)),
            }
        }
        best.map(|(index, name, score)| TopFinding {
            pathology: name.to_string(),
            index,
            score,
        })
    }
}

impl Serialize for PathologyScores {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, score) in &self.entries {
            map.serialize_entry(name, &f64::from(*score))?;
        }
        map.end()
    }
}

/// The most likely pathology and its position in the vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub struct TopFinding {
    pub pathology: String,
    pub index: usize,
    pub score: f32,
}

// ═══════════════════════════════════════════════════════════
// Output
// ═══════════════════════════════════════════════════════════

/// Base64-encoded PNG of the attribution overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct OverlayImage(String);

impl OverlayImage {
    pub fn new(base64_png: String) -> Self {
        Self(base64_png)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Complete result of one analysis, serialized as the `/analyze` response body.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub predictions: PathologyScores,
    pub top_pathology: String,
    pub top_probability: f64,
    pub visualization: OverlayImage,
}
