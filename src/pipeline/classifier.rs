use std::sync::Arc;

use tracing::debug;

use super::model::Model;
use super::types::{NormalizedTensor, PathologyScores};
use super::InferenceError;

/// Forward-only adapter: one tensor in, one score per vocabulary pathology out.
#[derive(Clone)]
pub struct Classifier {
    model: Arc<Model>,
}

impl Classifier {
    pub fn new(model: Arc<Model>) -> Self {
        Self { model }
    }

    /// Run a single image through the network.
    ///
    /// Adds the batch and channel axes, runs the forward pass, and pairs the
    /// outputs with the vocabulary position by position.
    pub fn classify(&self, tensor: &NormalizedTensor) -> Result<PathologyScores, InferenceError> {
        let vocabulary = self.model.vocabulary();
        let batch = tensor.to_batch();
        let raw = self.model.network().forward(batch.view())?;

        if raw.nrows() != 1 || raw.ncols() != vocabulary.len() {
            return Err(InferenceError::OutputShape {
                expected: vocabulary.len(),
                actual: raw.len(),
            });
        }

        let mut entries = Vec::with_capacity(vocabulary.len());
        for (name, &score) in vocabulary.names().iter().zip(raw.row(0).iter()) {
            if !score.is_finite() {
                return Err(InferenceError::NonFinite {
                    pathology: name.clone(),
                });
            }
            entries.push((name.clone(), score));
        }

        debug!(pathologies = entries.len(), "Predictions generated");
        Ok(PathologyScores::from_entries(entries))
    }
}
