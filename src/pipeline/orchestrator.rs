use std::backtrace::Backtrace;
use std::sync::Arc;
use std::time::Instant;

use super::attribution::IntegratedGradients;
use super::classifier::Classifier;
use super::model::Model;
use super::overlay::OverlayRenderer;
use super::preprocess::{ImagePreprocessor, XRayPreprocessor};
use super::types::AnalysisReport;
use super::{InferenceError, PipelineError};
use crate::config::ServiceConfig;

/// Runs the five analysis stages for one upload.
///
/// Holds no per-request state, so one instance is shared across all requests.
pub struct AnalysisPipeline {
    model: Arc<Model>,
    preprocessor: Box<dyn ImagePreprocessor>,
    classifier: Classifier,
    attribution: IntegratedGradients,
    renderer: OverlayRenderer,
}

impl AnalysisPipeline {
    pub fn new(
        model: Arc<Model>,
        preprocessor: Box<dyn ImagePreprocessor>,
        attribution: IntegratedGradients,
        renderer: OverlayRenderer,
    ) -> Self {
        Self {
            classifier: Classifier::new(model.clone()),
            model,
            preprocessor,
            attribution,
            renderer,
        }
    }

    /// Wire every stage from service configuration.
    pub fn from_config(model: Arc<Model>, config: &ServiceConfig) -> Self {
        Self::new(
            model,
            Box::new(XRayPreprocessor::default().with_max_bytes(config.max_upload_bytes)),
            IntegratedGradients::new(config.ig_steps, config.ig_method)
                .with_internal_batch_size(config.ig_batch),
            OverlayRenderer::new(config.colormap),
        )
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Full analysis of one uploaded film.
    ///
    /// Any stage failure aborts the run. The failure is logged here, once,
    /// with its stage, the full error value and a backtrace (when
    /// `RUST_BACKTRACE` enables capture); callers only see the typed error.
    pub fn analyze(&self, image_bytes: &[u8]) -> Result<AnalysisReport, PipelineError> {
        let started = Instant::now();
        tracing::info!(bytes = image_bytes.len(), "Starting analysis");

        match self.run_stages(image_bytes) {
            Ok(report) => {
                tracing::info!(
                    top_pathology = %report.top_pathology,
                    top_probability = report.top_probability,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Analysis complete"
                );
                Ok(report)
            }
            Err(e) => {
                tracing::error!(
                    stage = e.stage(),
                    error = %e,
                    details = ?e,
                    backtrace = %Backtrace::capture(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Analysis failed"
                );
                Err(e)
            }
        }
    }

    fn run_stages(&self, image_bytes: &[u8]) -> Result<AnalysisReport, PipelineError> {
        // Step 1: Decode and normalize to a 224x224 tensor
        let tensor = self.preprocessor.preprocess(image_bytes)?;

        // Step 2: Score every pathology
        let predictions = self.classifier.classify(&tensor)?;

        // Step 3: Pick the most likely finding
        let top = predictions.top().ok_or(InferenceError::OutputShape {
            expected: self.model.vocabulary().len(),
            actual: 0,
        })?;
        tracing::debug!(pathology = %top.pathology, index = top.index, "Top finding");

        // Step 4: Explain it
        let attribution = self.attribution.attribute(&self.model, &tensor, top.index)?;

        // Step 5: Render the overlay
        let visualization = self
            .renderer
            .render(tensor.view(), attribution.view(), &top.pathology)?;

        Ok(AnalysisReport {
            top_pathology: top.pathology,
            top_probability: f64::from(top.score),
            predictions,
            visualization,
        })
    }
}
