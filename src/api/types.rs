//! Shared state for API handlers.

use std::sync::Arc;

use crate::pipeline::AnalysisPipeline;

/// State handed to every handler via `State<ApiContext>`.
///
/// Cloned per request; the pipeline and model behind it are shared.
#[derive(Clone)]
pub struct ApiContext {
    pub pipeline: Arc<AnalysisPipeline>,
    /// Upload ceiling in bytes, reported back on 413.
    pub max_upload_bytes: usize,
}

impl ApiContext {
    pub fn new(pipeline: Arc<AnalysisPipeline>, max_upload_bytes: usize) -> Self {
        Self {
            pipeline,
            max_upload_bytes,
        }
    }

    pub fn max_upload_mb(&self) -> usize {
        self.max_upload_bytes / (1024 * 1024)
    }
}

/// Context backed by the analytic linear network, for handler tests.
#[cfg(test)]
pub(crate) fn linear_context(max_upload_bytes: usize) -> ApiContext {
    use crate::pipeline::{
        ColorMap, IntegratedGradients, LinearNetwork, Model, OverlayRenderer, QuadratureRule,
        Vocabulary, XRayPreprocessor,
    };

    let model = Arc::new(Model::new(
        Vocabulary::densenet_all(),
        Box::new(LinearNetwork::seeded(18)),
    ));
    let pipeline = AnalysisPipeline::new(
        model,
        Box::new(XRayPreprocessor::default().with_max_bytes(max_upload_bytes)),
        IntegratedGradients::new(4, QuadratureRule::GaussLegendre),
        OverlayRenderer::new(ColorMap::Bwr),
    );
    ApiContext::new(Arc::new(pipeline), max_upload_bytes)
}
