//! The inference service: model lifecycle and the per-request pipeline.
//!
//! A request moves through `Received -> Decoded -> Preprocessed -> Classified
//! -> AttributedGradCam -> AttributedGradCamPlusPlus -> Rendered ->
//! Responded`. The first failure ends the request with an [`AnalyzeError`]
//! naming the stage. All request state lives on the stack of
//! [`InferenceService::explain`]; the service itself is immutable after
//! construction and can be shared across threads.

use std::path::Path;
use std::sync::Arc;

use candle_core::Device;
use image::RgbImage;
use tracing::{debug, info, warn};

use crate::attribution::{Explainer, GradCam, GradCamPlusPlus};
use crate::domain::{AnalysisReport, ImportanceMap, Prediction, RawImage};
use crate::error::{AnalyzeError, Stage};
use crate::inference::{softmax, GlaucomaNet, TargetLayer};
use crate::ports::{Classifier, ContainerDecoder};
use crate::preprocess;
use crate::render::{self, VisualizationArtifact};

/// Everything produced for one image, before it is flattened into a report.
#[derive(Debug, Clone)]
pub struct Explanation {
    /// Predicted class and its probability.
    pub prediction: Prediction,
    /// Softmax distribution over classes.
    pub probabilities: Vec<f32>,
    /// One map per attribution method, in panel order.
    pub maps: Vec<ImportanceMap>,
    /// The rendered composite.
    pub artifact: VisualizationArtifact,
}

impl Explanation {
    /// Flattens into the wire report.
    #[must_use]
    pub fn report(&self) -> AnalysisReport {
        AnalysisReport::new(&self.prediction, self.artifact.data_uri())
    }
}

#[derive(Clone)]
enum ModelState {
    Ready(Arc<dyn Classifier>),
    Unavailable(String),
}

/// Classifies fundus images and explains the decision.
#[derive(Clone)]
pub struct InferenceService {
    model: ModelState,
    container: Option<Arc<dyn ContainerDecoder>>,
}

impl std::fmt::Debug for InferenceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let model = match &self.model {
            ModelState::Ready(c) => format!("ready (target {})", c.target_layer()),
            ModelState::Unavailable(reason) => format!("unavailable: {reason}"),
        };
        f.debug_struct("InferenceService")
            .field("model", &model)
            .field("container_decoder", &self.container.is_some())
            .finish()
    }
}

impl InferenceService {
    /// Loads the production classifier from a checkpoint.
    ///
    /// Never fails: when loading fails the service starts unavailable and
    /// every request is answered with [`AnalyzeError::ServiceUnavailable`].
    #[must_use]
    pub fn load(checkpoint: impl AsRef<Path>, device: &Device, target: TargetLayer) -> Self {
        let checkpoint = checkpoint.as_ref();
        match GlaucomaNet::load(checkpoint, device, target) {
            Ok(net) => {
                info!(path = %checkpoint.display(), %target, "Classifier loaded");
                Self::with_classifier(Arc::new(net))
            }
            Err(e) => {
                warn!(path = %checkpoint.display(), "Classifier failed to load: {e:#}");
                Self::unavailable(format!("{e:#}"))
            }
        }
    }

    /// Serves requests with an already built classifier.
    #[must_use]
    pub fn with_classifier(classifier: Arc<dyn Classifier>) -> Self {
        Self {
            model: ModelState::Ready(classifier),
            container: None,
        }
    }

    /// A service that rejects every request with `reason`.
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            model: ModelState::Unavailable(reason.into()),
            container: None,
        }
    }

    /// Enables decoding of medical containers (DICOM).
    #[must_use]
    pub fn with_container_decoder(mut self, decoder: Arc<dyn ContainerDecoder>) -> Self {
        self.container = Some(decoder);
        self
    }

    /// Whether a classifier is loaded.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self.model, ModelState::Ready(_))
    }

    /// Why the classifier is not loaded, if it is not.
    #[must_use]
    pub fn unavailable_reason(&self) -> Option<&str> {
        match &self.model {
            ModelState::Ready(_) => None,
            ModelState::Unavailable(reason) => Some(reason),
        }
    }

    /// Classifies an image and returns the wire report.
    ///
    /// # Errors
    ///
    /// See [`InferenceService::explain`].
    pub fn analyze(&self, raw: &RawImage<'_>) -> Result<AnalysisReport, AnalyzeError> {
        let report = self.explain(raw)?.report();
        debug!(stage = %Stage::Responded, class = report.prediction_class, "Request complete");
        Ok(report)
    }

    /// Runs the full pipeline and keeps every intermediate result.
    ///
    /// # Errors
    ///
    /// - [`AnalyzeError::ServiceUnavailable`] if no classifier is loaded
    /// - [`AnalyzeError::InvalidInput`] for non-image content types or
    ///   unreadable medical containers
    /// - [`AnalyzeError::Decode`] for undecodable image bytes
    /// - [`AnalyzeError::Attribution`] if a capture cycle fails
    /// - [`AnalyzeError::Inference`] for any other numeric failure
    pub fn explain(&self, raw: &RawImage<'_>) -> Result<Explanation, AnalyzeError> {
        let classifier = match &self.model {
            ModelState::Ready(c) => c.as_ref(),
            ModelState::Unavailable(reason) => {
                return Err(AnalyzeError::ServiceUnavailable(reason.clone()));
            }
        };

        debug!(stage = %Stage::Received, bytes = raw.bytes.len(), mime = %raw.mime_type, "Request received");
        if !raw.has_image_mime() {
            return Err(AnalyzeError::InvalidInput(format!(
                "unsupported content type '{}', expected image/* or application/dicom",
                raw.mime_type
            )));
        }

        let rgb = self.decode(raw)?;
        debug!(stage = %Stage::Decoded, width = rgb.width(), height = rgb.height(), "Image decoded");

        let input = preprocess::preprocess(&rgb, classifier.device())
            .map_err(|e| AnalyzeError::at(Stage::Preprocessed, e))?;
        drop(rgb);
        debug!(stage = %Stage::Preprocessed, "Input tensor ready");

        let logits = classifier
            .classify(input.tensor())
            .and_then(|t| t.flatten_all()?.to_vec1::<f32>())
            .map_err(|e| AnalyzeError::at(Stage::Classified, e))?;
        if logits.iter().any(|l| !l.is_finite()) {
            return Err(AnalyzeError::at(Stage::Classified, "classifier produced non-finite logits"));
        }
        let probabilities = softmax(&logits);
        let prediction = Prediction::from_probabilities(&probabilities)
            .ok_or_else(|| AnalyzeError::at(Stage::Classified, "classifier produced no logits"))?;
        debug!(
            stage = %Stage::Classified,
            class = prediction.class_index,
            probability = prediction.probability,
            "Image classified"
        );

        let explainers: [(&dyn Explainer, Stage); 2] = [
            (&GradCam, Stage::AttributedGradCam),
            (&GradCamPlusPlus, Stage::AttributedGradCamPlusPlus),
        ];
        let mut maps = Vec::with_capacity(explainers.len());
        for (explainer, stage) in explainers {
            let map = explainer
                .run(classifier, input.tensor(), Some(prediction.class_index))
                .map_err(|source| AnalyzeError::Attribution { stage, source })?;
            debug!(stage = %stage, method = %explainer.method(), max = map.max(), "Attribution map computed");
            maps.push(map);
        }

        let panels: Vec<&ImportanceMap> = maps.iter().collect();
        let artifact =
            render::render(input.tensor(), &panels).map_err(|e| AnalyzeError::at(Stage::Rendered, format!("{e:#}")))?;
        debug!(stage = %Stage::Rendered, png_bytes = artifact.png().len(), "Composite rendered");

        Ok(Explanation {
            prediction,
            probabilities,
            maps,
            artifact,
        })
    }

    fn decode(&self, raw: &RawImage<'_>) -> Result<RgbImage, AnalyzeError> {
        if !raw.is_dicom() {
            return preprocess::decode_raster(&raw.bytes);
        }
        let decoder = self
            .container
            .as_ref()
            .ok_or_else(|| AnalyzeError::InvalidInput("DICOM input is not supported by this service".into()))?;
        decoder
            .decode(&raw.bytes)
            .map_err(|e| AnalyzeError::InvalidInput(format!("unreadable DICOM file: {e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_service_rejects_everything() {
        let service = InferenceService::unavailable("checkpoint missing");
        assert!(!service.is_ready());
        assert_eq!(service.unavailable_reason(), Some("checkpoint missing"));
        let err = service
            .analyze(&RawImage::new(b"whatever", "text/plain"))
            .err();
        assert!(matches!(err, Some(AnalyzeError::ServiceUnavailable(_))));
    }

    #[test]
    fn test_load_failure_is_not_a_crash() {
        let service = InferenceService::load("/nonexistent/model.safetensors", &Device::Cpu, TargetLayer::FinalConv);
        assert!(!service.is_ready());
        assert!(service.unavailable_reason().is_some_and(|r| r.contains("model.safetensors")));
    }
}
