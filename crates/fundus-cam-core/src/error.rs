//! Closed error taxonomy of the analyze pipeline.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Pipeline stage of a single analyze request, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Received,
    Decoded,
    Preprocessed,
    Classified,
    AttributedGradCam,
    AttributedGradCamPlusPlus,
    Rendered,
    Responded,
}

impl Stage {
    /// Stable name used in logs and error bodies.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Decoded => "decoded",
            Self::Preprocessed => "preprocessed",
            Self::Classified => "classified",
            Self::AttributedGradCam => "attributed_grad_cam",
            Self::AttributedGradCamPlusPlus => "attributed_grad_cam_plus_plus",
            Self::Rendered => "rendered",
            Self::Responded => "responded",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of the attribution engine.
///
/// Always an internal defect; never returned as an empty map.
#[derive(Debug, Error)]
pub enum AttributionError {
    /// The backward pass produced no gradient for the captured layer.
    #[error("no gradient was captured for layer '{layer}'")]
    MissingGradient { layer: String },

    /// The captured activation does not have the `[1, C, H, W]` layout.
    #[error("unexpected activation shape {shape:?} at layer '{layer}'")]
    UnexpectedShape { layer: String, shape: Vec<usize> },

    /// Activation and gradient come from different cycles or layers.
    #[error("activation shape {activation:?} does not match gradient shape {gradient:?}")]
    ShapeMismatch {
        activation: Vec<usize>,
        gradient: Vec<usize>,
    },

    /// The requested target class is not an output of the classifier.
    #[error("target class {class} out of range for {classes} classes")]
    InvalidTarget { class: usize, classes: usize },

    /// The map contains NaN or infinite values.
    #[error("{method} map contains non-finite values")]
    NonFinite { method: String },

    /// The captured activation or gradient contains NaN or infinite values.
    #[error("{tensor} of layer '{layer}' contains non-finite values")]
    NonFiniteCapture { layer: String, tensor: &'static str },

    /// Tensor computation failed during the forward/backward cycle.
    #[error("tensor computation failed: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// Error returned by the single `analyze` entry point.
#[derive(Debug, Error)]
pub enum AnalyzeError {
    /// Wrong content type or unreadable medical container. Client error.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Bytes are not a decodable raster image. Client error.
    #[error("could not decode image: {0}")]
    Decode(String),

    /// Attribution capture failed. Server error.
    #[error("attribution failed at stage '{stage}': {source}")]
    Attribution {
        stage: Stage,
        #[source]
        source: AttributionError,
    },

    /// The classifier is not loaded.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The request did not finish within the configured bound.
    #[error("analysis timed out after {}s", .0.as_secs())]
    TimedOut(Duration),

    /// Any other numeric failure, tagged with the stage it happened in.
    #[error("analysis failed at stage '{stage}': {reason}")]
    Inference { stage: Stage, reason: String },
}

impl AnalyzeError {
    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Decode(_) => "decode_error",
            Self::Attribution { .. } => "attribution_error",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::TimedOut(_) => "timed_out",
            Self::Inference { .. } => "inference_error",
        }
    }

    /// HTTP-equivalent status code.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::InvalidInput(_) | Self::Decode(_) => 400,
            Self::Attribution { .. } | Self::Inference { .. } => 500,
            Self::ServiceUnavailable(_) => 503,
            Self::TimedOut(_) => 504,
        }
    }

    /// True for errors caused by the caller's input.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidInput(_) | Self::Decode(_))
    }

    /// Stage the failure happened in, when the pipeline had started.
    #[must_use]
    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::InvalidInput(_) | Self::ServiceUnavailable(_) | Self::TimedOut(_) => None,
            Self::Decode(_) => Some(Stage::Decoded),
            Self::Attribution { stage, .. } | Self::Inference { stage, .. } => Some(*stage),
        }
    }

    /// Wraps a numeric failure at `stage`.
    pub fn at(stage: Stage, err: impl fmt::Display) -> Self {
        Self::Inference {
            stage,
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_statuses() {
        let cases = [
            (AnalyzeError::InvalidInput("x".into()), "invalid_input", 400),
            (AnalyzeError::Decode("x".into()), "decode_error", 400),
            (AnalyzeError::ServiceUnavailable("x".into()), "service_unavailable", 503),
            (AnalyzeError::TimedOut(Duration::from_secs(60)), "timed_out", 504),
            (AnalyzeError::at(Stage::Rendered, "boom"), "inference_error", 500),
        ];
        for (err, code, status) in cases {
            assert_eq!(err.code(), code);
            assert_eq!(err.status_code(), status);
        }
    }

    #[test]
    fn test_inference_error_names_stage() {
        let err = AnalyzeError::at(Stage::Classified, "bad tensor");
        assert_eq!(err.stage(), Some(Stage::Classified));
        assert!(err.to_string().contains("classified"));
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_attribution_error_keeps_stage() {
        let err = AnalyzeError::Attribution {
            stage: Stage::AttributedGradCamPlusPlus,
            source: AttributionError::MissingGradient {
                layer: "final_conv".into(),
            },
        };
        assert_eq!(err.code(), "attribution_error");
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.stage(), Some(Stage::AttributedGradCamPlusPlus));
        assert!(err.to_string().contains("final_conv"));
    }

    #[test]
    fn test_timeout_message() {
        let err = AnalyzeError::TimedOut(Duration::from_secs(30));
        assert_eq!(err.to_string(), "analysis timed out after 30s");
    }
}
