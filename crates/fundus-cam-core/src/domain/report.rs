//! Prediction and analysis report types.

use serde::{Deserialize, Serialize};

use crate::inference::argmax;

/// Human-readable labels, indexed by class.
pub const CLASS_LABELS: [&str; 2] = ["No Glaucoma", "Glaucoma Detected"];

/// Number of output classes of the classifier.
pub const NUM_CLASSES: usize = CLASS_LABELS.len();

/// Classification outcome derived from the two-class distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Index of the most probable class (0 or 1).
    pub class_index: usize,
    /// Label of `class_index`.
    pub label: String,
    /// Softmax probability of `class_index`.
    pub probability: f32,
}

impl Prediction {
    /// Builds a prediction from a softmax distribution. Ties go to the lower
    /// class index.
    ///
    /// Returns `None` if `probs` is empty or contains a non-finite value.
    #[must_use]
    pub fn from_probabilities(probs: &[f32]) -> Option<Self> {
        if probs.iter().any(|p| !p.is_finite()) {
            return None;
        }
        let class_index = argmax(probs)?;
        let probability = *probs.get(class_index)?;

        let label = CLASS_LABELS
            .get(class_index)
            .map_or_else(|| format!("Class {class_index}"), ToString::to_string);

        Some(Self {
            class_index,
            label,
            probability,
        })
    }
}

/// Result of one `analyze` call, as sent over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Predicted class index.
    pub prediction_class: usize,
    /// Predicted class label.
    pub prediction_label: String,
    /// Probability of the predicted class, rounded to 4 decimals.
    pub probability: f32,
    /// Composite heatmap as a `data:image/png;base64,...` URI.
    pub heatmap_image: String,
}

impl AnalysisReport {
    /// Assembles a report from a prediction and a rendered data URI.
    #[must_use]
    pub fn new(prediction: &Prediction, heatmap_image: String) -> Self {
        Self {
            prediction_class: prediction.class_index,
            prediction_label: prediction.label.clone(),
            probability: round4(prediction.probability),
            heatmap_image,
        }
    }
}

/// One line of batch output: a report for a file on disk.
///
/// The heatmap is referenced by path instead of being inlined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    /// Source image path.
    pub path: String,
    pub prediction_class: usize,
    pub prediction_label: String,
    pub probability: f32,
    /// Where the composite PNG was written, if requested.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub heatmap_path: Option<String>,
}

impl ReportEntry {
    /// Builds an entry from a report.
    #[must_use]
    pub fn new(path: impl Into<String>, report: &AnalysisReport, heatmap_path: Option<String>) -> Self {
        Self {
            path: path.into(),
            prediction_class: report.prediction_class,
            prediction_label: report.prediction_label.clone(),
            probability: report.probability,
            heatmap_path,
        }
    }
}

fn round4(value: f32) -> f32 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prediction_argmax() {
        let p = Prediction::from_probabilities(&[0.2, 0.8]);
        assert!(p.is_some());
        let p = p.unwrap_or_else(|| panic!("prediction"));
        assert_eq!(p.class_index, 1);
        assert_eq!(p.label, "Glaucoma Detected");
        assert!((p.probability - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_prediction_empty() {
        assert!(Prediction::from_probabilities(&[]).is_none());
        assert!(Prediction::from_probabilities(&[f32::NAN]).is_none());
        assert!(Prediction::from_probabilities(&[0.3, f32::NAN]).is_none());
    }

    #[test]
    fn test_prediction_tie_picks_first_class() {
        let p = Prediction::from_probabilities(&[0.5, 0.5]).unwrap_or_else(|| panic!("prediction"));
        assert_eq!(p.class_index, 0);
        assert_eq!(p.label, "No Glaucoma");
        assert!((p.probability - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_report_rounds_probability() {
        let p = Prediction {
            class_index: 0,
            label: CLASS_LABELS[0].to_string(),
            probability: 0.123_456,
        };
        let report = AnalysisReport::new(&p, "data:image/png;base64,".into());
        assert!((report.probability - 0.1235).abs() < 1e-6);
        assert_eq!(report.prediction_label, "No Glaucoma");
    }

    #[test]
    fn test_report_entry_omits_missing_heatmap() {
        let p = Prediction {
            class_index: 1,
            label: CLASS_LABELS[1].to_string(),
            probability: 0.9,
        };
        let report = AnalysisReport::new(&p, "data:image/png;base64,AAAA".into());
        let entry = ReportEntry::new("eye.png", &report, None);
        let json = serde_json::to_string(&entry).unwrap_or_default();
        assert!(!json.contains("heatmap"));
        assert!(json.contains("\"prediction_class\":1"));
    }
}
