use serde::Serialize;

use crate::model::{Classifier, ClassifierError, PredictionEntry};
use crate::sample::ImageSample;

pub const UNKNOWN_LABEL: &str = "unknown";
const LABEL_SEPARATOR: &str = "___";

const UNCLEAR_IMAGE_NOTE: &str = "Upload a clear close-up leaf photo.";
const NOT_A_LEAF_NOTE: &str = "Not a leaf image (low green content). Upload a clear leaf photo.";
const LOW_CONFIDENCE_NOTE: &str = "Low confidence prediction. Try a clearer close-up leaf photo.";

/// Thresholds the pipeline applies. Fixed at construction time.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub top1_min: f32,
    pub margin_min: f32,
    pub min_std: f64,
    pub min_brightness: f64,
    pub max_brightness: f64,
    pub leaf_green_ratio_min: f64,
    pub top_k: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            top1_min: 0.55,
            margin_min: 0.10,
            min_std: 12.0,
            min_brightness: 20.0,
            max_brightness: 245.0,
            // low enough to let powdery or pale leaves through
            leaf_green_ratio_min: 0.04,
            top_k: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Category {
    Healthy,
    Powdery,
    Rust,
    OtherDisease,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    Healthy,
    Diseased,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosisDebug {
    pub green_ratio: f64,
    #[serde(rename = "LEAF_GREEN_RATIO_MIN", skip_serializing_if = "Option::is_none")]
    pub leaf_green_ratio_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top1: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top2: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub margin: Option<f64>,
    #[serde(rename = "TOP1_MIN", skip_serializing_if = "Option::is_none")]
    pub top1_min: Option<f64>,
    #[serde(rename = "MARGIN_MIN", skip_serializing_if = "Option::is_none")]
    pub margin_min: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosisResult {
    pub top_label: String,
    pub top_confidence: Option<f64>,
    pub category: Category,
    pub crop: Option<String>,
    pub status: Option<Status>,
    pub disease: Option<String>,
    pub predictions: Vec<RoundedPrediction>,
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<DiagnosisDebug>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundedPrediction {
    pub label: String,
    pub confidence: f64,
}

impl DiagnosisResult {
    fn abstained(note: String, predictions: Vec<RoundedPrediction>, debug: Option<DiagnosisDebug>) -> Self {
        Self {
            top_label: UNKNOWN_LABEL.to_string(),
            top_confidence: None,
            category: Category::Unknown,
            crop: None,
            status: None,
            disease: None,
            predictions,
            note: Some(note),
            debug,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QualityReport {
    pub mean: f64,
    pub std: f64,
    pub failure: Option<String>,
}

/// Checks the grayscale mean and spread of the sample.
///
/// Grayscale is the plain average of the three channels; std is the
/// population standard deviation.
pub fn quality_gate(sample: &ImageSample, config: &PipelineConfig) -> QualityReport {
    let n = sample.pixel_count();
    if n == 0 {
        return QualityReport {
            mean: 0.0,
            std: 0.0,
            failure: Some("Low detail/flat image (std=0.0)".to_string()),
        };
    }

    let gray = || {
        sample
            .pixels()
            .map(|[r, g, b]| (f64::from(r) + f64::from(g) + f64::from(b)) / 3.0)
    };
    let mean = gray().sum::<f64>() / n as f64;
    let variance = gray().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n as f64;
    let std = variance.sqrt();

    let failure = if std < config.min_std {
        Some(format!("Low detail/flat image (std={std:.1})"))
    } else if mean < config.min_brightness {
        Some(format!("Image too dark (mean={mean:.1})"))
    } else if mean > config.max_brightness {
        Some(format!("Image too bright (mean={mean:.1})"))
    } else {
        None
    };

    QualityReport { mean, std, failure }
}

/// Fraction of clearly green pixels, and whether it clears the threshold.
pub fn leafness_gate(sample: &ImageSample, config: &PipelineConfig) -> (bool, f64) {
    let n = sample.pixel_count();
    if n == 0 {
        return (false, 0.0);
    }

    let green = sample
        .pixels()
        .filter(|&[r, g, b]| g > 60.0 && g > r + 10.0 && g > b + 10.0)
        .count();
    let ratio = green as f64 / n as f64;

    (ratio >= config.leaf_green_ratio_min, ratio)
}

/// Splits `Crop___Condition` into crop, status and disease.
///
/// A label without the separator is treated as both crop and condition.
pub fn parse_label(label: &str) -> (String, Status, Option<String>) {
    let (crop, condition) = label.split_once(LABEL_SEPARATOR).unwrap_or((label, label));
    if condition.eq_ignore_ascii_case("healthy") {
        (crop.to_string(), Status::Healthy, None)
    } else {
        (crop.to_string(), Status::Diseased, Some(condition.replace('_', " ")))
    }
}

pub fn to_category(label: &str) -> Category {
    if label == UNKNOWN_LABEL {
        return Category::Unknown;
    }

    let condition = label
        .split_once(LABEL_SEPARATOR)
        .map_or(label, |(_, condition)| condition)
        .to_lowercase();

    if condition == "healthy" {
        Category::Healthy
    } else if condition.contains("powdery") && condition.contains("mildew") {
        Category::Powdery
    } else if condition.contains("rust") {
        Category::Rust
    } else {
        Category::OtherDisease
    }
}

/// Rounds to 4 decimal places, exact ties going to the even digit.
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round_ties_even() / 10_000.0
}

/// Applies the abstention policy to the classifier's ranked output.
///
/// A missing runner-up counts as confidence 0.0, so the margin check
/// always runs.
pub fn resolve(predictions: &[PredictionEntry], green_ratio: f64, config: &PipelineConfig) -> DiagnosisResult {
    let top1 = predictions.first().map_or(0.0, |p| p.confidence);
    let top2 = predictions.get(1).map_or(0.0, |p| p.confidence);
    let margin = top1 - top2;

    let low_conf = top1 < config.top1_min || margin < config.margin_min || margin.is_nan();

    let rounded = predictions
        .iter()
        .map(|p| RoundedPrediction {
            label: p.label.clone(),
            confidence: round4(f64::from(p.confidence)),
        })
        .collect();

    let debug = Some(DiagnosisDebug {
        green_ratio: round4(green_ratio),
        leaf_green_ratio_min: None,
        top1: Some(round4(f64::from(top1))),
        top2: Some(round4(f64::from(top2))),
        margin: Some(round4(f64::from(margin))),
        top1_min: Some(round4(f64::from(config.top1_min))),
        margin_min: Some(round4(f64::from(config.margin_min))),
    });

    let top_label = predictions.first().map_or(UNKNOWN_LABEL, |p| p.label.as_str());
    if low_conf || top_label == UNKNOWN_LABEL {
        tracing::info!(top1, top2, margin, "low confidence, abstaining");
        return DiagnosisResult::abstained(LOW_CONFIDENCE_NOTE.to_string(), rounded, debug);
    }

    let (crop, status, disease) = parse_label(top_label);
    DiagnosisResult {
        top_label: top_label.to_string(),
        top_confidence: Some(round4(f64::from(top1))),
        category: to_category(top_label),
        crop: Some(crop),
        status: Some(status),
        disease,
        predictions: rounded,
        note: None,
        debug,
    }
}

/// Quality gate, leafness gate, classifier, abstention, in that order.
pub struct Pipeline {
    config: PipelineConfig,
    classifier: Box<dyn Classifier>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, classifier: Box<dyn Classifier>) -> Self {
        Self { config, classifier }
    }

    pub fn diagnose(&self, sample: &ImageSample) -> Result<DiagnosisResult, ClassifierError> {
        let quality = quality_gate(sample, &self.config);
        if let Some(reason) = quality.failure {
            tracing::info!(mean = quality.mean, std = quality.std, %reason, "quality gate rejected image");
            return Ok(DiagnosisResult::abstained(
                format!("Unclear image: {reason}. {UNCLEAR_IMAGE_NOTE}"),
                Vec::new(),
                None,
            ));
        }

        let (is_leaf, green_ratio) = leafness_gate(sample, &self.config);
        if !is_leaf {
            tracing::info!(green_ratio, "leafness gate rejected image");
            return Ok(DiagnosisResult::abstained(
                NOT_A_LEAF_NOTE.to_string(),
                Vec::new(),
                Some(DiagnosisDebug {
                    green_ratio: round4(green_ratio),
                    leaf_green_ratio_min: Some(self.config.leaf_green_ratio_min),
                    top1: None,
                    top2: None,
                    margin: None,
                    top1_min: None,
                    margin_min: None,
                }),
            ));
        }

        let predictions = self
            .classifier
            .top_k(sample, self.config.top_k)
            .map_err(|err| {
                tracing::error!(error = %err, "classifier invocation failed");
                err
            })?;

        Ok(resolve(&predictions, green_ratio, &self.config))
    }
}
