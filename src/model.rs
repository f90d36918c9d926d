use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::sample::ImageSample;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionEntry {
    pub label: String,
    pub confidence: f32,
}

impl PredictionEntry {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("labels file {path} is not a JSON array of strings: {source}")]
    LabelsFormat {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("labels file {0} contains no labels")]
    EmptyLabels(PathBuf),
    #[error("model produced {outputs} scores but {labels} labels are loaded")]
    LabelMismatch { outputs: usize, labels: usize },
    #[error("operation '{0}' not found in graph")]
    MissingOperation(String),
    #[error("model runtime error: {0}")]
    Runtime(String),
}

/// Anything that turns one image sample into its top-k labelled scores.
///
/// Implementations own their input preprocessing: a sample may arrive with
/// intensities in 0..=255 or already scaled to 0..=1, and the adapter must
/// accept both. Results are sorted by descending confidence.
pub trait Classifier: Send + Sync {
    fn top_k(&self, sample: &ImageSample, k: usize) -> Result<Vec<PredictionEntry>, ClassifierError>;
}

/// Loads the index -> label vocabulary.
///
/// `.json` files hold an array of strings, anything else is read as one
/// label per line.
pub fn load_labels(path: impl AsRef<Path>) -> Result<Vec<String>, ClassifierError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ClassifierError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let is_json = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));

    let labels: Vec<String> = if is_json {
        serde_json::from_str(&text).map_err(|source| ClassifierError::LabelsFormat {
            path: path.to_path_buf(),
            source,
        })?
    } else {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect()
    };

    if labels.is_empty() {
        return Err(ClassifierError::EmptyLabels(path.to_path_buf()));
    }
    Ok(labels)
}

/// Pairs raw scores with their labels and keeps the `k` best.
///
/// The sort is stable, so equal scores keep vocabulary order. NaN scores
/// sink to the bottom.
pub fn rank_top_k(
    probs: &[f32],
    labels: &[String],
    k: usize,
) -> Result<Vec<PredictionEntry>, ClassifierError> {
    if probs.len() != labels.len() {
        return Err(ClassifierError::LabelMismatch {
            outputs: probs.len(),
            labels: labels.len(),
        });
    }

    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| match (probs[a].is_nan(), probs[b].is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => probs[b].partial_cmp(&probs[a]).unwrap_or(Ordering::Equal),
    });

    Ok(order
        .into_iter()
        .take(k)
        .map(|i| PredictionEntry::new(labels[i].clone(), probs[i]))
        .collect())
}

/// Scales a sample to the 0..=255 range the graph expects.
///
/// A sample whose largest value is at most 1.0 is taken to be pre-normalised.
pub fn to_model_input(sample: &ImageSample) -> Vec<f32> {
    let max = sample.data().iter().copied().fold(f32::MIN, f32::max);
    if max <= 1.0 {
        sample.data().iter().map(|v| v * 255.0).collect()
    } else {
        sample.data().to_vec()
    }
}

#[cfg(feature = "tensorflow")]
pub use self::tf::TfClassifier;

#[cfg(feature = "tensorflow")]
mod tf {
    use std::path::Path;

    use tensorflow::{Graph, ImportGraphDefOptions, Session, SessionOptions, SessionRunArgs, Tensor};

    use super::{load_labels, rank_top_k, to_model_input, Classifier, ClassifierError, PredictionEntry};
    use crate::sample::ImageSample;

    /// Frozen TensorFlow graph plus its label vocabulary.
    ///
    /// Built once at startup; `Session::run` takes `&self`, so a single
    /// instance serves concurrent requests without locking.
    pub struct TfClassifier {
        session: Session,
        graph: Graph,
        labels: Vec<String>,
        input_op: String,
        output_op: String,
    }

    impl TfClassifier {
        pub fn new(
            model_path: impl AsRef<Path>,
            labels_path: impl AsRef<Path>,
            input_op: &str,
            output_op: &str,
        ) -> Result<Self, ClassifierError> {
            let model_path = model_path.as_ref();
            let model_bytes = std::fs::read(model_path).map_err(|source| ClassifierError::Io {
                path: model_path.to_path_buf(),
                source,
            })?;

            let mut graph = Graph::new();
            graph
                .import_graph_def(&model_bytes, &ImportGraphDefOptions::new())
                .map_err(runtime)?;

            for name in [input_op, output_op] {
                graph
                    .operation_by_name(name)
                    .map_err(runtime)?
                    .ok_or_else(|| ClassifierError::MissingOperation(name.to_string()))?;
            }

            let session = Session::new(&SessionOptions::new(), &graph).map_err(runtime)?;
            let labels = load_labels(labels_path)?;

            tracing::info!(
                model = %model_path.display(),
                labels = labels.len(),
                "classifier loaded"
            );

            Ok(Self {
                session,
                graph,
                labels,
                input_op: input_op.to_string(),
                output_op: output_op.to_string(),
            })
        }

        fn operation(&self, name: &str) -> Result<tensorflow::Operation, ClassifierError> {
            self.graph
                .operation_by_name(name)
                .map_err(runtime)?
                .ok_or_else(|| ClassifierError::MissingOperation(name.to_string()))
        }
    }

    impl Classifier for TfClassifier {
        fn top_k(
            &self,
            sample: &ImageSample,
            k: usize,
        ) -> Result<Vec<PredictionEntry>, ClassifierError> {
            let input = to_model_input(sample);
            let mut input_tensor = Tensor::<f32>::new(&[
                1,
                u64::from(sample.height()),
                u64::from(sample.width()),
                3,
            ]);
            input_tensor.copy_from_slice(&input);

            let input_operation = self.operation(&self.input_op)?;
            let output_operation = self.operation(&self.output_op)?;

            let mut args = SessionRunArgs::new();
            args.add_feed(&input_operation, 0, &input_tensor);
            let output_token = args.request_fetch(&output_operation, 0);
            self.session.run(&mut args).map_err(runtime)?;

            let output_tensor: Tensor<f32> = args.fetch(output_token).map_err(runtime)?;
            rank_top_k(&output_tensor, &self.labels, k)
        }
    }

    fn runtime(status: tensorflow::Status) -> ClassifierError {
        ClassifierError::Runtime(status.to_string())
    }
}
