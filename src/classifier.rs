use crate::batcher::Batch;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassifierError {
    #[error("Failed to load model: {0}")]
    LoadFailed(String),
    #[error("Inference failed: {0}")]
    InferenceFailed(String),
    #[error("Expected {expected} predictions, got {actual}")]
    BatchMismatch { expected: usize, actual: usize },
    #[error("Prediction {index} has {actual} classes, expected {expected}")]
    ClassCountMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("Inference task failed: {0}")]
    TaskFailed(String),
}

/// Class probabilities for one frame, in class-index order.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    probabilities: Vec<f32>,
}

impl Prediction {
    pub fn new(probabilities: Vec<f32>) -> Self {
        Self { probabilities }
    }

    pub fn probabilities(&self) -> &[f32] {
        &self.probabilities
    }

    pub fn len(&self) -> usize {
        self.probabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probabilities.is_empty()
    }

    /// Index of the highest probability; the lowest index wins ties.
    /// NaN entries never win.
    pub fn argmax(&self) -> Option<usize> {
        let mut best: Option<(usize, f32)> = None;
        for (index, &p) in self.probabilities.iter().enumerate() {
            if p.is_nan() {
                continue;
            }
            match best {
                Some((_, top)) if p <= top => {}
                _ => best = Some((index, p)),
            }
        }
        best.map(|(index, _)| index)
    }

    /// `weed=90.00% crop=5.00% ground=5.00%`
    pub fn describe(&self, labels: &[String]) -> String {
        self.probabilities
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let label = labels.get(i).map(String::as_str).unwrap_or("?");
                format!("{}={:.2}%", label, p * 100.0)
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

pub fn softmax(values: &mut [f32]) {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in values.iter_mut() {
            *v /= sum;
        }
    }
}

/// A loaded, fixed-shape batched image classifier.
///
/// `classify` blocks for the duration of inference.
pub trait ClassifierBackend: Send + Sync {
    fn classify(&self, batch: Batch) -> Result<Vec<Prediction>, ClassifierError>;
}

/// Checks that a backend answered one prediction of `num_classes` entries
/// per frame.
pub fn check_predictions(
    batch_len: usize,
    num_classes: usize,
    predictions: Vec<Prediction>,
) -> Result<Vec<Prediction>, ClassifierError> {
    if predictions.len() != batch_len {
        return Err(ClassifierError::BatchMismatch {
            expected: batch_len,
            actual: predictions.len(),
        });
    }
    if let Some((index, p)) = predictions
        .iter()
        .enumerate()
        .find(|(_, p)| p.len() != num_classes)
    {
        return Err(ClassifierError::ClassCountMismatch {
            index,
            expected: num_classes,
            actual: p.len(),
        });
    }
    Ok(predictions)
}
