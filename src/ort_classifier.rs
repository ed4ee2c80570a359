use crate::batcher::Batch;
use crate::classifier::{softmax, ClassifierBackend, ClassifierError, Prediction};
use crate::config::ClassifierConfig;
use ndarray::{Array4, ArrayD, Axis, Ix2};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use parking_lot::Mutex;
use tracing::instrument;

/// Classifier backed by an ONNX Runtime session.
pub struct OrtClassifier {
    session: Mutex<Session>,
    output_name: String,
    apply_softmax: bool,
}

fn load_error(e: impl std::fmt::Display) -> ClassifierError {
    ClassifierError::LoadFailed(e.to_string())
}

fn inference_error(e: impl std::fmt::Display) -> ClassifierError {
    ClassifierError::InferenceFailed(e.to_string())
}

impl OrtClassifier {
    pub fn new(config: &ClassifierConfig) -> Result<Self, ClassifierError> {
        if !config.model_path.exists() {
            return Err(ClassifierError::LoadFailed(format!(
                "model file not found: {:?}",
                config.model_path
            )));
        }

        let mut builder = Session::builder()
            .map_err(load_error)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(load_error)?;
        if let Some(threads) = config.intra_threads {
            builder = builder.with_intra_threads(threads).map_err(load_error)?;
        }
        let session = builder
            .commit_from_file(&config.model_path)
            .map_err(load_error)?;

        let output_name = session
            .outputs
            .first()
            .map(|output| output.name.clone())
            .ok_or_else(|| ClassifierError::LoadFailed("model has no outputs".into()))?;

        tracing::info!(
            model = ?config.model_path,
            output = %output_name,
            "Loaded classifier model"
        );

        Ok(Self {
            session: Mutex::new(session),
            output_name,
            apply_softmax: config.apply_softmax,
        })
    }

    fn run_inference(&self, input: &Array4<f32>) -> Result<ArrayD<f32>, ClassifierError> {
        let mut session = self.session.lock();

        let owned_buffer;
        let input_view = if input.view().is_standard_layout() {
            input.view()
        } else {
            owned_buffer = input.as_standard_layout().to_owned();
            owned_buffer.view()
        };

        let tensor_ref = TensorRef::from_array_view(input_view).map_err(inference_error)?;
        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(inference_error)?;

        let (shape, data) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(inference_error)?;

        ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec()).map_err(inference_error)
    }
}

impl ClassifierBackend for OrtClassifier {
    #[instrument(skip(self, batch), fields(frames = batch.len()))]
    fn classify(&self, batch: Batch) -> Result<Vec<Prediction>, ClassifierError> {
        let output = self.run_inference(batch.tensor())?;
        let scores = output.into_dimensionality::<Ix2>().map_err(inference_error)?;

        let predictions = scores
            .axis_iter(Axis(0))
            .map(|row| {
                let mut probabilities: Vec<f32> = row.iter().copied().collect();
                if self.apply_softmax {
                    softmax(&mut probabilities);
                }
                Prediction::new(probabilities)
            })
            .collect();

        Ok(predictions)
    }
}
