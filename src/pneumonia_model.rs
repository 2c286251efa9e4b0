use crate::error::ModelError;
use crate::label::{ClassLabel, argmax, softmax};
use crate::model_config::{ExecutionPreference, ModelConfig, PreprocessorConfig, RunnerConfig};
use crate::preprocess::{PreprocessedTensor, decode_image, preprocess};
use image::DynamicImage;
use once_cell::sync::OnceCell;
use ort::inputs;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::{Session, SessionOutputs};
use ort::value::ValueType;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Where the forward pass runs. Resolved once when the backend is built and
/// never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionContext {
    Cpu,
    Cuda,
}

impl ExecutionContext {
    /// Uses CUDA when the runtime reports it, otherwise the CPU.
    pub fn detect() -> Self {
        Self::resolve(ExecutionPreference::Auto)
    }

    pub fn resolve(preference: ExecutionPreference) -> Self {
        match preference {
            ExecutionPreference::Cpu => ExecutionContext::Cpu,
            ExecutionPreference::Auto => {
                if cuda_available() {
                    ExecutionContext::Cuda
                } else {
                    ExecutionContext::Cpu
                }
            }
            ExecutionPreference::Cuda => {
                if cuda_available() {
                    ExecutionContext::Cuda
                } else {
                    tracing::warn!("CUDA requested but not available, falling back to CPU");
                    ExecutionContext::Cpu
                }
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionContext::Cpu => "CPU",
            ExecutionContext::Cuda => "CUDA",
        }
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(feature = "cuda")]
fn cuda_available() -> bool {
    use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};
    CUDAExecutionProvider::default()
        .is_available()
        .unwrap_or(false)
}

#[cfg(not(feature = "cuda"))]
fn cuda_available() -> bool {
    false
}

/// One forward pass over a batch-of-one tensor, returning the raw class
/// scores. Implementations are shared read-only between request threads.
pub trait Forward: Send + Sync {
    fn forward(&self, input: &PreprocessedTensor) -> Result<Vec<f32>, ModelError>;

    fn version(&self) -> &str;

    fn execution_context(&self) -> ExecutionContext {
        ExecutionContext::Cpu
    }
}

/// ONNX export of the fine-tuned ResNet with a 2-way final layer.
pub struct OnnxBackend {
    session: Session,
    input_name: String,
    output_name: String,
    version: String,
    execution: ExecutionContext,
}

impl OnnxBackend {
    /// Loads `path` and checks the graph takes `[N, 3, height, width]` and
    /// produces `[N, 2]`. Dynamic dimensions are accepted here and checked
    /// again on every run.
    pub fn load(
        path: &Path,
        execution: ExecutionContext,
        intra_threads: usize,
        input_size: (usize, usize),
    ) -> Result<Self, ModelError> {
        if !path.is_file() {
            return Err(ModelError::ModelLoad(format!(
                "Model file not found: {}",
                path.display()
            )));
        }

        tracing::info!(
            "Loading ONNX model from {} on {} with {} intra-op threads",
            path.display(),
            execution,
            intra_threads
        );
        let load_err = |e: ort::Error| ModelError::ModelLoad(format!("{}: {}", path.display(), e));

        let builder = SessionBuilder::new()
            .map_err(load_err)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(load_err)?
            .with_intra_threads(intra_threads.max(1))
            .map_err(load_err)?;
        let builder = register_execution_provider(builder, execution).map_err(load_err)?;
        let session = builder.commit_from_file(path).map_err(load_err)?;

        let input = session
            .inputs
            .first()
            .ok_or_else(|| ModelError::ModelShape("model has no inputs".into()))?;
        check_input_shape(tensor_dimensions(&input.input_type, "model input")?, input_size)?;
        let output = session
            .outputs
            .first()
            .ok_or_else(|| ModelError::ModelShape("model has no outputs".into()))?;
        check_output_shape(tensor_dimensions(&output.output_type, "model output")?)?;

        let input_name = input.name.clone();
        let output_name = output.name.clone();
        tracing::debug!("Model input '{}', output '{}'", input_name, output_name);

        let version = model_version(&session, path);
        tracing::info!("ONNX Runtime session created for model {}", version);

        Ok(Self {
            session,
            input_name,
            output_name,
            version,
            execution,
        })
    }
}

impl Forward for OnnxBackend {
    fn forward(&self, input: &PreprocessedTensor) -> Result<Vec<f32>, ModelError> {
        let inputs = inputs![self.input_name.as_str() => input.view().into_dyn()]?;
        let outputs: SessionOutputs = self.session.run(inputs)?;

        let output_value = outputs.get(self.output_name.as_str()).ok_or_else(|| {
            ModelError::Inference(format!("output '{}' missing", self.output_name))
        })?;
        let logits = output_value.try_extract_tensor::<f32>()?;
        Ok(logits.iter().copied().collect())
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn execution_context(&self) -> ExecutionContext {
        self.execution
    }
}

#[cfg(feature = "cuda")]
fn register_execution_provider(
    builder: SessionBuilder,
    execution: ExecutionContext,
) -> ort::Result<SessionBuilder> {
    use ort::execution_providers::CUDAExecutionProvider;
    match execution {
        ExecutionContext::Cuda => {
            builder.with_execution_providers([CUDAExecutionProvider::default().build()])
        }
        ExecutionContext::Cpu => Ok(builder),
    }
}

#[cfg(not(feature = "cuda"))]
fn register_execution_provider(
    builder: SessionBuilder,
    _execution: ExecutionContext,
) -> ort::Result<SessionBuilder> {
    Ok(builder)
}

fn tensor_dimensions<'a>(
    value_type: &'a ValueType,
    what: &str,
) -> Result<&'a [i64], ModelError> {
    match value_type {
        ValueType::Tensor { dimensions, .. } => Ok(dimensions.as_slice()),
        other => Err(ModelError::ModelShape(format!(
            "{} is not a tensor: {:?}",
            what, other
        ))),
    }
}

/// Negative dimensions are symbolic (dynamic) in ONNX Runtime.
fn dim_matches(actual: i64, expected: usize) -> bool {
    actual < 0 || actual as usize == expected
}

fn check_input_shape(dims: &[i64], (height, width): (usize, usize)) -> Result<(), ModelError> {
    let ok = dims.len() == 4
        && dim_matches(dims[1], 3)
        && dim_matches(dims[2], height)
        && dim_matches(dims[3], width);
    if !ok {
        return Err(ModelError::ModelShape(format!(
            "model input is {:?}, expected [N, 3, {}, {}]",
            dims, height, width
        )));
    }
    Ok(())
}

fn check_output_shape(dims: &[i64]) -> Result<(), ModelError> {
    match dims.last() {
        Some(&classes) if dim_matches(classes, ClassLabel::ALL.len()) => Ok(()),
        _ => Err(ModelError::ModelShape(format!(
            "model output is {:?}, expected [N, {}]",
            dims,
            ClassLabel::ALL.len()
        ))),
    }
}

fn model_version(session: &Session, path: &Path) -> String {
    let file_name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_string());
    let Ok(metadata) = session.metadata() else {
        return file_name;
    };
    let name = metadata
        .name()
        .ok()
        .filter(|n| !n.is_empty())
        .unwrap_or(file_name);
    match metadata.version() {
        Ok(version) if version > 0 => format!("{}-v{}", name, version),
        _ => name,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub label: ClassLabel,
    /// Raw model outputs, indexed by class.
    pub scores: Vec<f32>,
    pub probabilities: Vec<f32>,
    pub model_version: String,
}

impl Prediction {
    pub fn confidence(&self) -> f32 {
        self.probabilities
            .get(self.label.index())
            .copied()
            .unwrap_or_default()
    }
}

/// Loaded model plus the preprocessing it was trained with. Never mutated
/// after construction, so one instance serves every request.
pub struct ClassifierRunner<B: Forward = OnnxBackend> {
    backend: B,
    preprocessor: PreprocessorConfig,
}

impl ClassifierRunner<OnnxBackend> {
    pub fn load(config: &RunnerConfig) -> Result<Self, ModelError> {
        let model_path = config.model_path();
        if !model_path.is_file() {
            return Err(ModelError::ModelLoad(format!(
                "Model file not found: {}",
                model_path.display()
            )));
        }

        if let Some(model_config) = ModelConfig::load(&config.model_dir)? {
            model_config.check_labels()?;
        }
        let preprocessor = PreprocessorConfig::load_or_default(&config.model_dir)?;
        tracing::debug!("Preprocessor config: {:?}", preprocessor);

        let execution = ExecutionContext::resolve(config.execution);
        let input_size = (
            preprocessor.crop_size.height as usize,
            preprocessor.crop_size.width as usize,
        );
        let backend = OnnxBackend::load(&model_path, execution, config.intra_threads, input_size)?;

        Ok(Self::with_backend(backend, preprocessor))
    }
}

impl<B: Forward> ClassifierRunner<B> {
    pub fn with_backend(backend: B, preprocessor: PreprocessorConfig) -> Self {
        Self {
            backend,
            preprocessor,
        }
    }

    pub fn preprocessor(&self) -> &PreprocessorConfig {
        &self.preprocessor
    }

    pub fn model_version(&self) -> &str {
        self.backend.version()
    }

    pub fn execution_context(&self) -> ExecutionContext {
        self.backend.execution_context()
    }

    pub fn classify(&self, input: &PreprocessedTensor) -> Result<Prediction, ModelError> {
        let crop = self.preprocessor.crop_size;
        let expected = (crop.height as usize, crop.width as usize);
        if input.spatial_size() != expected {
            return Err(ModelError::InvalidImage(format!(
                "tensor is {:?}, expected {:?}",
                input.shape(),
                [1, 3, expected.0, expected.1]
            )));
        }

        let started = Instant::now();
        let scores = self.backend.forward(input)?;
        if scores.len() != ClassLabel::ALL.len() {
            return Err(ModelError::ModelShape(format!(
                "model returned {} scores, expected {}",
                scores.len(),
                ClassLabel::ALL.len()
            )));
        }

        let label = ClassLabel::from_index(argmax(&scores)).unwrap_or(ClassLabel::Normal);
        let probabilities = softmax(&scores);
        tracing::debug!(
            "Classified as {} (scores {:?}) in {:?}",
            label,
            scores,
            started.elapsed()
        );

        Ok(Prediction {
            label,
            scores,
            probabilities,
            model_version: self.backend.version().to_string(),
        })
    }

    pub fn predict_image(&self, image: &DynamicImage) -> Result<Prediction, ModelError> {
        let tensor = preprocess(image, &self.preprocessor)?;
        self.classify(&tensor)
    }

    pub fn predict_bytes(&self, bytes: &[u8]) -> Result<Prediction, ModelError> {
        let image = decode_image(bytes)?;
        self.predict_image(&image)
    }
}

/// One-time initialisation barrier. Concurrent first callers wait on the
/// same load; a failed load is returned and the next call tries again.
pub struct LoadOnce<T> {
    cell: OnceCell<Arc<T>>,
}

impl<T> LoadOnce<T> {
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }

    pub fn get_or_load<F>(&self, load: F) -> Result<Arc<T>, ModelError>
    where
        F: FnOnce() -> Result<T, ModelError>,
    {
        self.cell.get_or_try_init(|| load().map(Arc::new)).cloned()
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl<T> Default for LoadOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}

static SHARED_RUNNER: LoadOnce<ClassifierRunner> = LoadOnce::new();

/// Process-wide runner, loaded on first call. `config` is ignored once a
/// runner exists.
pub fn shared_runner(config: &RunnerConfig) -> Result<Arc<ClassifierRunner>, ModelError> {
    SHARED_RUNNER.get_or_load(|| {
        tracing::info!(
            "Initializing shared classifier from {}",
            config.model_dir.display()
        );
        ClassifierRunner::load(config)
    })
}
