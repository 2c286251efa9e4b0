//! Chest X-ray pneumonia classifier: the evaluation-time image transform, a
//! load-once ONNX runner for the fine-tuned two-class network, and a gRPC
//! service wrapping both.

pub mod error;
pub mod label;
pub mod model_config;
pub mod pneumonia_model;
pub mod preprocess;
pub mod service;

pub use error::ModelError;
pub use label::ClassLabel;
pub use model_config::{ExecutionPreference, PreprocessorConfig, RunnerConfig, ServiceConfig};
pub use pneumonia_model::{
    ClassifierRunner, ExecutionContext, Forward, OnnxBackend, Prediction, shared_runner,
};
pub use preprocess::{PreprocessedTensor, decode_image, preprocess, preprocess_bytes};
