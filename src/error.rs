use ort::error::Error as OrtError;

#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    #[error("Invalid image: {0}")]
    InvalidImage(String),
    #[error("Failed to load model: {0}")]
    ModelLoad(String),
    #[error("Model shape mismatch: {0}")]
    ModelShape(String),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Failed to fetch image: {0}")]
    Fetch(String),
}

impl ModelError {
    /// True when resubmitting a different image can succeed. Everything else
    /// needs the deployment fixed.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, ModelError::InvalidImage(_) | ModelError::Fetch(_))
    }
}

impl From<image::ImageError> for ModelError {
    fn from(err: image::ImageError) -> Self {
        ModelError::InvalidImage(err.to_string())
    }
}

impl From<OrtError> for ModelError {
    fn from(err: OrtError) -> Self {
        ModelError::Inference(err.to_string())
    }
}
