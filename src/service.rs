use crate::error::ModelError;
use crate::label::ClassLabel;
use crate::pneumonia_model::{ClassifierRunner, Forward, OnnxBackend, Prediction};
use std::sync::Arc;
use std::time::Duration;
use tonic::{Request, Response, Status};

// Generated from proto/pneumonia_detector.proto by build.rs.
pub mod pneumonia_detector_service {
    tonic::include_proto!("pneumonia_detector_service");

    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("pneumonia_detector_descriptor");
}

use pneumonia_detector_service::{
    ClassificationLabel, DetectionScore, ModelInfoRequest, ModelInfoResponse,
    PneumoniaDetectionRequest, PneumoniaDetectionResponse,
    pneumonia_detection_request::ImageSource, pneumonia_detector_server::PneumoniaDetector,
};

impl From<ClassLabel> for ClassificationLabel {
    fn from(label: ClassLabel) -> Self {
        match label {
            ClassLabel::Normal => ClassificationLabel::Normal,
            ClassLabel::Pneumonia => ClassificationLabel::Pneumonia,
        }
    }
}

impl From<ModelError> for Status {
    fn from(err: ModelError) -> Self {
        if err.is_caller_error() {
            Status::invalid_argument(err.to_string())
        } else {
            tracing::error!("Classifier failure: {}", err);
            Status::failed_precondition(err.to_string())
        }
    }
}

pub struct PneumoniaDetectorService<B: Forward + 'static = OnnxBackend> {
    runner: Arc<ClassifierRunner<B>>,
    http: reqwest::Client,
    max_image_bytes: usize,
}

impl<B: Forward + 'static> PneumoniaDetectorService<B> {
    /// `fetch_timeout` bounds the whole `image_url` download, connect to
    /// last byte.
    pub fn new(
        runner: Arc<ClassifierRunner<B>>,
        max_image_bytes: usize,
        fetch_timeout: Duration,
    ) -> Result<Self, ModelError> {
        let http = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(|e| ModelError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            runner,
            http,
            max_image_bytes,
        })
    }

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, ModelError> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| ModelError::Fetch(format!("invalid image URL '{}': {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ModelError::Fetch(format!(
                "unsupported URL scheme '{}'",
                parsed.scheme()
            )));
        }

        tracing::debug!("Fetching image from {}", parsed);
        let mut response = self
            .http
            .get(parsed)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ModelError::Fetch(e.to_string()))?;

        if let Some(length) = response.content_length() {
            self.check_size(usize::try_from(length).unwrap_or(usize::MAX))?;
        }

        // Content-Length is optional, so the limit is enforced while reading.
        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ModelError::Fetch(e.to_string()))?
        {
            self.check_size(bytes.len() + chunk.len())?;
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }

    fn check_size(&self, len: usize) -> Result<(), ModelError> {
        if len > self.max_image_bytes {
            return Err(ModelError::InvalidImage(format!(
                "image is {} bytes, limit is {}",
                len, self.max_image_bytes
            )));
        }
        Ok(())
    }

    async fn classify(&self, bytes: Vec<u8>) -> Result<Prediction, Status> {
        let runner = Arc::clone(&self.runner);
        tokio::task::spawn_blocking(move || runner.predict_bytes(&bytes))
            .await
            .map_err(|e| Status::internal(format!("inference task failed: {}", e)))?
            .map_err(Status::from)
    }
}

fn detection_scores(prediction: &Prediction) -> Vec<DetectionScore> {
    ClassLabel::ALL
        .iter()
        .map(|&label| DetectionScore {
            label: ClassificationLabel::from(label) as i32,
            score: prediction.probabilities[label.index()],
            logit: prediction.scores[label.index()],
        })
        .collect()
}

#[tonic::async_trait]
impl<B: Forward + 'static> PneumoniaDetector for PneumoniaDetectorService<B> {
    async fn detect_pneumonia(
        &self,
        request: Request<PneumoniaDetectionRequest>,
    ) -> Result<Response<PneumoniaDetectionResponse>, Status> {
        let request_inner = request.into_inner();
        let request_id = request_inner.request_id;

        let bytes = match request_inner.image_source {
            Some(ImageSource::ImageData(data)) => {
                self.check_size(data.len())?;
                data
            }
            Some(ImageSource::ImageUrl(url)) => self.fetch_image(&url).await?,
            None => return Err(Status::invalid_argument("no image_data or image_url provided")),
        };
        tracing::info!(request_id = %request_id, bytes = bytes.len(), "Detection request");

        let prediction = self.classify(bytes).await?;
        tracing::info!(
            request_id = %request_id,
            label = %prediction.label,
            confidence = prediction.confidence(),
            "Detection finished"
        );

        Ok(Response::new(PneumoniaDetectionResponse {
            request_id,
            overall_classification: ClassificationLabel::from(prediction.label) as i32,
            scores: detection_scores(&prediction),
            model_version: prediction.model_version,
        }))
    }

    async fn get_model_info(
        &self,
        _request: Request<ModelInfoRequest>,
    ) -> Result<Response<ModelInfoResponse>, Status> {
        let crop = self.runner.preprocessor().crop_size;
        Ok(Response::new(ModelInfoResponse {
            model_version: self.runner.model_version().to_string(),
            execution_provider: self.runner.execution_context().to_string(),
            input_width: crop.width,
            input_height: crop.height,
            class_names: ClassLabel::ALL.iter().map(|l| l.to_string()).collect(),
        }))
    }
}
