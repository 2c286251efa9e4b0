// src/model_config.rs
use crate::error::ModelError;
use crate::label::ClassLabel;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const MODEL_FILE: &str = "model.onnx";
pub const PREPROCESSOR_CONFIG_FILE: &str = "preprocessor_config.json";
pub const MODEL_CONFIG_FILE: &str = "config.json";

const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

/// Image transform applied before the forward pass. The defaults are the
/// evaluation transform the network was fine-tuned with: resize the shorter
/// edge to 256, center-crop 224, rescale to [0,1], ImageNet mean/std.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PreprocessorConfig {
    pub do_resize: bool,
    pub do_rescale: bool,
    pub do_normalize: bool,
    pub shortest_edge: u32,
    pub crop_size: ImageSize,
    pub rescale_factor: f32,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub height: u32,
    pub width: u32,
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            do_resize: true,
            do_rescale: true,
            do_normalize: true,
            shortest_edge: 256,
            crop_size: ImageSize {
                height: 224,
                width: 224,
            },
            rescale_factor: 1.0 / 255.0,
            image_mean: [0.485, 0.456, 0.406],
            image_std: [0.229, 0.224, 0.225],
        }
    }
}

impl PreprocessorConfig {
    pub fn from_file(path: &Path) -> Result<Self, ModelError> {
        let file = std::fs::File::open(path)
            .map_err(|e| ModelError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_reader(file)
            .map_err(|e| ModelError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `preprocessor_config.json` from the model directory, falling back
    /// to the training defaults when the file is absent.
    pub fn load_or_default(model_dir: &Path) -> Result<Self, ModelError> {
        let path = model_dir.join(PREPROCESSOR_CONFIG_FILE);
        if path.exists() {
            tracing::info!("Loading preprocessor config from {}", path.display());
            Self::from_file(&path)
        } else {
            tracing::debug!(
                "No {} in {}, using training defaults",
                PREPROCESSOR_CONFIG_FILE,
                model_dir.display()
            );
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.crop_size.width == 0 || self.crop_size.height == 0 {
            return Err(ModelError::Config("crop_size must be non-zero".into()));
        }
        if self.do_resize && self.shortest_edge == 0 {
            return Err(ModelError::Config("shortest_edge must be non-zero".into()));
        }
        if self.image_std.iter().any(|s| *s == 0.0 || !s.is_finite()) {
            return Err(ModelError::Config(format!(
                "image_std must be finite and non-zero, got {:?}",
                self.image_std
            )));
        }
        Ok(())
    }
}

/// Optional `config.json` shipped next to the model. Only `id2label` is read.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ModelConfig {
    #[serde(default)]
    pub id2label: HashMap<String, String>,
}

impl ModelConfig {
    pub fn load(model_dir: &Path) -> Result<Option<Self>, ModelError> {
        let path = model_dir.join(MODEL_CONFIG_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let file = std::fs::File::open(&path)
            .map_err(|e| ModelError::Config(format!("{}: {}", path.display(), e)))?;
        let config = serde_json::from_reader(file)
            .map_err(|e| ModelError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(Some(config))
    }

    /// The artifact must have been trained on the same class order this crate
    /// decodes with. An empty table is accepted.
    pub fn check_labels(&self) -> Result<(), ModelError> {
        if self.id2label.is_empty() {
            return Ok(());
        }
        if self.id2label.len() != ClassLabel::ALL.len() {
            return Err(ModelError::ModelShape(format!(
                "model declares {} classes, expected {}",
                self.id2label.len(),
                ClassLabel::ALL.len()
            )));
        }
        for label in ClassLabel::ALL {
            let key = label.index().to_string();
            match self.id2label.get(&key) {
                Some(name) if name.eq_ignore_ascii_case(label.as_str()) => {}
                other => {
                    return Err(ModelError::ModelShape(format!(
                        "class {} is {:?}, expected {}",
                        key,
                        other,
                        label.as_str()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Requested execution provider. Resolved into an
/// [`ExecutionContext`](crate::pneumonia_model::ExecutionContext) once, when
/// the runner is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionPreference {
    #[default]
    Auto,
    Cpu,
    Cuda,
}

impl FromStr for ExecutionPreference {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            other => Err(ModelError::Config(format!(
                "unknown execution provider '{}', expected auto, cpu or cuda",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub model_dir: PathBuf,
    pub execution: ExecutionPreference,
    pub intra_threads: usize,
}

impl RunnerConfig {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            execution: ExecutionPreference::default(),
            intra_threads: num_cpus::get(),
        }
    }

    pub fn model_path(&self) -> PathBuf {
        self.model_dir.join(MODEL_FILE)
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub max_image_bytes: usize,
    /// Total time allowed for downloading an `image_url`.
    pub fetch_timeout: Duration,
    pub runner: RunnerConfig,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ModelError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup so tests don't have to
    /// touch the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ModelError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let model_dir = lookup("MODEL_DIR").unwrap_or_else(|| "model".to_string());
        let mut runner = RunnerConfig::new(model_dir);

        if let Some(value) = lookup("EXECUTION_PROVIDER") {
            runner.execution = value.parse()?;
        }
        if let Some(value) = lookup("INTRA_THREADS") {
            runner.intra_threads = parse_var("INTRA_THREADS", &value)?;
            if runner.intra_threads == 0 {
                return Err(ModelError::Config("INTRA_THREADS must be at least 1".into()));
            }
        }

        let bind_addr = match lookup("BIND_ADDR") {
            Some(value) => parse_var("BIND_ADDR", &value)?,
            None => SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 1], 50051)),
        };
        let max_image_bytes = match lookup("MAX_IMAGE_BYTES") {
            Some(value) => parse_var("MAX_IMAGE_BYTES", &value)?,
            None => DEFAULT_MAX_IMAGE_BYTES,
        };
        let fetch_timeout_secs = match lookup("FETCH_TIMEOUT_SECS") {
            Some(value) => parse_var("FETCH_TIMEOUT_SECS", &value)?,
            None => DEFAULT_FETCH_TIMEOUT_SECS,
        };
        if fetch_timeout_secs == 0 {
            return Err(ModelError::Config("FETCH_TIMEOUT_SECS must be at least 1".into()));
        }

        Ok(Self {
            bind_addr,
            max_image_bytes,
            fetch_timeout: Duration::from_secs(fetch_timeout_secs),
            runner,
        })
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T, ModelError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ModelError::Config(format!("{}={:?}: {}", key, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_training_transform() {
        let config = PreprocessorConfig::default();
        assert_eq!(config.shortest_edge, 256);
        assert_eq!(config.crop_size, ImageSize { height: 224, width: 224 });
        assert_eq!(config.image_mean, [0.485, 0.456, 0.406]);
        assert_eq!(config.image_std, [0.229, 0.224, 0.225]);
        assert!(config.do_resize && config.do_rescale && config.do_normalize);
    }

    #[test]
    fn partial_preprocessor_json_keeps_defaults() {
        let config: PreprocessorConfig = serde_json::from_str(r#"{"do_resize": false}"#).unwrap();
        assert!(!config.do_resize);
        assert_eq!(config.shortest_edge, 256);
        assert_eq!(config.image_std, [0.229, 0.224, 0.225]);
    }

    #[test]
    fn zero_std_is_rejected() {
        let config = PreprocessorConfig {
            image_std: [0.229, 0.0, 0.225],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ModelError::Config(_))));
    }

    #[test]
    fn missing_preprocessor_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PreprocessorConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config, PreprocessorConfig::default());
    }

    #[test]
    fn malformed_preprocessor_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PREPROCESSOR_CONFIG_FILE), "{ nope").unwrap();
        let err = PreprocessorConfig::load_or_default(dir.path()).unwrap_err();
        assert!(matches!(err, ModelError::Config(_)));
    }

    #[test]
    fn id2label_must_match_class_order() {
        let ok: ModelConfig =
            serde_json::from_str(r#"{"id2label": {"0": "normal", "1": "PNEUMONIA"}}"#).unwrap();
        ok.check_labels().unwrap();

        let swapped: ModelConfig =
            serde_json::from_str(r#"{"id2label": {"0": "PNEUMONIA", "1": "NORMAL"}}"#).unwrap();
        assert!(matches!(swapped.check_labels(), Err(ModelError::ModelShape(_))));

        let three: ModelConfig = serde_json::from_str(
            r#"{"id2label": {"0": "NORMAL", "1": "PNEUMONIA", "2": "COVID"}}"#,
        )
        .unwrap();
        assert!(matches!(three.check_labels(), Err(ModelError::ModelShape(_))));

        ModelConfig::default().check_labels().unwrap();
    }

    #[test]
    fn service_config_defaults() {
        let config = ServiceConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.bind_addr, "[::1]:50051".parse::<SocketAddr>().unwrap());
        assert_eq!(config.max_image_bytes, DEFAULT_MAX_IMAGE_BYTES);
        assert_eq!(config.fetch_timeout, Duration::from_secs(10));
        assert_eq!(config.runner.model_dir, PathBuf::from("model"));
        assert_eq!(config.runner.execution, ExecutionPreference::Auto);
        assert!(config.runner.intra_threads >= 1);
    }

    #[test]
    fn service_config_reads_overrides() {
        let config = ServiceConfig::from_lookup(lookup_from(&[
            ("MODEL_DIR", "/srv/xray"),
            ("EXECUTION_PROVIDER", "CPU"),
            ("INTRA_THREADS", "2"),
            ("BIND_ADDR", "0.0.0.0:6000"),
            ("MAX_IMAGE_BYTES", "1024"),
            ("FETCH_TIMEOUT_SECS", "3"),
        ]))
        .unwrap();
        assert_eq!(config.runner.model_path(), PathBuf::from("/srv/xray/model.onnx"));
        assert_eq!(config.runner.execution, ExecutionPreference::Cpu);
        assert_eq!(config.runner.intra_threads, 2);
        assert_eq!(config.bind_addr.port(), 6000);
        assert_eq!(config.max_image_bytes, 1024);
        assert_eq!(config.fetch_timeout, Duration::from_secs(3));
    }

    #[test]
    fn bad_env_values_are_config_errors() {
        for pairs in [
            [("EXECUTION_PROVIDER", "tpu")],
            [("INTRA_THREADS", "many")],
            [("INTRA_THREADS", "0")],
            [("BIND_ADDR", "localhost")],
            [("FETCH_TIMEOUT_SECS", "0")],
        ] {
            let err = ServiceConfig::from_lookup(lookup_from(&pairs)).unwrap_err();
            assert!(matches!(err, ModelError::Config(_)), "{:?}", pairs);
        }
    }
}
