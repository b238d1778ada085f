use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ClassifierError, Result};

/// Runtime settings for the HTTP service.
///
/// Every field has a default, so a config file only needs the keys it
/// wants to change. Command-line flags are applied on top in `main`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub model_path: PathBuf,
    pub classes_path: PathBuf,
    /// Where uploads are spooled while they are classified. `None` uses the system temp dir.
    pub upload_dir: Option<PathBuf>,
    pub max_upload_bytes: usize,
    pub low_confidence_threshold: f64,
    pub cors_permissive: bool,
    pub workers: Option<usize>,
    pub model: ResNetConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            model_path: PathBuf::from("models/mushroom_resnet50_finetuned.safetensors"),
            classes_path: PathBuf::from("models/classes.json"),
            upload_dir: None,
            max_upload_bytes: 20 * 1024 * 1024,
            low_confidence_threshold: 0.6,
            cors_permissive: true,
            workers: None,
            model: ResNetConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: impl AsRef<Path>) -> Result<Self> {
        let config_path = config_path.as_ref();
        let contents =
            fs::read_to_string(config_path).map_err(|e| ClassifierError::io(config_path, e))?;

        serde_json::from_str(&contents).map_err(|e| ClassifierError::Json {
            path: config_path.to_path_buf(),
            source: e,
        })
    }
}

/// Shape of the bottleneck ResNet the checkpoint is loaded into.
///
/// The number of output classes is not part of the config; it is read from
/// the checkpoint's `fc.weight`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ResNetConfig {
    /// Bottleneck blocks in each of the four stages.
    pub layers: [usize; 4],
    /// Channels produced by the stem; stage `i` uses `width << i` inner channels.
    pub width: usize,
    pub expansion: usize,
    pub bn_eps: f32,
    pub image_size: u32,
}

impl ResNetConfig {
    pub fn resnet50() -> Self {
        Self {
            layers: [3, 4, 6, 3],
            width: 64,
            expansion: 4,
            bn_eps: 1e-5,
            image_size: 224,
        }
    }

    /// Channels leaving the last stage, i.e. the input width of `fc`.
    pub fn feature_channels(&self) -> usize {
        (self.width << 3) * self.expansion
    }
}

impl Default for ResNetConfig {
    fn default() -> Self {
        Self::resnet50()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": 9090, "model": {{"image_size": 128}}}}"#).unwrap();

        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.low_confidence_threshold, 0.6);
        assert_eq!(config.model.image_size, 128);
        assert_eq!(config.model.layers, [3, 4, 6, 3]);
    }

    #[test]
    fn test_missing_config_file() {
        let err = ServerConfig::load("does/not/exist.json").unwrap_err();
        assert!(matches!(err, ClassifierError::Io { .. }));
    }

    #[test]
    fn test_invalid_config_json() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": "eighty"}}"#).unwrap();
        let err = ServerConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ClassifierError::Json { .. }));
    }

    #[test]
    fn test_resnet50_feature_channels() {
        assert_eq!(ResNetConfig::resnet50().feature_channels(), 2048);
    }
}
