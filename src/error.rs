//! Error type shared by model loading, inference and visualization.

use std::fmt;
use std::io;
use std::path::PathBuf;

use safetensors::SafeTensorError;

#[derive(Debug)]
pub enum ClassifierError {
    /// File could not be read or written.
    Io { path: PathBuf, source: io::Error },
    /// JSON file (config or class mapping) failed to parse.
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    /// The checkpoint is not a readable safetensors file.
    Checkpoint {
        path: PathBuf,
        source: SafeTensorError,
    },
    UnsupportedDtype { tensor: String, dtype: String },
    MissingTensor(String),
    ShapeMismatch {
        tensor: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    InvalidLabels { path: PathBuf, reason: String },
    ClassCountMismatch { labels: usize, outputs: usize },
    /// Uploaded bytes are not a decodable image.
    ImageDecode(image::ImageError),
    ImageEncode(image::ImageError),
    /// Tensor arithmetic received data of the wrong shape.
    Shape(String),
    /// Logits or activations that cannot be ranked (empty, NaN).
    Numeric(String),
}

impl fmt::Display for ClassifierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "I/O error on '{}': {source}", path.display()),
            Self::Json { path, source } => {
                write!(f, "Failed to parse JSON from '{}': {source}", path.display())
            }
            Self::Checkpoint { path, source } => {
                write!(f, "Invalid checkpoint '{}': {source}", path.display())
            }
            Self::UnsupportedDtype { tensor, dtype } => write!(
                f,
                "Unsupported dtype '{dtype}' for tensor '{tensor}'. Only F32 is supported."
            ),
            Self::MissingTensor(name) => write!(f, "Tensor '{name}' not found in checkpoint"),
            Self::ShapeMismatch {
                tensor,
                expected,
                found,
            } => write!(
                f,
                "Tensor '{tensor}': expected shape {expected:?}, found {found:?}"
            ),
            Self::InvalidLabels { path, reason } => {
                write!(f, "Invalid class mapping '{}': {reason}", path.display())
            }
            Self::ClassCountMismatch { labels, outputs } => write!(
                f,
                "Class mapping lists {labels} classes but the classifier head has {outputs} outputs"
            ),
            Self::ImageDecode(e) => write!(f, "Could not decode image: {e}"),
            Self::ImageEncode(e) => write!(f, "Could not encode image: {e}"),
            Self::Shape(msg) => write!(f, "Shape error: {msg}"),
            Self::Numeric(msg) => write!(f, "Numeric error: {msg}"),
        }
    }
}

impl std::error::Error for ClassifierError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Json { source, .. } => Some(source),
            Self::Checkpoint { source, .. } => Some(source),
            Self::ImageDecode(source) | Self::ImageEncode(source) => Some(source),
            _ => None,
        }
    }
}

impl From<ndarray::ShapeError> for ClassifierError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Shape(err.to_string())
    }
}

impl From<ndarray_stats::errors::MinMaxError> for ClassifierError {
    fn from(err: ndarray_stats::errors::MinMaxError) -> Self {
        Self::Numeric(err.to_string())
    }
}

impl ClassifierError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True when the failure is caused by the caller's input rather than
    /// the server's model files.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::ImageDecode(_))
    }
}

pub type Result<T> = std::result::Result<T, ClassifierError>;
