// Mushroom image classification: a ResNet evaluated on ndarray, Grad-CAM
// explanations, and the actix-web API serving both.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod gradcam;
pub mod labels;
pub mod layers;
pub mod logging;
pub mod predict;
pub mod preprocess;
pub mod resnet;
pub mod web;

pub use config::{ResNetConfig, ServerConfig};
pub use error::{ClassifierError, Result};
pub use predict::{Classifier, Prediction};
