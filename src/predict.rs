//! Classification with confidence diagnostics.

use image::RgbImage;
use log::{debug, info};
use ndarray::Array1;
use ndarray_stats::QuantileExt;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::path::Path;
use std::time::Instant;

use crate::checkpoint::load_state_dict;
use crate::config::ResNetConfig;
use crate::error::{ClassifierError, Result};
use crate::gradcam;
use crate::labels::load_labels;
use crate::preprocess::{load_rgb, to_input_tensor};
use crate::resnet::ResNet;

pub const DEFAULT_LOW_CONFIDENCE_THRESHOLD: f64 = 0.6;
pub const LOW_CONFIDENCE_NOTE: &str = "Low confidence — image may be ambiguous or unclear.";

/// Added inside the logarithm so zero probabilities contribute nothing.
const ENTROPY_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    #[serde(rename = "class")]
    pub class_name: String,
    pub confidence: f64,
    /// Class name to probability, in class-index order.
    #[serde(serialize_with = "serialize_in_order")]
    pub probabilities: Vec<(String, f64)>,
    pub entropy: f64,
    pub margin: f64,
    pub inference_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

fn serialize_in_order<S: Serializer>(
    pairs: &[(String, f64)],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(pairs.len()))?;
    for (name, probability) in pairs {
        map.serialize_entry(name, probability)?;
    }
    map.end()
}

pub fn softmax(logits: &Array1<f32>) -> Array1<f32> {
    let max = logits.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    let exps = logits.mapv(|v| (v - max).exp());
    let total = exps.sum();
    exps / total
}

/// Shannon entropy in nats.
pub fn entropy(probabilities: &[f64]) -> f64 {
    -probabilities
        .iter()
        .map(|p| p * (p + ENTROPY_EPSILON).ln())
        .sum::<f64>()
}

/// Gap between the two largest probabilities. With a single class the
/// runner-up is taken as zero.
pub fn margin(probabilities: &[f64]) -> f64 {
    let mut sorted = probabilities.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    match sorted.as_slice() {
        [] => 0.0,
        [only] => *only,
        [first, second, ..] => first - second,
    }
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// A loaded network together with its class names.
#[derive(Debug)]
pub struct Classifier {
    model: ResNet,
    labels: Vec<String>,
    low_confidence_threshold: f64,
}

impl Classifier {
    pub fn new(model: ResNet, labels: Vec<String>) -> Result<Self> {
        if model.num_classes() != labels.len() {
            return Err(ClassifierError::ClassCountMismatch {
                labels: labels.len(),
                outputs: model.num_classes(),
            });
        }
        Ok(Self {
            model,
            labels,
            low_confidence_threshold: DEFAULT_LOW_CONFIDENCE_THRESHOLD,
        })
    }

    /// Reads the class mapping and the checkpoint and assembles the network.
    pub fn load(
        model_path: impl AsRef<Path>,
        classes_path: impl AsRef<Path>,
        config: &ResNetConfig,
    ) -> Result<Self> {
        let labels = load_labels(classes_path)?;
        let state = load_state_dict(model_path.as_ref())?;
        let model = ResNet::from_state_dict(config, state)?;
        let classifier = Self::new(model, labels)?;
        info!("Model loaded with classes: {:?}", classifier.labels);
        Ok(classifier)
    }

    pub fn with_low_confidence_threshold(mut self, threshold: f64) -> Self {
        self.low_confidence_threshold = threshold;
        self
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn model(&self) -> &ResNet {
        &self.model
    }

    pub fn predict(&self, image_path: impl AsRef<Path>) -> Result<Prediction> {
        let image = load_rgb(image_path)?;
        self.predict_image(&image)
    }

    pub fn predict_image(&self, image: &RgbImage) -> Result<Prediction> {
        let input = to_input_tensor(image, self.model.config().image_size);

        let start = Instant::now();
        let logits = self.model.forward(&input)?;
        let probs = softmax(&logits);
        let elapsed = start.elapsed();

        let index = probs.argmax()?;
        let probs: Vec<f64> = probs.iter().map(|&p| p as f64).collect();
        let confidence = round_to(probs[index], 4);

        let note = low_confidence_note(confidence, self.low_confidence_threshold);
        let prediction = Prediction {
            class_name: self.labels[index].clone(),
            confidence,
            probabilities: self
                .labels
                .iter()
                .zip(&probs)
                .map(|(name, &p)| (name.clone(), round_to(p, 4)))
                .collect(),
            entropy: round_to(entropy(&probs), 6),
            margin: round_to(margin(&probs), 6),
            inference_time_ms: round_to(elapsed.as_secs_f64() * 1000.0, 2),
            note,
        };
        debug!(
            "Predicted '{}' ({:.4}) in {} ms",
            prediction.class_name, prediction.confidence, prediction.inference_time_ms
        );
        Ok(prediction)
    }

    /// Grad-CAM overlay for the predicted class, as a base64 PNG.
    pub fn visualize(&self, image_path: impl AsRef<Path>) -> Result<String> {
        let image = load_rgb(image_path)?;
        gradcam::generate_gradcam(&self.model, &image)
    }
}

/// The note attached to a prediction whose confidence, rounded to four
/// places, is below `threshold`.
pub fn low_confidence_note(confidence: f64, threshold: f64) -> Option<String> {
    (round_to(confidence, 4) < threshold).then(|| LOW_CONFIDENCE_NOTE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::StateDict;
    use crate::resnet::test_support::{synthetic_state_dict, tiny_config};
    use approx::assert_abs_diff_eq;
    use image::Rgb;
    use ndarray::arr1;
    use proptest::prelude::*;

    fn tiny_classifier(labels: &[&str]) -> Classifier {
        let config = tiny_config();
        let state = StateDict::from_tensors(synthetic_state_dict(&config, labels.len(), 11));
        let model = ResNet::from_state_dict(&config, state).unwrap();
        Classifier::new(model, labels.iter().map(|s| s.to_string()).collect()).unwrap()
    }

    #[test]
    fn test_softmax_known_values() {
        let probs = softmax(&arr1(&[0.0, 0.0]));
        assert_abs_diff_eq!(probs[0], 0.5);
        let probs = softmax(&arr1(&[1000.0, 0.0]));
        assert_abs_diff_eq!(probs[0], 1.0);
        assert!(probs.iter().all(|p| p.is_finite()));
    }

    #[test]
    fn test_entropy_and_margin() {
        assert_abs_diff_eq!(entropy(&[0.5, 0.5]), std::f64::consts::LN_2, epsilon = 1e-8);
        assert_abs_diff_eq!(entropy(&[1.0, 0.0]), 0.0, epsilon = 1e-8);
        assert_abs_diff_eq!(margin(&[0.2, 0.7, 0.1]), 0.5, epsilon = 1e-12);
        assert_eq!(margin(&[0.9]), 0.9);
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(0.123456, 4), 0.1235);
        assert_eq!(round_to(12.3456, 2), 12.35);
    }

    #[test]
    fn test_prediction_json_shape() {
        let prediction = Prediction {
            class_name: "edible".into(),
            confidence: 0.55,
            probabilities: vec![("edible".into(), 0.55), ("poisonous".into(), 0.45)],
            entropy: 0.688139,
            margin: 0.1,
            inference_time_ms: 3.5,
            note: Some(LOW_CONFIDENCE_NOTE.into()),
        };
        let json = serde_json::to_string(&prediction).unwrap();
        assert!(json.starts_with(r#"{"class":"edible","confidence":0.55,"probabilities":{"edible":0.55,"poisonous":0.45}"#));
        assert!(json.contains(r#""note":"Low confidence"#));

        let confident = Prediction { note: None, ..prediction };
        let value = serde_json::to_value(&confident).unwrap();
        assert!(value.get("note").is_none());
    }

    #[test]
    fn test_class_count_mismatch() {
        let config = tiny_config();
        let state = StateDict::from_tensors(synthetic_state_dict(&config, 3, 1));
        let model = ResNet::from_state_dict(&config, state).unwrap();
        let err = Classifier::new(model, vec!["edible".into(), "poisonous".into()]).unwrap_err();
        assert!(matches!(
            err,
            ClassifierError::ClassCountMismatch { labels: 2, outputs: 3 }
        ));
    }

    #[test]
    fn test_predict_image_diagnostics() {
        let classifier = tiny_classifier(&["edible", "poisonous"]);
        let image = RgbImage::from_fn(80, 60, |x, y| Rgb([(x * 3) as u8, (y * 4) as u8, 90]));
        let prediction = classifier.predict_image(&image).unwrap();

        assert!(classifier.labels().contains(&prediction.class_name));
        assert_eq!(prediction.probabilities.len(), 2);
        assert_eq!(prediction.probabilities[0].0, "edible");
        let total: f64 = prediction.probabilities.iter().map(|(_, p)| p).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-3);

        let best = prediction
            .probabilities
            .iter()
            .map(|(_, p)| *p)
            .fold(f64::MIN, f64::max);
        assert_abs_diff_eq!(prediction.confidence, best, epsilon = 1e-4);
        assert!(prediction.entropy >= 0.0 && prediction.entropy <= std::f64::consts::LN_2 + 1e-6);
        assert!(prediction.inference_time_ms >= 0.0);
        assert_eq!(prediction.note.is_some(), prediction.confidence < 0.6);
    }

    #[test]
    fn test_threshold_controls_note() {
        let image = RgbImage::from_pixel(64, 64, Rgb([120, 80, 40]));

        let always = tiny_classifier(&["a", "b"]).with_low_confidence_threshold(1.1);
        assert_eq!(
            always.predict_image(&image).unwrap().note.as_deref(),
            Some(LOW_CONFIDENCE_NOTE)
        );

        let never = tiny_classifier(&["a", "b"]).with_low_confidence_threshold(0.0);
        assert!(never.predict_image(&image).unwrap().note.is_none());
    }

    #[test]
    fn test_note_uses_rounded_confidence() {
        assert_eq!(round_to(0.59996, 4), 0.6);
        assert!(low_confidence_note(0.59996, 0.6).is_none());
        assert_eq!(
            low_confidence_note(0.59994, 0.6).as_deref(),
            Some(LOW_CONFIDENCE_NOTE)
        );
        assert!(low_confidence_note(0.6, 0.6).is_none());
    }

    proptest! {
        #[test]
        fn prop_softmax_is_distribution(logits in prop::collection::vec(-30.0f32..30.0, 1..12)) {
            let probs = softmax(&Array1::from(logits.clone()));
            let total: f32 = probs.sum();
            prop_assert!((total - 1.0).abs() < 1e-4);
            prop_assert!(probs.iter().all(|&p| (0.0..=1.0).contains(&p)));
        }

        #[test]
        fn prop_entropy_and_margin_bounds(logits in prop::collection::vec(-10.0f32..10.0, 2..12)) {
            let n = logits.len() as f64;
            let probs: Vec<f64> =
                softmax(&Array1::from(logits)).iter().map(|&p| p as f64).collect();
            let h = entropy(&probs);
            prop_assert!(h >= -1e-6);
            prop_assert!(h <= n.ln() + 1e-4);
            let m = margin(&probs);
            prop_assert!((0.0..=1.0 + 1e-6).contains(&m));
        }
    }
}
