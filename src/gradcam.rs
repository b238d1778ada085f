//! Grad-CAM saliency for the predicted class, rendered as a jet heatmap
//! blended over the resized input.
//!
//! The explained layer is the last bottleneck block. The network head is a
//! global average pool followed by a linear layer, so the gradient of logit
//! `c` with respect to activation `A[k, i, j]` is `fc.weight[c, k] / (H * W)`
//! at every position. Grad-CAM's channel weights (the spatial mean of that
//! gradient) therefore come straight from the classifier matrix.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{ImageFormat, Rgb, RgbImage};
use ndarray::{Array1, Array2, Array3};
use ndarray_stats::QuantileExt;
use std::io::Cursor;

use crate::error::{ClassifierError, Result};
use crate::preprocess::{to_input_tensor, to_unit_rgb};
use crate::resnet::ResNet;

const CAM_EPSILON: f32 = 1e-7;
/// Share of the original image in the blended overlay.
pub const IMAGE_WEIGHT: f32 = 0.5;

/// Spatial mean of d(logit[class]) / d(features) for every channel.
pub fn channel_weights(
    fc_weight: &Array2<f32>,
    class: usize,
    spatial: usize,
) -> Result<Array1<f32>> {
    if class >= fc_weight.nrows() {
        return Err(ClassifierError::Shape(format!(
            "class {class} out of range for {} outputs",
            fc_weight.nrows()
        )));
    }
    if spatial == 0 {
        return Err(ClassifierError::Shape("empty activation map".to_string()));
    }
    Ok(fc_weight.row(class).mapv(|w| w / spatial as f32))
}

/// `relu(sum_k weights[k] * features[k])`
pub fn class_activation_map(features: &Array3<f32>, weights: &Array1<f32>) -> Result<Array2<f32>> {
    let (channels, height, width) = features.dim();
    if channels != weights.len() {
        return Err(ClassifierError::Shape(format!(
            "{} channel weights for {channels} activation channels",
            weights.len()
        )));
    }
    let mut cam = Array2::<f32>::zeros((height, width));
    for (plane, &weight) in features.outer_iter().zip(weights.iter()) {
        cam.scaled_add(weight, &plane);
    }
    cam.mapv_inplace(|v| v.max(0.0));
    Ok(cam)
}

/// Shifts the minimum to zero and divides by the (epsilon-guarded) maximum.
pub fn min_max_scale(map: &Array2<f32>) -> Array2<f32> {
    let min = map.fold(f32::INFINITY, |acc, &v| acc.min(v));
    let shifted = map.mapv(|v| v - min);
    let max = shifted.fold(0.0f32, |acc, &v| acc.max(v));
    shifted / (CAM_EPSILON + max)
}

// Source index pair and blend factor for one output coordinate, using
// half-pixel centres with edge clamping.
fn sample_coords(dst: usize, dst_len: usize, src_len: usize) -> (usize, usize, f32) {
    let scale = src_len as f32 / dst_len as f32;
    let pos = ((dst as f32 + 0.5) * scale - 0.5).max(0.0);
    let lo = (pos.floor() as usize).min(src_len - 1);
    let hi = (lo + 1).min(src_len - 1);
    let frac = if lo == hi { 0.0 } else { pos - lo as f32 };
    (lo, hi, frac)
}

pub fn resize_bilinear(map: &Array2<f32>, out_h: usize, out_w: usize) -> Result<Array2<f32>> {
    let (src_h, src_w) = map.dim();
    if src_h == 0 || src_w == 0 {
        return Err(ClassifierError::Shape("cannot resize an empty map".to_string()));
    }
    let columns: Vec<_> = (0..out_w).map(|x| sample_coords(x, out_w, src_w)).collect();
    let mut out = Array2::<f32>::zeros((out_h, out_w));
    for y in 0..out_h {
        let (y0, y1, fy) = sample_coords(y, out_h, src_h);
        for (x, &(x0, x1, fx)) in columns.iter().enumerate() {
            let top = map[[y0, x0]] * (1.0 - fx) + map[[y0, x1]] * fx;
            let bottom = map[[y1, x0]] * (1.0 - fx) + map[[y1, x1]] * fx;
            out[[y, x]] = top * (1.0 - fy) + bottom * fy;
        }
    }
    Ok(out)
}

/// Jet colormap entry for an 8-bit level, as RGB.
pub fn jet(level: u8) -> [u8; 3] {
    let t = level as f32 / 255.0;
    let channel = |center: f32| {
        let v = (1.5 - (4.0 * t - center).abs()).clamp(0.0, 1.0);
        (v * 255.0).round() as u8
    };
    [channel(3.0), channel(2.0), channel(1.0)]
}

/// Heatmap for `class` at `size x size`, values in `[0, 1]`.
pub fn gradcam_heatmap(
    model: &ResNet,
    features: &Array3<f32>,
    class: usize,
    size: usize,
) -> Result<Array2<f32>> {
    let (_, height, width) = features.dim();
    let weights = channel_weights(model.fc_weight(), class, height * width)?;
    let cam = class_activation_map(features, &weights)?;
    let cam = resize_bilinear(&min_max_scale(&cam), size, size)?;
    Ok(min_max_scale(&cam.mapv(|v| v.max(0.0))))
}

/// Blends the jet-coloured `cam` over `rgb` (`[H, W, 3]`, values in
/// `[0, 1]`) and stretches the result so its brightest channel is 255.
pub fn overlay(rgb: &Array3<f32>, cam: &Array2<f32>) -> Result<RgbImage> {
    let (height, width, channels) = rgb.dim();
    if channels != 3 || cam.dim() != (height, width) {
        return Err(ClassifierError::Shape(format!(
            "overlay of {:?} heatmap on {:?} image",
            cam.dim(),
            rgb.dim()
        )));
    }

    let blended = Array3::from_shape_fn((height, width, 3), |(y, x, c)| {
        let level = (255.0 * cam[[y, x]]) as u8;
        let heat = jet(level)[c] as f32 / 255.0;
        (1.0 - IMAGE_WEIGHT) * heat + IMAGE_WEIGHT * rgb[[y, x, c]]
    });
    let peak = *blended.max()?;
    let scale = if peak > 0.0 { 1.0 / peak } else { 0.0 };

    Ok(RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb(std::array::from_fn(|c| {
            (255.0 * blended[[y, x, c]] * scale) as u8
        }))
    }))
}

pub fn encode_png_base64(image: &RgbImage) -> Result<String> {
    let mut png = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(ClassifierError::ImageEncode)?;
    Ok(STANDARD.encode(png))
}

/// Explains the model's top prediction for `image`; returns a base64 PNG
/// of the overlay at the model's input resolution.
pub fn generate_gradcam(model: &ResNet, image: &RgbImage) -> Result<String> {
    let size = model.config().image_size;
    let rgb = to_unit_rgb(image, size);
    let input = to_input_tensor(image, size);

    let features = model.features(&input)?;
    let logits = model.head(&features)?;
    let class = logits.argmax()?;

    let cam = gradcam_heatmap(model, &features, class, size as usize)?;
    encode_png_base64(&overlay(&rgb, &cam)?)
}
