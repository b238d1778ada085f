//! Fixtures shared by the integration test targets.
#![allow(dead_code)]

use image::{ImageFormat, Rgb, RgbImage};
use safetensors::tensor::TensorView;
use safetensors::{serialize, Dtype};
use std::collections::HashMap;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use mushroom_classifier::ResNetConfig;

type Tensors = Vec<(String, Vec<usize>, Vec<f32>)>;

pub fn tiny_config() -> ResNetConfig {
    ResNetConfig {
        layers: [1, 1, 1, 1],
        width: 4,
        expansion: 4,
        bn_eps: 1e-5,
        image_size: 64,
    }
}

// Deterministic pseudo-random weights in [-scale, scale).
fn weights(count: usize, scale: f32, seed: &mut u64) -> Vec<f32> {
    (0..count)
        .map(|_| {
            *seed = seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((*seed >> 40) as f32 / (1u64 << 24) as f32 * 2.0 - 1.0) * scale
        })
        .collect()
}

fn conv(tensors: &mut Tensors, seed: &mut u64, name: String, cin: usize, cout: usize, k: usize) {
    let scale = 1.0 / ((cin * k * k) as f32).sqrt();
    tensors.push((
        format!("{name}.weight"),
        vec![cout, cin, k, k],
        weights(cout * cin * k * k, scale, seed),
    ));
}

fn batch_norm(tensors: &mut Tensors, name: String, c: usize) {
    tensors.push((format!("{name}.weight"), vec![c], vec![1.0; c]));
    tensors.push((format!("{name}.bias"), vec![c], vec![0.0; c]));
    tensors.push((format!("{name}.running_mean"), vec![c], vec![0.0; c]));
    tensors.push((format!("{name}.running_var"), vec![c], vec![1.0; c]));
}

/// Writes a torchvision-named state dict for `config` as safetensors,
/// including the integer `num_batches_tracked` entries a real export has.
pub fn write_checkpoint(path: &Path, config: &ResNetConfig, classes: usize, key_prefix: &str) {
    let mut seed = 42u64;
    let mut tensors: Tensors = Vec::new();

    conv(&mut tensors, &mut seed, "conv1".into(), 3, config.width, 7);
    batch_norm(&mut tensors, "bn1".into(), config.width);
    let mut in_ch = config.width;
    for (stage, &blocks) in config.layers.iter().enumerate() {
        let planes = config.width << stage;
        let out_ch = planes * config.expansion;
        for block in 0..blocks {
            let p = format!("layer{}.{}", stage + 1, block);
            conv(&mut tensors, &mut seed, format!("{p}.conv1"), in_ch, planes, 1);
            batch_norm(&mut tensors, format!("{p}.bn1"), planes);
            conv(&mut tensors, &mut seed, format!("{p}.conv2"), planes, planes, 3);
            batch_norm(&mut tensors, format!("{p}.bn2"), planes);
            conv(&mut tensors, &mut seed, format!("{p}.conv3"), planes, out_ch, 1);
            batch_norm(&mut tensors, format!("{p}.bn3"), out_ch);
            if block == 0 {
                conv(&mut tensors, &mut seed, format!("{p}.downsample.0"), in_ch, out_ch, 1);
                batch_norm(&mut tensors, format!("{p}.downsample.1"), out_ch);
            }
            in_ch = out_ch;
        }
    }
    let fc = weights(classes * in_ch, 1.0 / (in_ch as f32).sqrt(), &mut seed);
    tensors.push(("fc.weight".into(), vec![classes, in_ch], fc));
    tensors.push(("fc.bias".into(), vec![classes], vec![0.0; classes]));

    let encoded: Vec<(String, Vec<usize>, Vec<u8>)> = tensors
        .into_iter()
        .map(|(name, shape, data)| {
            let bytes = data.iter().flat_map(|v| v.to_le_bytes()).collect();
            (format!("{key_prefix}{name}"), shape, bytes)
        })
        .collect();
    let counter = 100i64.to_le_bytes();

    let mut views = HashMap::new();
    for (name, shape, bytes) in &encoded {
        views.insert(
            name.clone(),
            TensorView::new(Dtype::F32, shape.clone(), bytes).unwrap(),
        );
    }
    views.insert(
        format!("{key_prefix}bn1.num_batches_tracked"),
        TensorView::new(Dtype::I64, vec![], &counter).unwrap(),
    );

    fs::write(path, serialize(&views, &None).unwrap()).unwrap();
}

/// A temp dir holding a checkpoint, its `classes.json` and an empty
/// `uploads/` directory.
pub struct Fixture {
    pub dir: TempDir,
    pub model_path: PathBuf,
    pub classes_path: PathBuf,
}

impl Fixture {
    pub fn new(classes_json: &str, classes: usize, key_prefix: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("mushroom_resnet.safetensors");
        let classes_path = dir.path().join("classes.json");
        write_checkpoint(&model_path, &tiny_config(), classes, key_prefix);
        fs::write(&classes_path, classes_json).unwrap();
        fs::create_dir(dir.path().join("uploads")).unwrap();
        Self {
            dir,
            model_path,
            classes_path,
        }
    }

    pub fn mushrooms() -> Self {
        Self::new(r#"{"0": "edible", "1": "poisonous"}"#, 2, "")
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.dir.path().join("uploads")
    }
}

pub fn jpeg_bytes() -> Vec<u8> {
    let image = RgbImage::from_fn(96, 72, |x, y| Rgb([(x * 2) as u8, (y * 3) as u8, 140]));
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
        .unwrap();
    bytes
}
