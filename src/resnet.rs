//! Bottleneck ResNet (torchvision layout, stride on the 3x3 conv) evaluated
//! in inference mode.

use log::{debug, warn};
use ndarray::{Array1, Array2, Array3};

use crate::checkpoint::StateDict;
use crate::config::ResNetConfig;
use crate::error::{ClassifierError, Result};
use crate::layers::{global_avg_pool, max_pool2d, relu_inplace, BatchNorm2d, Conv2d, Linear};

const INPUT_CHANNELS: usize = 3;

#[derive(Debug)]
struct Bottleneck {
    conv1: Conv2d,
    bn1: BatchNorm2d,
    conv2: Conv2d,
    bn2: BatchNorm2d,
    conv3: Conv2d,
    bn3: BatchNorm2d,
    downsample: Option<(Conv2d, BatchNorm2d)>,
}

impl Bottleneck {
    fn from_state_dict(
        state: &mut StateDict,
        prefix: &str,
        in_channels: usize,
        planes: usize,
        stride: usize,
        config: &ResNetConfig,
    ) -> Result<Self> {
        let out_channels = planes * config.expansion;
        let eps = config.bn_eps;
        let conv = |state: &mut StateDict,
                    name: &str,
                    cin: usize,
                    cout: usize,
                    k: usize,
                    s: usize,
                    p: usize| {
            Conv2d::from_state_dict(state, &format!("{prefix}.{name}"), cin, cout, k, s, p)
        };
        let bn = |state: &mut StateDict, name: &str, channels: usize| {
            BatchNorm2d::from_state_dict(state, &format!("{prefix}.{name}"), channels, eps)
        };

        let downsample = if stride != 1 || in_channels != out_channels {
            Some((
                conv(state, "downsample.0", in_channels, out_channels, 1, stride, 0)?,
                bn(state, "downsample.1", out_channels)?,
            ))
        } else {
            None
        };

        Ok(Self {
            conv1: conv(state, "conv1", in_channels, planes, 1, 1, 0)?,
            bn1: bn(state, "bn1", planes)?,
            conv2: conv(state, "conv2", planes, planes, 3, stride, 1)?,
            bn2: bn(state, "bn2", planes)?,
            conv3: conv(state, "conv3", planes, out_channels, 1, 1, 0)?,
            bn3: bn(state, "bn3", out_channels)?,
            downsample,
        })
    }

    fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>> {
        let mut out = self.conv1.forward(x)?;
        self.bn1.forward_inplace(&mut out);
        relu_inplace(&mut out);

        let mut out = self.conv2.forward(&out)?;
        self.bn2.forward_inplace(&mut out);
        relu_inplace(&mut out);

        let mut out = self.conv3.forward(&out)?;
        self.bn3.forward_inplace(&mut out);

        match &self.downsample {
            Some((conv, bn)) => {
                let mut shortcut = conv.forward(x)?;
                bn.forward_inplace(&mut shortcut);
                out += &shortcut;
            }
            None => out += x,
        }
        relu_inplace(&mut out);
        Ok(out)
    }
}

#[derive(Debug)]
pub struct ResNet {
    config: ResNetConfig,
    conv1: Conv2d,
    bn1: BatchNorm2d,
    stages: Vec<Vec<Bottleneck>>,
    fc: Linear,
}

impl ResNet {
    /// Builds the network from a torchvision-style state dict. The number
    /// of classes is taken from `fc.weight`.
    pub fn from_state_dict(config: &ResNetConfig, mut state: StateDict) -> Result<Self> {
        if config.width == 0 || config.expansion == 0 {
            return Err(ClassifierError::Shape(
                "ResNet width and expansion must be positive".to_string(),
            ));
        }

        let conv1 =
            Conv2d::from_state_dict(&mut state, "conv1", INPUT_CHANNELS, config.width, 7, 2, 3)?;
        let bn1 = BatchNorm2d::from_state_dict(&mut state, "bn1", config.width, config.bn_eps)?;

        let mut in_channels = config.width;
        let mut stages = Vec::with_capacity(config.layers.len());
        for (stage, &blocks) in config.layers.iter().enumerate() {
            let planes = config.width << stage;
            let stage_stride = if stage == 0 { 1 } else { 2 };
            let mut stage_blocks = Vec::with_capacity(blocks);
            for block in 0..blocks {
                let stride = if block == 0 { stage_stride } else { 1 };
                let prefix = format!("layer{}.{}", stage + 1, block);
                stage_blocks.push(Bottleneck::from_state_dict(
                    &mut state,
                    &prefix,
                    in_channels,
                    planes,
                    stride,
                    config,
                )?);
                in_channels = planes * config.expansion;
            }
            stages.push(stage_blocks);
        }

        let fc = Linear::from_state_dict(&mut state, "fc", in_channels)?;

        if !state.is_empty() {
            warn!(
                "Ignoring {} checkpoint tensors not used by the model: {:?}",
                state.len(),
                state.remaining()
            );
        }
        debug!(
            "Built ResNet {:?} with {} output classes",
            config.layers,
            fc.out_features()
        );

        Ok(Self {
            config: config.clone(),
            conv1,
            bn1,
            stages,
            fc,
        })
    }

    pub fn config(&self) -> &ResNetConfig {
        &self.config
    }

    pub fn num_classes(&self) -> usize {
        self.fc.out_features()
    }

    /// `[num_classes, feature_channels]`
    pub fn fc_weight(&self) -> &Array2<f32> {
        self.fc.weight()
    }

    /// Stem and all four stages. The result is the activation of the last
    /// bottleneck block, the layer Grad-CAM explains.
    pub fn features(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        let mut x = self.conv1.forward(input)?;
        self.bn1.forward_inplace(&mut x);
        relu_inplace(&mut x);
        let mut x = max_pool2d(&x, 3, 2, 1)?;

        for block in self.stages.iter().flatten() {
            x = block.forward(&x)?;
        }
        Ok(x)
    }

    /// Global average pool followed by the linear classifier.
    pub fn head(&self, features: &Array3<f32>) -> Result<Array1<f32>> {
        self.fc.forward(&global_avg_pool(features))
    }

    pub fn forward(&self, input: &Array3<f32>) -> Result<Array1<f32>> {
        let features = self.features(input)?;
        self.head(&features)
    }
}
