//! Eval-mode layers over single-image feature maps laid out `[C, H, W]`.

use ndarray::{Array1, Array2, Array3, ArrayD, Ix1};

use crate::checkpoint::StateDict;
use crate::error::{ClassifierError, Result};

fn into_vector(tensor: ArrayD<f32>, name: &str) -> Result<Array1<f32>> {
    tensor
        .into_dimensionality::<Ix1>()
        .map_err(|e| ClassifierError::Shape(format!("{name}: {e}")))
}

fn output_extent(input: usize, kernel: usize, stride: usize, padding: usize) -> Result<usize> {
    let padded = input + 2 * padding;
    if padded < kernel {
        return Err(ClassifierError::Shape(format!(
            "input extent {input} (padding {padding}) is smaller than kernel {kernel}"
        )));
    }
    Ok((padded - kernel) / stride + 1)
}

/// 2-D convolution without bias, evaluated as one matrix product over an
/// im2col buffer.
#[derive(Debug)]
pub struct Conv2d {
    /// `[out_channels, in_channels * kernel * kernel]`
    weight: Array2<f32>,
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
}

impl Conv2d {
    pub fn new(
        weight: Array2<f32>,
        in_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
    ) -> Result<Self> {
        if weight.ncols() != in_channels * kernel * kernel {
            return Err(ClassifierError::Shape(format!(
                "conv weight has {} columns, expected {}",
                weight.ncols(),
                in_channels * kernel * kernel
            )));
        }
        Ok(Self {
            out_channels: weight.nrows(),
            weight,
            in_channels,
            kernel,
            stride,
            padding,
        })
    }

    /// Takes `{prefix}.weight` with shape `[out, in, kernel, kernel]`.
    pub fn from_state_dict(
        state: &mut StateDict,
        prefix: &str,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
    ) -> Result<Self> {
        let weight = state.take(
            &format!("{prefix}.weight"),
            &[out_channels, in_channels, kernel, kernel],
        )?;
        let weight = weight.into_shape((out_channels, in_channels * kernel * kernel))?;
        Self::new(weight, in_channels, kernel, stride, padding)
    }

    pub fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>> {
        let (channels, height, width) = x.dim();
        if channels != self.in_channels {
            return Err(ClassifierError::Shape(format!(
                "conv expects {} input channels, got {channels}",
                self.in_channels
            )));
        }
        let out_h = output_extent(height, self.kernel, self.stride, self.padding)?;
        let out_w = output_extent(width, self.kernel, self.stride, self.padding)?;

        let cols = if self.kernel == 1 && self.stride == 1 && self.padding == 0 {
            x.as_standard_layout()
                .into_owned()
                .into_shape((channels, height * width))?
        } else {
            self.im2col(x, out_h, out_w)
        };

        let out = self.weight.dot(&cols);
        Ok(out.into_shape((self.out_channels, out_h, out_w))?)
    }

    fn im2col(&self, x: &Array3<f32>, out_h: usize, out_w: usize) -> Array2<f32> {
        let (channels, height, width) = x.dim();
        let k = self.kernel;
        let pad = self.padding as isize;
        let mut cols = Array2::<f32>::zeros((channels * k * k, out_h * out_w));

        for c in 0..channels {
            for ky in 0..k {
                for kx in 0..k {
                    let mut row = cols.row_mut((c * k + ky) * k + kx);
                    for oy in 0..out_h {
                        let iy = (oy * self.stride + ky) as isize - pad;
                        if iy < 0 || iy >= height as isize {
                            continue;
                        }
                        for ox in 0..out_w {
                            let ix = (ox * self.stride + kx) as isize - pad;
                            if ix < 0 || ix >= width as isize {
                                continue;
                            }
                            row[oy * out_w + ox] = x[[c, iy as usize, ix as usize]];
                        }
                    }
                }
            }
        }
        cols
    }
}

/// Batch normalization with running statistics folded into a per-channel
/// affine transform.
#[derive(Debug)]
pub struct BatchNorm2d {
    scale: Array1<f32>,
    shift: Array1<f32>,
}

impl BatchNorm2d {
    pub fn new(
        gamma: Array1<f32>,
        beta: Array1<f32>,
        running_mean: Array1<f32>,
        running_var: Array1<f32>,
        eps: f32,
    ) -> Self {
        let scale = &gamma / &running_var.mapv(|v| (v + eps).sqrt());
        let shift = &beta - &(&running_mean * &scale);
        Self { scale, shift }
    }

    pub fn from_state_dict(
        state: &mut StateDict,
        prefix: &str,
        channels: usize,
        eps: f32,
    ) -> Result<Self> {
        let mut param = |suffix: &str| -> Result<Array1<f32>> {
            let name = format!("{prefix}.{suffix}");
            let tensor = state.take(&name, &[channels])?;
            into_vector(tensor, &name)
        };
        let gamma = param("weight")?;
        let beta = param("bias")?;
        let mean = param("running_mean")?;
        let var = param("running_var")?;
        Ok(Self::new(gamma, beta, mean, var, eps))
    }

    pub fn forward_inplace(&self, x: &mut Array3<f32>) {
        for (c, mut plane) in x.outer_iter_mut().enumerate() {
            let (scale, shift) = (self.scale[c], self.shift[c]);
            plane.mapv_inplace(|v| v * scale + shift);
        }
    }
}

pub fn relu_inplace(x: &mut Array3<f32>) {
    x.mapv_inplace(|v| v.max(0.0));
}

/// Max pooling; padded positions never win.
pub fn max_pool2d(
    x: &Array3<f32>,
    kernel: usize,
    stride: usize,
    padding: usize,
) -> Result<Array3<f32>> {
    let (channels, height, width) = x.dim();
    let out_h = output_extent(height, kernel, stride, padding)?;
    let out_w = output_extent(width, kernel, stride, padding)?;
    let pad = padding as isize;

    let mut out = Array3::<f32>::from_elem((channels, out_h, out_w), f32::NEG_INFINITY);
    for c in 0..channels {
        for oy in 0..out_h {
            for ox in 0..out_w {
                let mut best = f32::NEG_INFINITY;
                for ky in 0..kernel {
                    let iy = (oy * stride + ky) as isize - pad;
                    if iy < 0 || iy >= height as isize {
                        continue;
                    }
                    for kx in 0..kernel {
                        let ix = (ox * stride + kx) as isize - pad;
                        if ix < 0 || ix >= width as isize {
                            continue;
                        }
                        best = best.max(x[[c, iy as usize, ix as usize]]);
                    }
                }
                out[[c, oy, ox]] = best;
            }
        }
    }
    Ok(out)
}

pub fn global_avg_pool(x: &Array3<f32>) -> Array1<f32> {
    let (_, height, width) = x.dim();
    let area = (height * width) as f32;
    x.outer_iter().map(|plane| plane.sum() / area).collect()
}

#[derive(Debug)]
pub struct Linear {
    /// `[out_features, in_features]`
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl Linear {
    pub fn new(weight: Array2<f32>, bias: Array1<f32>) -> Result<Self> {
        if weight.nrows() != bias.len() {
            return Err(ClassifierError::Shape(format!(
                "linear weight has {} rows but bias has {} entries",
                weight.nrows(),
                bias.len()
            )));
        }
        Ok(Self { weight, bias })
    }

    /// Takes `{prefix}.weight` / `{prefix}.bias`; the output width is read
    /// from the checkpoint.
    pub fn from_state_dict(
        state: &mut StateDict,
        prefix: &str,
        in_features: usize,
    ) -> Result<Self> {
        let weight_name = format!("{prefix}.weight");
        let out_features = match state.shape(&weight_name) {
            Some(&[rows, _]) => rows,
            Some(other) => {
                return Err(ClassifierError::ShapeMismatch {
                    tensor: weight_name,
                    expected: vec![0, in_features],
                    found: other.to_vec(),
                })
            }
            None => return Err(ClassifierError::MissingTensor(weight_name)),
        };
        let weight = state
            .take(&weight_name, &[out_features, in_features])?
            .into_shape((out_features, in_features))?;
        let bias_name = format!("{prefix}.bias");
        let bias = into_vector(state.take(&bias_name, &[out_features])?, &bias_name)?;
        Self::new(weight, bias)
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    pub fn forward(&self, x: &Array1<f32>) -> Result<Array1<f32>> {
        if x.len() != self.weight.ncols() {
            return Err(ClassifierError::Shape(format!(
                "linear expects {} features, got {}",
                self.weight.ncols(),
                x.len()
            )));
        }
        Ok(self.weight.dot(x) + &self.bias)
    }
}
