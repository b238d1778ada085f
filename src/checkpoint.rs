//! Loading of `.safetensors` state dicts.
//!
//! The checkpoint is a torchvision-style ResNet state dict exported to
//! safetensors. Only `F32` tensors are kept; the integer bookkeeping tensors
//! batch-norm layers carry (`num_batches_tracked`) are skipped.

use log::debug;
use ndarray::{ArrayD, IxDyn};
use safetensors::{Dtype, SafeTensors};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{ClassifierError, Result};

/// Prefix added to every key when a model is saved from `nn.DataParallel`.
const DATA_PARALLEL_PREFIX: &str = "module.";

#[derive(Debug, Default)]
pub struct StateDict {
    tensors: HashMap<String, ArrayD<f32>>,
}

impl StateDict {
    pub fn from_tensors(tensors: HashMap<String, ArrayD<f32>>) -> Self {
        Self { tensors }
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Shape of a tensor without removing it.
    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.tensors.get(name).map(|t| t.shape())
    }

    /// Removes `name` and checks it has exactly `expected_shape`.
    pub fn take(&mut self, name: &str, expected_shape: &[usize]) -> Result<ArrayD<f32>> {
        let tensor = self
            .tensors
            .remove(name)
            .ok_or_else(|| ClassifierError::MissingTensor(name.to_string()))?;
        if tensor.shape() != expected_shape {
            return Err(ClassifierError::ShapeMismatch {
                tensor: name.to_string(),
                expected: expected_shape.to_vec(),
                found: tensor.shape().to_vec(),
            });
        }
        Ok(tensor)
    }

    /// Names left over after the model has taken what it needs.
    pub fn remaining(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

pub fn load_state_dict(path: impl AsRef<Path>) -> Result<StateDict> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|e| ClassifierError::io(path, e))?;
    parse_state_dict(&bytes).map_err(|e| match e {
        ClassifierError::Checkpoint { source, .. } => ClassifierError::Checkpoint {
            path: path.to_path_buf(),
            source,
        },
        other => other,
    })
}

/// Parses an in-memory safetensors buffer.
pub fn parse_state_dict(bytes: &[u8]) -> Result<StateDict> {
    let safetensors = SafeTensors::deserialize(bytes).map_err(|e| ClassifierError::Checkpoint {
        path: "<memory>".into(),
        source: e,
    })?;

    let mut tensors = HashMap::new();
    for (name, view) in safetensors.tensors() {
        match view.dtype() {
            Dtype::F32 => {}
            Dtype::I64 | Dtype::I32 | Dtype::U8 | Dtype::BOOL => {
                debug!("Skipping non-float tensor '{}' ({:?})", name, view.dtype());
                continue;
            }
            other => {
                return Err(ClassifierError::UnsupportedDtype {
                    tensor: name,
                    dtype: format!("{other:?}"),
                })
            }
        }

        // Tensor data is not guaranteed to be 4-byte aligned inside the buffer.
        let data: Vec<f32> = view
            .data()
            .chunks_exact(std::mem::size_of::<f32>())
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        let array = ArrayD::from_shape_vec(IxDyn(view.shape()), data)?;

        let key = name
            .strip_prefix(DATA_PARALLEL_PREFIX)
            .map(str::to_string)
            .unwrap_or(name);
        tensors.insert(key, array);
    }

    Ok(StateDict { tensors })
}
