//! Persistent state in the SafeTensors format.
//!
//! Every state entry (weights, velocities, running statistics) is written as
//! an F32 tensor under its state name. Scalars are stored with shape `[]`.

use crate::asg::Value;
use crate::runtime::StateStore;
use ndarray::ArrayD;
use safetensors::serialize_to_file;
use safetensors::tensor::{SafeTensors, TensorView};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SafeTensorsError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SafeTensors error: {0}")]
    SafeTensorsError(#[from] safetensors::SafeTensorError),

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("Tensor '{name}' has shape {shape:?} but holds {len} values")]
    ShapeMismatch { name: String, shape: Vec<usize>, len: usize },
}

type Result<T> = std::result::Result<T, SafeTensorsError>;

/// Writes every entry of `state` to `path`.
pub fn save_state<P: AsRef<Path>>(path: P, state: &StateStore) -> Result<()> {
    let mut names: Vec<&String> = state.keys().collect();
    names.sort();

    let encoded: Vec<(&str, Vec<usize>, Vec<u8>)> = names
        .into_iter()
        .map(|name| {
            let value = &state[name];
            let bytes = match value {
                Value::Tensor(arr) => arr.iter().flat_map(|x| x.to_le_bytes()).collect(),
                Value::ScalarF32(x) => x.to_le_bytes().to_vec(),
            };
            (name.as_str(), value.shape(), bytes)
        })
        .collect();

    let mut views = Vec::with_capacity(encoded.len());
    for (name, shape, bytes) in &encoded {
        views.push((*name, TensorView::new(safetensors::Dtype::F32, shape.clone(), bytes)?));
    }

    serialize_to_file(views, &None, path.as_ref())?;
    log::debug!("Saved {} state tensors to {}", encoded.len(), path.as_ref().display());
    Ok(())
}

/// Reads a state file written by [`save_state`].
pub fn load_state<P: AsRef<Path>>(path: P) -> Result<StateStore> {
    let buffer = std::fs::read(path)?;
    let tensors = SafeTensors::deserialize(&buffer)?;

    let mut state = StateStore::new();
    for (name, tensor) in tensors.tensors() {
        let floats: Vec<f32> = match tensor.dtype() {
            safetensors::Dtype::F32 => tensor
                .data()
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            safetensors::Dtype::F64 => tensor
                .data()
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
                .collect(),
            other => return Err(SafeTensorsError::UnsupportedDtype(format!("{:?}", other))),
        };

        let shape = tensor.shape().to_vec();
        let len = floats.len();
        let arr = ArrayD::from_shape_vec(ndarray::IxDyn(&shape), floats)
            .map_err(|_| SafeTensorsError::ShapeMismatch { name: name.clone(), shape, len })?;
        state.insert(name, Value::Tensor(arr));
    }
    Ok(state)
}

/// Names of the tensors stored in `path`.
pub fn list_tensors<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let buffer = std::fs::read(path)?;
    let tensors = SafeTensors::deserialize(&buffer)?;
    Ok(tensors.names().iter().map(|s| s.to_string()).collect())
}
