//! Checkpoints: configuration, training progress and state in one directory.
//!
//! ```text
//! checkpoint_dir/
//! ├── config.json          # CnnConfig
//! ├── meta.json            # step counter, last loss/error
//! └── state.safetensors    # parameters, velocities, running statistics
//! ```

use super::safetensors_io::{load_state, save_state, SafeTensorsError};
use crate::model::CnnConfig;
use crate::runtime::StateStore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SafeTensors error: {0}")]
    SafeTensorsError(#[from] SafeTensorsError),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Checkpoint directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
}

type Result<T> = std::result::Result<T, CheckpointError>;

/// Training progress stored next to the state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub version: String,
    pub global_step: usize,
    pub last_loss: Option<f32>,
    pub last_error: Option<f32>,
}

impl Default for CheckpointMeta {
    fn default() -> Self {
        Self { version: "1.0".to_string(), global_step: 0, last_loss: None, last_error: None }
    }
}

impl CheckpointMeta {
    pub fn with_global_step(mut self, step: usize) -> Self {
        self.global_step = step;
        self
    }

    pub fn with_last_step(mut self, loss: f32, error: f32) -> Self {
        self.last_loss = Some(loss);
        self.last_error = Some(error);
        self
    }
}

#[derive(Debug)]
pub struct Checkpoint {
    pub config: CnnConfig,
    pub meta: CheckpointMeta,
    pub state: StateStore,
}

impl Checkpoint {
    pub fn new(config: CnnConfig, state: StateStore) -> Self {
        Self { config, meta: CheckpointMeta::default(), state }
    }

    pub fn with_meta(mut self, meta: CheckpointMeta) -> Self {
        self.meta = meta;
        self
    }
}

pub fn save_checkpoint<P: AsRef<Path>>(path: P, checkpoint: &Checkpoint) -> Result<()> {
    let dir = path.as_ref();
    fs::create_dir_all(dir)?;

    fs::write(dir.join("config.json"), serde_json::to_string_pretty(&checkpoint.config)?)?;
    fs::write(dir.join("meta.json"), serde_json::to_string_pretty(&checkpoint.meta)?)?;
    save_state(dir.join("state.safetensors"), &checkpoint.state)?;

    log::info!("Checkpoint at step {} saved to {}", checkpoint.meta.global_step, dir.display());
    Ok(())
}

pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<Checkpoint> {
    let dir = path.as_ref();
    if !dir.exists() {
        return Err(CheckpointError::DirectoryNotFound(dir.to_path_buf()));
    }

    let config: CnnConfig = serde_json::from_str(&read_required(&dir.join("config.json"))?)?;
    let meta_path = dir.join("meta.json");
    let meta = if meta_path.exists() {
        serde_json::from_str(&fs::read_to_string(&meta_path)?)?
    } else {
        CheckpointMeta::default()
    };

    let state_path = dir.join("state.safetensors");
    if !state_path.exists() {
        return Err(CheckpointError::FileNotFound(state_path));
    }
    let state = load_state(&state_path)?;

    Ok(Checkpoint { config, meta, state })
}

fn read_required(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(CheckpointError::FileNotFound(path.to_path_buf()));
    }
    Ok(fs::read_to_string(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::Value;
    use ndarray::ArrayD;

    #[test]
    fn test_save_load_checkpoint() {
        let mut state = StateStore::new();
        state.insert(
            "dense.weights".to_string(),
            Value::Tensor(ArrayD::from_shape_vec(ndarray::IxDyn(&[2, 2]), vec![1.0, 2.0, 3.0, 4.0]).unwrap()),
        );
        let config = CnnConfig::default().with_batch_size(4).with_seed(3);
        let checkpoint = Checkpoint::new(config.clone(), state)
            .with_meta(CheckpointMeta::default().with_global_step(5).with_last_step(1.25, 2.0));

        let path = std::env::temp_dir().join("causal_cnn_checkpoint_test");
        save_checkpoint(&path, &checkpoint).expect("Failed to save checkpoint");
        let loaded = load_checkpoint(&path).expect("Failed to load checkpoint");

        assert_eq!(loaded.config, config);
        assert_eq!(loaded.meta.global_step, 5);
        assert_eq!(loaded.meta.last_loss, Some(1.25));
        assert_eq!(loaded.state["dense.weights"], checkpoint.state["dense.weights"]);

        fs::remove_dir_all(path).ok();
    }

    #[test]
    fn test_missing_directory() {
        let err = load_checkpoint("/nonexistent/causal_cnn_checkpoint").unwrap_err();
        assert!(matches!(err, CheckpointError::DirectoryNotFound(_)));
    }
}
