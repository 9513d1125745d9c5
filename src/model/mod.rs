//! # Network Graph Builder
//!
//! Assembles the whole classifier into one graph:
//!
//! ```text
//! x (batch, L) -> InputLayer -> CausalConv1d -> Pool1d -> flatten
//!              -> Dense -> OutputLayer -> probabilities (batch, 2)
//! ```
//!
//! plus the prediction, the regularized loss, the error count, the gradients of
//! the loss and the momentum updates of every parameter.
//!
//! ```ignore
//! let builder = GraphBuilder::new(CnnConfig::default().with_seed(7))?;
//! let x = builder.input("x");
//! let y = builder.input("y");
//! let network = builder.assemble(&x, &y)?;
//! let mut session = network.session();
//! let step = network.train_step(&mut session, batch_x, batch_y)?;
//! ```

pub mod builder;
pub mod config;
pub mod network;

pub use builder::{GraphBuilder, LayerShapes};
pub use config::{CnnConfig, ConfigError};
pub use network::{Network, StepResult};

use crate::analysis::shape_inference::ShapeInferenceError;
use crate::autograd::AutogradError;
use crate::runtime::RuntimeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Shape inference failed: {0}")]
    Shape(#[from] ShapeInferenceError),
    #[error("Gradient construction failed: {0}")]
    Autograd(#[from] AutogradError),
    #[error("Execution failed: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("Tensor '{0}' does not belong to this builder's graph")]
    ForeignTensor(String),
    #[error("Input tensors passed to assemble must be named inputs")]
    UnnamedInput,
    #[error("Tensor '{0}' is not an input node")]
    NotAnInput(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;
