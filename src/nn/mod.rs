//! # Network Stages
//!
//! Each stage is a constructor that registers its persistent state and a
//! `forward` that appends its operations to the ASG. Stages compose left to
//! right:
//!
//! ```text
//! InputLayer -> CausalConv1d -> Pool1d -> flatten -> Dense -> OutputLayer
//! ```
//!
//! - [`InputLayer`]: optional normalization of the raw input, reshape to one channel
//! - [`CausalConv1d`]: causal convolution, bias, normalization, activation
//! - [`Pool1d`]: non-overlapping max/average pooling
//! - [`Dense`]: affine projection, normalization, activation
//! - [`OutputLayer`]: affine projection to two classes, normalization, softmax
//! - [`BatchNorm`]: the normalization used by all of the above
//!
//! A stage never records state updates on the side: `forward` returns them in
//! [`Forward::updates`] and the caller collects them.

pub mod activations;
pub mod batchnorm;
pub mod conv;
pub mod init;
pub mod input;
pub mod linear;
pub mod module;
pub mod output;
pub mod pooling;

pub use activations::{Activation, Classifier};
pub use batchnorm::BatchNorm;
pub use conv::{CausalConv1d, CausalConv1dConfig};
pub use input::InputLayer;
pub use linear::{Dense, Linear};
pub use module::{Forward, Module, Shared, Update};
pub use output::{OutputLayer, NUM_CLASSES};
pub use pooling::Pool1d;
