//! Fully connected stages: the affine core and the dense hidden layer.

use super::activations::Activation;
use super::batchnorm::{normalize_optional, BatchNorm};
use super::init;
use super::module::{Forward, Module, Shared};
use crate::tensor::{GraphContext, Tensor};
use rand::Rng;
use std::cell::RefCell;
use std::rc::Rc;

/// Affine projection `y = xW + b`.
///
/// Owns the weights (`{name}.weights`) and the bias (`{name}.bias`) as
/// persistent state; the bias starts at zero.
pub struct Linear {
    pub weights: Shared,
    pub bias: Shared,
}

impl Linear {
    /// Registers a `(in_features, out_features)` weight drawn from `N(0, std)`.
    pub fn new<R: Rng + ?Sized>(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        in_features: usize,
        out_features: usize,
        std: f32,
        rng: &mut R,
    ) -> Self {
        let weights = Shared::new(
            context,
            &format!("{}.weights", name),
            init::gaussian(&[in_features, out_features], std, rng),
        );
        let bias = Shared::zeros(context, &format!("{}.bias", name), &[out_features]);
        Self { weights, bias }
    }

    pub fn out_features(&self) -> usize {
        self.weights.shape()[1]
    }
}

impl Module for Linear {
    fn forward(&self, inputs: &Tensor) -> Forward {
        let dot_product = inputs.dot(&self.weights.tensor);
        Forward::new(&dot_product + &self.bias.tensor)
    }

    fn parameters(&self) -> Vec<&Shared> {
        vec![&self.weights, &self.bias]
    }
}

/// Affine projection, optional normalization over (batch, features), activation.
pub struct Dense {
    pub linear: Linear,
    norm: Option<BatchNorm>,
    activation: Activation,
}

impl Dense {
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        linear: Linear,
        batch: usize,
        activation: Activation,
        normalize: bool,
    ) -> Self {
        let norm = normalize
            .then(|| BatchNorm::new(context, &format!("{}.norm", name), &[batch, linear.out_features()], &[0, 1]));
        Self { linear, norm, activation }
    }
}

impl Module for Dense {
    fn forward(&self, inputs: &Tensor) -> Forward {
        normalize_optional(self.linear.forward(inputs), self.norm.as_ref()).map(|x| self.activation.apply(x))
    }

    fn parameters(&self) -> Vec<&Shared> {
        self.linear.parameters()
    }

    fn buffers(&self) -> Vec<&Shared> {
        self.norm.as_ref().map(|n| n.buffers()).unwrap_or_default()
    }
}
