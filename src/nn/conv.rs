//! Causal 1-D convolution stage.

use super::activations::Activation;
use super::batchnorm::{normalize_optional, BatchNorm};
use super::init;
use super::module::{Forward, Module, Shared};
use crate::tensor::{GraphContext, Tensor};
use rand::Rng;
use std::cell::RefCell;
use std::rc::Rc;

/// Shape and behaviour of a [`CausalConv1d`] stage.
#[derive(Debug, Clone)]
pub struct CausalConv1dConfig {
    /// Mini-batch size.
    pub batch: usize,
    /// Sequence length, unchanged by the convolution.
    pub length: usize,
    /// Number of filters (output channels).
    pub filters: usize,
    /// Taps per filter.
    pub filter_length: usize,
    pub activation: Activation,
    /// Normalize over (batch, channel) before the activation.
    pub normalize: bool,
}

impl CausalConv1dConfig {
    pub fn new(batch: usize, length: usize, filters: usize, filter_length: usize) -> Self {
        Self { batch, length, filters, filter_length, activation: Activation::default(), normalize: true }
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_normalization(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    /// `(filters, 1, filter_length)`.
    pub fn filter_shape(&self) -> [usize; 3] {
        [self.filters, 1, self.filter_length]
    }
}

/// Single-channel causal convolution: `(batch, 1, L)` to `(batch, filters, L)`.
///
/// The output at position `t` only sees inputs at positions `<= t`.
pub struct CausalConv1d {
    /// Filters `(filters, 1, filter_length)`, drawn from `N(0, 1/sqrt(filter_length))`.
    pub filters: Shared,
    /// One bias per filter, zero-initialized.
    pub bias: Shared,
    norm: Option<BatchNorm>,
    activation: Activation,
    num_filters: usize,
}

impl CausalConv1d {
    pub fn new<R: Rng + ?Sized>(
        ctx: &Rc<RefCell<GraphContext>>,
        name: &str,
        config: &CausalConv1dConfig,
        rng: &mut R,
    ) -> Self {
        let std = 1.0 / (config.filter_length as f32).sqrt();
        let filters = Shared::new(ctx, &format!("{}.filters", name), init::gaussian(&config.filter_shape(), std, rng));
        let bias = Shared::zeros(ctx, &format!("{}.bias", name), &[config.filters]);

        let norm = config.normalize.then(|| {
            BatchNorm::new(ctx, &format!("{}.norm", name), &[config.batch, config.filters, config.length], &[0, 1])
        });

        Self { filters, bias, norm, activation: config.activation, num_filters: config.filters }
    }
}

impl Module for CausalConv1d {
    fn forward(&self, inputs: &Tensor) -> Forward {
        let convolved = inputs.causal_conv1d(&self.filters.tensor);
        let bias = self.bias.tensor.reshape(vec![1, self.num_filters, 1]);
        let normalized = normalize_optional(Forward::new(&convolved + &bias), self.norm.as_ref());
        normalized.map(|x| self.activation.apply(x))
    }

    fn parameters(&self) -> Vec<&Shared> {
        vec![&self.filters, &self.bias]
    }

    fn buffers(&self) -> Vec<&Shared> {
        self.norm.as_ref().map(|n| n.buffers()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::NodeType;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_parameters_in_registration_order() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let config = CausalConv1dConfig::new(10, 64, 3, 15);
        let conv = CausalConv1d::new(&ctx, "conv", &config, &mut StdRng::seed_from_u64(0));

        let params = conv.parameters();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].name(), "conv.filters");
        assert_eq!(params[0].shape(), &[3, 1, 15]);
        assert_eq!(params[1].name(), "conv.bias");
        assert!(params[1].initial.iter().all(|&v| v == 0.0));
        assert_eq!(conv.buffers().len(), 4);
    }

    #[test]
    fn test_without_normalization_no_updates() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let config = CausalConv1dConfig::new(2, 8, 1, 3)
            .with_normalization(false)
            .with_activation(Activation::Relu);
        let conv = CausalConv1d::new(&ctx, "conv", &config, &mut StdRng::seed_from_u64(0));
        let x = Tensor::new_input(&ctx, "x");
        let out = conv.forward(&x);

        assert!(out.updates.is_empty());
        assert!(conv.buffers().is_empty());
        let graph = ctx.borrow().main_graph().clone();
        assert!(matches!(graph.get_node(out.output.node_id).unwrap().node_type, NodeType::ReLU(_)));
    }
}
