//! Input stage: optional normalization of the raw mini-batch.

use super::batchnorm::{normalize_optional, BatchNorm};
use super::module::{Forward, Module, Shared};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Turns the `(batch, length)` input into the `(batch, 1, length)` convolution input.
pub struct InputLayer {
    norm: Option<BatchNorm>,
    batch: usize,
    length: usize,
}

impl InputLayer {
    pub fn new(context: &Rc<RefCell<GraphContext>>, batch: usize, length: usize, normalize: bool) -> Self {
        let norm = normalize.then(|| BatchNorm::new(context, "input.norm", &[batch, length], &[0, 1]));
        Self { norm, batch, length }
    }
}

impl Module for InputLayer {
    fn forward(&self, inputs: &Tensor) -> Forward {
        let (batch, length) = (self.batch, self.length);
        normalize_optional(Forward::new(inputs.clone()), self.norm.as_ref())
            .map(|x| x.reshape(vec![batch, 1, length]))
    }

    fn parameters(&self) -> Vec<&Shared> {
        Vec::new()
    }

    fn buffers(&self) -> Vec<&Shared> {
        self.norm.as_ref().map(|n| n.buffers()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::NodeType;

    #[test]
    fn test_input_is_reshaped_to_one_channel() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let layer = InputLayer::new(&ctx, 4, 32, true);
        let x = Tensor::new_input(&ctx, "x");

        let out = layer.forward(&x);
        let graph = ctx.borrow().main_graph().clone();
        let node = graph.get_node(out.output.node_id).unwrap();
        assert!(matches!(&node.node_type, NodeType::Reshape(_, shape) if shape == &vec![4, 1, 32]));
        assert_eq!(out.updates.len(), 2);
        assert_eq!(layer.buffers()[2].shape(), &[1, 1]);
    }
}
