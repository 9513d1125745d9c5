//! Two-way output stage producing class probabilities.

use super::activations::Classifier;
use super::batchnorm::{normalize_optional, BatchNorm};
use super::linear::Linear;
use super::module::{Forward, Module, Shared};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Number of classes: label -1 is class 0, label +1 is class 1.
pub const NUM_CLASSES: usize = 2;

/// Affine projection to two classes, optional normalization, classifier.
pub struct OutputLayer {
    pub linear: Linear,
    norm: Option<BatchNorm>,
    classifier: Classifier,
}

impl OutputLayer {
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        linear: Linear,
        batch: usize,
        classifier: Classifier,
        normalize: bool,
    ) -> Self {
        let norm = normalize
            .then(|| BatchNorm::new(context, &format!("{}.norm", name), &[batch, linear.out_features()], &[0, 1]));
        Self { linear, norm, classifier }
    }
}

impl Module for OutputLayer {
    fn forward(&self, inputs: &Tensor) -> Forward {
        normalize_optional(self.linear.forward(inputs), self.norm.as_ref()).map(|x| self.classifier.apply(x))
    }

    fn parameters(&self) -> Vec<&Shared> {
        self.linear.parameters()
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
    fn test_output_ends_in_softmax() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let linear = Linear::new(&ctx, "output", 16, NUM_CLASSES, 0.25, &mut StdRng::seed_from_u64(3));
        let layer = OutputLayer::new(&ctx, "output", linear, 10, Classifier::Softmax, false);
        let h = Tensor::new_input(&ctx, "h");

        let out = layer.forward(&h);
        let graph = ctx.borrow().main_graph().clone();
        assert!(matches!(graph.get_node(out.output.node_id).unwrap().node_type, NodeType::Softmax(_)));
        assert!(out.updates.is_empty());
        assert_eq!(layer.parameters()[0].shape(), &[16, 2]);
        assert_eq!(layer.parameters()[1].name(), "output.bias");
    }
}
