//! Activation and classification functions the network can be built with.

use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Elementwise activation after the convolution and dense stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Tanh,
    Relu,
    Sigmoid,
}

impl Activation {
    pub fn apply(&self, inputs: &Tensor) -> Tensor {
        match self {
            Activation::Tanh => inputs.tanh(),
            Activation::Relu => inputs.relu(),
            Activation::Sigmoid => inputs.sigmoid(),
        }
    }
}

/// Maps the output projection to class probabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classifier {
    #[default]
    Softmax,
}

impl Classifier {
    pub fn apply(&self, inputs: &Tensor) -> Tensor {
        match self {
            Classifier::Softmax => inputs.softmax(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::NodeType;
    use crate::tensor::GraphContext;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_activation_nodes() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let y = Activation::Relu.apply(&x);
        let p = Classifier::Softmax.apply(&y);
        let graph = ctx.borrow().main_graph().clone();
        assert_eq!(graph.get_node(y.node_id).unwrap().node_type, NodeType::ReLU(x.node_id));
        assert_eq!(graph.get_node(p.node_id).unwrap().node_type, NodeType::Softmax(y.node_id));
    }

    #[test]
    fn test_names_in_json() {
        assert_eq!(serde_json::to_string(&Activation::Sigmoid).unwrap(), "\"sigmoid\"");
        let parsed: Activation = serde_json::from_str("\"tanh\"").unwrap();
        assert_eq!(parsed, Activation::Tanh);
    }
}
