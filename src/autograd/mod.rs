//! Autograd: building the gradient subgraph d(loss)/d(node).
//!
//! Algorithm:
//!  - walk the forward graph upstream of `loss` in reverse topological order;
//!  - for every node holding dL/dY, emit the contributions to its operands and
//!    accumulate (sum) them;
//!  - gradient nodes are appended to the *same* graph, so they may reference
//!    forward values directly and are evaluated in the same pass.
//!
//! Only operands that lie on a path to one of the requested nodes receive
//! gradients. Comparisons, `Sign`, `ArgMax` and `OneHot` have zero derivative.
//!
//! Shapes of the forward nodes must already be inferred: `MeanAxes` needs its
//! element count, `Reshape` its source shape and `Softmax` its last axis.

use crate::analysis::shape_inference::{ShapeInference, ShapeInferenceError};
use crate::asg::{Asg, AsgError, NodeId, NodeType, Value};
use crate::tensor::Tensor;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AutogradError {
    #[error("ASG: {0}")]
    Asg(#[from] AsgError),
    #[error("Shape: {0}")]
    Shape(#[from] ShapeInferenceError),
    #[error("Loss node {0} must be a scalar, got shape {1:?}")]
    NonScalarLoss(NodeId, Vec<usize>),
}

pub type AutogradResult<T> = Result<T, AutogradError>;

/// Gradient builder over a graph with inferred shapes.
pub struct Gradients<'a> {
    graph: &'a mut Asg,
    /// Forward node -> its accumulated gradient node.
    gmap: HashMap<NodeId, NodeId>,
    /// Forward nodes that lie on a path to a requested node.
    needs_grad: HashSet<NodeId>,
}

impl<'a> Gradients<'a> {
    pub fn new(graph: &'a mut Asg) -> Self {
        Self { graph, gmap: HashMap::new(), needs_grad: HashSet::new() }
    }

    /// Appends the gradient subgraph of `loss_id` and returns, for each node of
    /// `wrt`, the node holding d(loss)/d(node). Unreachable nodes get zeros.
    pub fn build(mut self, loss_id: NodeId, wrt: &[NodeId]) -> AutogradResult<Vec<NodeId>> {
        let loss_shape = self.graph.shape_of(loss_id)?;
        if loss_shape.iter().product::<usize>() != 1 {
            return Err(AutogradError::NonScalarLoss(loss_id, loss_shape));
        }

        let order = ShapeInference::topological_sort_from(self.graph, &[loss_id])?;
        self.mark_needs_grad(&order, wrt)?;

        let seed = self.lit_scalar(1.0);
        self.gmap.insert(loss_id, seed);

        for &id in order.iter().rev() {
            let g = match self.gmap.get(&id).copied() {
                Some(g) => g,
                None => continue,
            };
            let node_type = self.graph.get_node(id)?.node_type.clone();
            self.backprop(id, &node_type, g)?;
        }

        let mut grads = Vec::with_capacity(wrt.len());
        for &target in wrt {
            let grad = match self.gmap.get(&target).copied() {
                Some(g) => g,
                None => {
                    let zero = self.lit_scalar(0.0);
                    self.add_node(NodeType::Broadcast(zero, target))
                }
            };
            if let Some(name) = self.graph.get_node(target)?.name.clone() {
                self.graph.get_node_mut(grad)?.name = Some(format!("grad.{}", name));
            }
            grads.push(grad);
        }
        Ok(grads)
    }

    fn mark_needs_grad(&mut self, order: &[NodeId], wrt: &[NodeId]) -> AutogradResult<()> {
        self.needs_grad.extend(wrt.iter().copied());
        // `order` lists operands before their users.
        for &id in order {
            let node = self.graph.get_node(id)?;
            if node.node_type.inputs().iter().any(|i| self.needs_grad.contains(i)) {
                self.needs_grad.insert(id);
            }
        }
        Ok(())
    }

    /// Emits the contributions of node `y` with gradient `g` to its operands.
    fn backprop(&mut self, y: NodeId, node_type: &NodeType, g: NodeId) -> AutogradResult<()> {
        match node_type {
            // Leaves
            NodeType::Input { .. } | NodeType::Parameter { .. } | NodeType::Literal(_) => {}

            // -------- BINARY --------
            NodeType::Add(a, b) => {
                if self.wants(*a) {
                    let ra = self.add_node(NodeType::ReduceSumTo(g, *a));
                    self.acc(*a, ra);
                }
                if self.wants(*b) {
                    let rb = self.add_node(NodeType::ReduceSumTo(g, *b));
                    self.acc(*b, rb);
                }
            }
            NodeType::Subtract(a, b) => {
                if self.wants(*a) {
                    let ra = self.add_node(NodeType::ReduceSumTo(g, *a));
                    self.acc(*a, ra);
                }
                if self.wants(*b) {
                    let neg = self.add_node(NodeType::Negate(g));
                    let rb = self.add_node(NodeType::ReduceSumTo(neg, *b));
                    self.acc(*b, rb);
                }
            }
            NodeType::Multiply(a, b) => {
                if self.wants(*a) {
                    let g_a = self.add_node(NodeType::Multiply(g, *b));
                    let ra = self.add_node(NodeType::ReduceSumTo(g_a, *a));
                    self.acc(*a, ra);
                }
                if self.wants(*b) {
                    let g_b = self.add_node(NodeType::Multiply(g, *a));
                    let rb = self.add_node(NodeType::ReduceSumTo(g_b, *b));
                    self.acc(*b, rb);
                }
            }
            NodeType::Divide(a, b) => {
                if self.wants(*a) {
                    // g / b
                    let g_a = self.add_node(NodeType::Divide(g, *b));
                    let ra = self.add_node(NodeType::ReduceSumTo(g_a, *a));
                    self.acc(*a, ra);
                }
                if self.wants(*b) {
                    // -(g * a) / b^2
                    let num = self.add_node(NodeType::Multiply(g, *a));
                    let b2 = self.add_node(NodeType::Multiply(*b, *b));
                    let quotient = self.add_node(NodeType::Divide(num, b2));
                    let g_b = self.add_node(NodeType::Negate(quotient));
                    let rb = self.add_node(NodeType::ReduceSumTo(g_b, *b));
                    self.acc(*b, rb);
                }
            }
            NodeType::Power(a, e) => {
                if self.wants(*a) {
                    // g * e * a^(e-1)
                    let one = self.lit_scalar(1.0);
                    let e_minus_one = self.add_node(NodeType::Subtract(*e, one));
                    let a_pow = self.add_node(NodeType::Power(*a, e_minus_one));
                    let term = self.add_node(NodeType::Multiply(*e, a_pow));
                    let g_a = self.add_node(NodeType::Multiply(g, term));
                    let ra = self.add_node(NodeType::ReduceSumTo(g_a, *a));
                    self.acc(*a, ra);
                }
            }
            NodeType::MatrixMultiply(a, b) => {
                if self.wants(*a) {
                    // g @ b^T
                    let bt = self.add_node(NodeType::Transpose(*b, 0, 1));
                    let g_a = self.add_node(NodeType::MatrixMultiply(g, bt));
                    self.acc(*a, g_a);
                }
                if self.wants(*b) {
                    // a^T @ g
                    let at = self.add_node(NodeType::Transpose(*a, 0, 1));
                    let g_b = self.add_node(NodeType::MatrixMultiply(at, g));
                    self.acc(*b, g_b);
                }
            }

            // -------- UNARY --------
            NodeType::Negate(x) => {
                if self.wants(*x) {
                    let g_x = self.add_node(NodeType::Negate(g));
                    self.acc(*x, g_x);
                }
            }
            NodeType::Log(x) => {
                if self.wants(*x) {
                    let g_x = self.add_node(NodeType::Divide(g, *x));
                    self.acc(*x, g_x);
                }
            }
            NodeType::Sqrt(x) => {
                if self.wants(*x) {
                    let two = self.lit_scalar(2.0);
                    let denom = self.add_node(NodeType::Multiply(two, y));
                    let g_x = self.add_node(NodeType::Divide(g, denom));
                    self.acc(*x, g_x);
                }
            }
            NodeType::ReLU(x) => {
                if self.wants(*x) {
                    let zero = self.lit_scalar(0.0);
                    let mask = self.add_node(NodeType::GreaterThan(*x, zero));
                    let g_x = self.add_node(NodeType::Multiply(g, mask));
                    self.acc(*x, g_x);
                }
            }
            NodeType::Sigmoid(x) => {
                if self.wants(*x) {
                    // g * y * (1 - y)
                    let one = self.lit_scalar(1.0);
                    let one_minus = self.add_node(NodeType::Subtract(one, y));
                    let term = self.add_node(NodeType::Multiply(y, one_minus));
                    let g_x = self.add_node(NodeType::Multiply(g, term));
                    self.acc(*x, g_x);
                }
            }
            NodeType::Tanh(x) => {
                if self.wants(*x) {
                    // g * (1 - y^2)
                    let one = self.lit_scalar(1.0);
                    let y2 = self.add_node(NodeType::Multiply(y, y));
                    let term = self.add_node(NodeType::Subtract(one, y2));
                    let g_x = self.add_node(NodeType::Multiply(g, term));
                    self.acc(*x, g_x);
                }
            }
            NodeType::Softmax(x) => {
                if self.wants(*x) {
                    // y * (g - sum(g * y, last axis))
                    let last = self.graph.shape_of(*x)?.len() - 1;
                    let gy = self.add_node(NodeType::Multiply(g, y));
                    let dot = self.add_node(NodeType::SumAxes { input: gy, axes: vec![last] });
                    let centered = self.add_node(NodeType::Subtract(g, dot));
                    let g_x = self.add_node(NodeType::Multiply(y, centered));
                    self.acc(*x, g_x);
                }
            }

            // -------- REDUCTIONS --------
            NodeType::Sum(x) | NodeType::SumAxes { input: x, .. } => {
                if self.wants(*x) {
                    let g_x = self.add_node(NodeType::Broadcast(g, *x));
                    self.acc(*x, g_x);
                }
            }
            NodeType::MeanAxes { input: x, axes } => {
                if self.wants(*x) {
                    let shape = self.graph.shape_of(*x)?;
                    let n: usize = axes.iter().map(|&a| shape[a]).product();
                    let inv_n = self.lit_scalar(1.0 / n as f32);
                    let scaled = self.add_node(NodeType::Multiply(g, inv_n));
                    let g_x = self.add_node(NodeType::Broadcast(scaled, *x));
                    self.acc(*x, g_x);
                }
            }

            // -------- TRANSFORMATIONS --------
            NodeType::Reshape(x, _) => {
                if self.wants(*x) {
                    let shape = self.graph.shape_of(*x)?;
                    let g_x = self.add_node(NodeType::Reshape(g, shape));
                    self.acc(*x, g_x);
                }
            }
            NodeType::Transpose(x, a1, a2) => {
                if self.wants(*x) {
                    let g_x = self.add_node(NodeType::Transpose(g, *a1, *a2));
                    self.acc(*x, g_x);
                }
            }
            NodeType::Broadcast(x, _) => {
                if self.wants(*x) {
                    let g_x = self.add_node(NodeType::ReduceSumTo(g, *x));
                    self.acc(*x, g_x);
                }
            }
            NodeType::ReduceSumTo(x, _) => {
                if self.wants(*x) {
                    let g_x = self.add_node(NodeType::Broadcast(g, *x));
                    self.acc(*x, g_x);
                }
            }

            // -------- CONVOLUTION & POOLING --------
            NodeType::CausalConv1d { input, weight } => {
                if self.wants(*input) {
                    let g_in = self.add_node(NodeType::CausalConv1dBackwardInput { grad_output: g, weight: *weight });
                    self.acc(*input, g_in);
                }
                if self.wants(*weight) {
                    let filter_length = self.graph.shape_of(*weight)?[2];
                    let g_w = self.add_node(NodeType::CausalConv1dBackwardWeight {
                        grad_output: g,
                        input: *input,
                        filter_length,
                    });
                    self.acc(*weight, g_w);
                }
            }
            NodeType::Pool1d { input, width, mode } => {
                if self.wants(*input) {
                    let g_in = self.add_node(NodeType::Unpool1d {
                        input: g,
                        original_input: *input,
                        width: *width,
                        mode: *mode,
                    });
                    self.acc(*input, g_in);
                }
            }

            // Zero derivative
            NodeType::GreaterThan(..)
            | NodeType::Equal(..)
            | NodeType::NotEqual(..)
            | NodeType::Sign(_)
            | NodeType::ArgMax { .. }
            | NodeType::OneHot { .. } => {}

            // Second-order gradients are not supported
            NodeType::CausalConv1dBackwardInput { .. }
            | NodeType::CausalConv1dBackwardWeight { .. }
            | NodeType::Unpool1d { .. } => {
                return Err(AutogradError::Asg(AsgError::UnsupportedOperation(format!(
                    "gradient of {:?}",
                    node_type
                ))));
            }
        }
        Ok(())
    }

    fn wants(&self, id: NodeId) -> bool {
        self.needs_grad.contains(&id)
    }

    fn add_node(&mut self, node_type: NodeType) -> NodeId {
        self.graph.add_node(None, node_type)
    }

    fn lit_scalar(&mut self, v: f32) -> NodeId {
        self.graph.add_node(None, NodeType::Literal(Value::ScalarF32(v)))
    }

    /// dL/d(target) += contrib
    fn acc(&mut self, target: NodeId, contrib: NodeId) {
        if let Some(prev) = self.gmap.get(&target).copied() {
            let sum = self.add_node(NodeType::Add(prev, contrib));
            self.gmap.insert(target, sum);
        } else {
            self.gmap.insert(target, contrib);
        }
    }
}

/// Symbolic gradients of a scalar `loss` w.r.t. each tensor of `wrt`.
///
/// The graph must have inferred shapes for every node upstream of `loss`.
pub fn grad(loss: &Tensor, wrt: &[Tensor]) -> AutogradResult<Vec<Tensor>> {
    let ids: Vec<NodeId> = wrt.iter().map(|t| t.node_id).collect();
    let grads = {
        let mut ctx = loss.context.borrow_mut();
        Gradients::new(ctx.main_graph_mut()).build(loss.node_id, &ids)?
    };
    Ok(grads.into_iter().map(|id| Tensor::from_node(&loss.context, id)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::DType;
    use crate::tensor::GraphContext;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn infer(ctx: &Rc<RefCell<GraphContext>>, entries: &[(&str, Vec<usize>)]) {
        let shapes = entries.iter().map(|(n, s)| (n.to_string(), (s.clone(), DType::F32))).collect();
        ShapeInference::run(ctx.borrow_mut().main_graph_mut(), &shapes).unwrap();
    }

    #[test]
    fn test_unrelated_parameter_gets_zero_gradient() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let w = Tensor::new_parameter(&ctx, "w");
        let unused = Tensor::new_parameter(&ctx, "unused");
        let loss = (&w * &w).sum();
        infer(&ctx, &[("w", vec![3]), ("unused", vec![2, 2])]);

        let grads = grad(&loss, &[w, unused]).unwrap();
        let graph = ctx.borrow().main_graph().clone();
        let zero_grad = graph.get_node(grads[1].node_id).unwrap();
        assert!(matches!(zero_grad.node_type, NodeType::Broadcast(_, _)));
        assert_eq!(zero_grad.name.as_deref(), Some("grad.unused"));
    }

    #[test]
    fn test_non_scalar_loss_is_rejected() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let w = Tensor::new_parameter(&ctx, "w");
        let not_a_loss = w.tanh();
        infer(&ctx, &[("w", vec![3])]);

        let err = grad(&not_a_loss, &[w]).unwrap_err();
        assert!(matches!(err, AutogradError::NonScalarLoss(_, _)));
    }

    #[test]
    fn test_input_branch_is_pruned() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let w = Tensor::new_parameter(&ctx, "w");
        let loss = x.causal_conv1d(&w).sum();
        infer(&ctx, &[("x", vec![2, 1, 6]), ("w", vec![1, 1, 3])]);

        grad(&loss, &[w]).unwrap();
        let graph = ctx.borrow().main_graph().clone();
        let has_input_grad = graph
            .nodes
            .values()
            .any(|n| matches!(n.node_type, NodeType::CausalConv1dBackwardInput { .. }));
        assert!(!has_input_grad);
    }
}
