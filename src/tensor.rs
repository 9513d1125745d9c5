//! Module defining `Tensor` and `GraphContext`.
//!
//! `Tensor` is not a data container. It is a lightweight handle (a symbolic
//! variable) for one node of the Abstract Semantic Graph (ASG). Operations on
//! tensors (`+`, `dot`, `causal_conv1d`, ...) compute nothing; they append
//! nodes to the graph.
//!
//! `GraphContext` owns the graph under construction.

use crate::asg::{Asg, NodeId, NodeType, PoolMode, Shape, Value};
use ndarray::ArrayD;
use std::cell::RefCell;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::rc::Rc;

/// Owns the graph while it is being built.
///
/// Shared between all `Tensor` handles through `Rc<RefCell<_>>`.
#[derive(Debug, Clone)]
pub struct GraphContext {
    main_graph: Asg,
}

impl GraphContext {
    pub fn new() -> Self {
        Self { main_graph: Asg::new(0) }
    }

    pub fn main_graph_mut(&mut self) -> &mut Asg {
        &mut self.main_graph
    }

    pub fn main_graph(&self) -> &Asg {
        &self.main_graph
    }
}

impl Default for GraphContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Symbolic handle for a node of the ASG.
///
/// Holds the node ID and a shared reference to the `GraphContext` the node
/// lives in. Every operation adds a new node to that graph.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub node_id: NodeId,
    pub context: Rc<RefCell<GraphContext>>,
}

impl Tensor {
    /// Wraps an existing node of `context`.
    pub fn from_node(context: &Rc<RefCell<GraphContext>>, node_id: NodeId) -> Self {
        Self { node_id, context: Rc::clone(context) }
    }

    /// Creates an input node. Inputs are fed with data at execution time.
    pub fn new_input(context: &Rc<RefCell<GraphContext>>, name: &str) -> Self {
        let mut ctx = context.borrow_mut();
        let graph = ctx.main_graph_mut();
        let node_id = graph.add_node(Some(name.to_string()), NodeType::Input { name: name.to_string() });
        graph.inputs.push(node_id);
        Self { node_id, context: Rc::clone(context) }
    }

    /// Creates a persistent state node (weight, bias, velocity, running statistic).
    pub fn new_parameter(context: &Rc<RefCell<GraphContext>>, name: &str) -> Self {
        let node_id = context
            .borrow_mut()
            .main_graph_mut()
            .add_node(Some(name.to_string()), NodeType::Parameter { name: name.to_string() });
        Self { node_id, context: Rc::clone(context) }
    }

    /// Creates a constant node holding `data`.
    pub fn new_literal(context: &Rc<RefCell<GraphContext>>, data: ArrayD<f32>, name: &str) -> Self {
        let node_id = context
            .borrow_mut()
            .main_graph_mut()
            .add_node(Some(name.to_string()), NodeType::Literal(Value::Tensor(data)));
        Self { node_id, context: Rc::clone(context) }
    }

    /// Creates a scalar constant.
    pub fn scalar(context: &Rc<RefCell<GraphContext>>, value: f32) -> Self {
        let node_id = context
            .borrow_mut()
            .main_graph_mut()
            .add_node(None, NodeType::Literal(Value::ScalarF32(value)));
        Self { node_id, context: Rc::clone(context) }
    }

    /// Name of the node, if it has one.
    pub fn name(&self) -> Option<String> {
        let ctx = self.context.borrow();
        ctx.main_graph().get_node(self.node_id).ok().and_then(|n| n.name.clone())
    }

    fn push(&self, node_type: NodeType) -> Self {
        let node_id = self.context.borrow_mut().main_graph_mut().add_node(None, node_type);
        Self { node_id, context: Rc::clone(&self.context) }
    }

    fn constant(&self, value: f32) -> Self {
        Tensor::scalar(&self.context, value)
    }

    // --- Arithmetic ---

    pub fn pow(&self, power: &Tensor) -> Self {
        self.push(NodeType::Power(self.node_id, power.node_id))
    }

    /// `self ** exponent` with a constant exponent.
    pub fn powf(&self, exponent: f32) -> Self {
        let power = self.constant(exponent);
        self.pow(&power)
    }

    /// `self * factor` with a constant factor.
    pub fn scale(&self, factor: f32) -> Self {
        let factor = self.constant(factor);
        self * &factor
    }

    /// `self + offset` with a constant offset.
    pub fn shift(&self, offset: f32) -> Self {
        let offset = self.constant(offset);
        self + &offset
    }

    pub fn dot(&self, other: &Tensor) -> Self {
        self.push(NodeType::MatrixMultiply(self.node_id, other.node_id))
    }

    pub fn sqrt(&self) -> Self {
        self.push(NodeType::Sqrt(self.node_id))
    }

    pub fn log(&self) -> Self {
        self.push(NodeType::Log(self.node_id))
    }

    pub fn sign(&self) -> Self {
        self.push(NodeType::Sign(self.node_id))
    }

    // --- Comparisons (1.0 / 0.0 masks) ---

    pub fn equal(&self, other: &Tensor) -> Self {
        self.push(NodeType::Equal(self.node_id, other.node_id))
    }

    pub fn not_equal(&self, other: &Tensor) -> Self {
        self.push(NodeType::NotEqual(self.node_id, other.node_id))
    }

    // --- Activations ---

    pub fn relu(&self) -> Self {
        self.push(NodeType::ReLU(self.node_id))
    }

    pub fn sigmoid(&self) -> Self {
        self.push(NodeType::Sigmoid(self.node_id))
    }

    pub fn tanh(&self) -> Self {
        self.push(NodeType::Tanh(self.node_id))
    }

    pub fn softmax(&self) -> Self {
        self.push(NodeType::Softmax(self.node_id))
    }

    // --- Reductions ---

    pub fn sum(&self) -> Self {
        self.push(NodeType::Sum(self.node_id))
    }

    pub fn sum_axes(&self, axes: &[usize]) -> Self {
        self.push(NodeType::SumAxes { input: self.node_id, axes: axes.to_vec() })
    }

    pub fn mean_axes(&self, axes: &[usize]) -> Self {
        self.push(NodeType::MeanAxes { input: self.node_id, axes: axes.to_vec() })
    }

    pub fn argmax(&self, axis: usize) -> Self {
        self.push(NodeType::ArgMax { input: self.node_id, axis })
    }

    pub fn one_hot(&self, classes: usize) -> Self {
        self.push(NodeType::OneHot { input: self.node_id, classes })
    }

    // --- Transformations ---

    pub fn reshape(&self, shape: Shape) -> Self {
        self.push(NodeType::Reshape(self.node_id, shape))
    }

    // --- Convolution & pooling ---

    /// Causal convolution of `[N, C, L]` with filters `[F, C, K]`, giving `[N, F, L]`.
    pub fn causal_conv1d(&self, weight: &Tensor) -> Self {
        self.push(NodeType::CausalConv1d { input: self.node_id, weight: weight.node_id })
    }

    /// Non-overlapping pooling over the last axis, keeping the trailing partial window.
    pub fn pool1d(&self, width: usize, mode: PoolMode) -> Self {
        self.push(NodeType::Pool1d { input: self.node_id, width, mode })
    }
}

// Operators for `a + b` style graph building.

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $variant:ident) => {
        impl $trait<&Tensor> for &Tensor {
            type Output = Tensor;
            fn $method(self, rhs: &Tensor) -> Self::Output {
                self.push(NodeType::$variant(self.node_id, rhs.node_id))
            }
        }
    };
}

impl_binary_op!(Add, add, Add);
impl_binary_op!(Sub, sub, Subtract);
impl_binary_op!(Mul, mul, Multiply);
impl_binary_op!(Div, div, Divide);

impl Neg for &Tensor {
    type Output = Tensor;
    fn neg(self) -> Self::Output {
        self.push(NodeType::Negate(self.node_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operations_append_nodes() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let w = Tensor::new_parameter(&ctx, "w");
        let y = &x.dot(&w) + &w;
        let graph = ctx.borrow().main_graph().clone();
        assert_eq!(graph.nodes.len(), 4);
        assert_eq!(graph.inputs, vec![x.node_id]);
        assert_eq!(graph.get_node(y.node_id).unwrap().node_type, NodeType::Add(2, w.node_id));
    }

    #[test]
    fn test_names() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let w = Tensor::new_parameter(&ctx, "dense.weights");
        assert_eq!(w.name().as_deref(), Some("dense.weights"));
        assert_eq!(w.tanh().name(), None);
    }
}
