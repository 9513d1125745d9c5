//! ASG: Abstract Semantic Graph.
//!
//! Every operation of the network is a `Node` in an `Asg`. Nodes only refer to
//! nodes created before them, so ascending `NodeId` order is always a valid
//! evaluation order.

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Node identifier.
pub type NodeId = usize;
/// Graph identifier.
pub type AsgId = usize;
/// Tensor shape.
pub type Shape = Vec<usize>;

pub type AsgResult<T> = std::result::Result<T, AsgError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AsgError {
    #[error("Node with ID {0} not found")]
    NodeNotFound(NodeId),
    #[error("Invalid shape at node {0}")]
    InvalidShape(NodeId),
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum DType {
    F32,
    Bool,
}

/// Reduction used by `NodeType::Pool1d`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    #[default]
    Max,
    /// Mean over the elements present in the window.
    Average,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: Option<String>,
    pub node_type: NodeType,
    pub shape: Option<Shape>,
    pub dtype: Option<DType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeType {
    // Data
    Input { name: String },
    /// Persistent state: weights, biases, velocities, running statistics.
    Parameter { name: String },
    Literal(Value),

    // Binary, with numpy-style broadcasting
    Add(NodeId, NodeId),
    Subtract(NodeId, NodeId),
    Multiply(NodeId, NodeId),
    Divide(NodeId, NodeId),
    /// Exponent is treated as a constant by autograd.
    Power(NodeId, NodeId),
    MatrixMultiply(NodeId, NodeId),
    GreaterThan(NodeId, NodeId),
    Equal(NodeId, NodeId),
    NotEqual(NodeId, NodeId),

    // Unary
    Negate(NodeId),
    Log(NodeId),
    Sqrt(NodeId),
    ReLU(NodeId),
    Sigmoid(NodeId),
    Tanh(NodeId),
    Sign(NodeId),
    /// Softmax over the last axis.
    Softmax(NodeId),

    // Reductions
    /// Sum of all elements, scalar output.
    Sum(NodeId),
    /// Sum over `axes`, reduced axes kept with size 1.
    SumAxes { input: NodeId, axes: Vec<usize> },
    /// Mean over `axes`, reduced axes kept with size 1.
    MeanAxes { input: NodeId, axes: Vec<usize> },
    /// Index of the maximum along `axis` (first wins on ties); the axis is dropped.
    ArgMax { input: NodeId, axis: usize },
    /// Integer-valued class indices to a trailing one-hot axis of size `classes`.
    OneHot { input: NodeId, classes: usize },

    // Transformations
    Reshape(NodeId, Shape),
    Transpose(NodeId, usize, usize),
    /// Broadcast the first operand to the shape of the second.
    Broadcast(NodeId, NodeId),
    /// Sum the first operand down to the shape of the second.
    ReduceSumTo(NodeId, NodeId),

    // Convolution: input [N, C, L], weight [F, C, K] -> [N, F, L]
    CausalConv1d { input: NodeId, weight: NodeId },
    /// Gradient of `CausalConv1d` w.r.t. its input.
    CausalConv1dBackwardInput { grad_output: NodeId, weight: NodeId },
    /// Gradient of `CausalConv1d` w.r.t. its weight.
    CausalConv1dBackwardWeight { grad_output: NodeId, input: NodeId, filter_length: usize },

    // Pooling over the last axis of [N, C, L], incomplete trailing window kept
    Pool1d { input: NodeId, width: usize, mode: PoolMode },
    /// Routes a pooled gradient back to the positions of `original_input`.
    Unpool1d { input: NodeId, original_input: NodeId, width: usize, mode: PoolMode },
}

impl NodeType {
    /// Operands of the node, in order.
    pub fn inputs(&self) -> Vec<NodeId> {
        match self {
            NodeType::Input { .. } | NodeType::Parameter { .. } | NodeType::Literal(_) => vec![],

            NodeType::Add(a, b)
            | NodeType::Subtract(a, b)
            | NodeType::Multiply(a, b)
            | NodeType::Divide(a, b)
            | NodeType::Power(a, b)
            | NodeType::MatrixMultiply(a, b)
            | NodeType::GreaterThan(a, b)
            | NodeType::Equal(a, b)
            | NodeType::NotEqual(a, b)
            | NodeType::Broadcast(a, b)
            | NodeType::ReduceSumTo(a, b) => vec![*a, *b],

            NodeType::Negate(a)
            | NodeType::Log(a)
            | NodeType::Sqrt(a)
            | NodeType::ReLU(a)
            | NodeType::Sigmoid(a)
            | NodeType::Tanh(a)
            | NodeType::Sign(a)
            | NodeType::Softmax(a)
            | NodeType::Sum(a)
            | NodeType::Reshape(a, _)
            | NodeType::Transpose(a, _, _) => vec![*a],

            NodeType::SumAxes { input, .. }
            | NodeType::MeanAxes { input, .. }
            | NodeType::ArgMax { input, .. }
            | NodeType::OneHot { input, .. }
            | NodeType::Pool1d { input, .. } => vec![*input],

            NodeType::CausalConv1d { input, weight } => vec![*input, *weight],
            NodeType::CausalConv1dBackwardInput { grad_output, weight } => vec![*grad_output, *weight],
            NodeType::CausalConv1dBackwardWeight { grad_output, input, .. } => vec![*grad_output, *input],
            NodeType::Unpool1d { input, original_input, .. } => vec![*input, *original_input],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Tensor(ArrayD<f32>),
    ScalarF32(f32),
}

impl Value {
    /// Borrow the tensor payload, if this is a tensor.
    pub fn as_tensor(&self) -> Option<&ArrayD<f32>> {
        match self {
            Value::Tensor(arr) => Some(arr),
            Value::ScalarF32(_) => None,
        }
    }

    /// Converts into a tensor; scalars become 0-dimensional arrays.
    pub fn into_tensor(self) -> ArrayD<f32> {
        match self {
            Value::Tensor(arr) => arr,
            Value::ScalarF32(v) => ndarray::arr0(v).into_dyn(),
        }
    }

    /// The single element of a scalar or one-element tensor.
    pub fn scalar(&self) -> Option<f32> {
        match self {
            Value::ScalarF32(v) => Some(*v),
            Value::Tensor(arr) if arr.len() == 1 => arr.iter().next().copied(),
            Value::Tensor(_) => None,
        }
    }

    pub fn shape(&self) -> Shape {
        match self {
            Value::Tensor(arr) => arr.shape().to_vec(),
            Value::ScalarF32(_) => vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asg {
    pub id: AsgId,
    pub nodes: HashMap<NodeId, Node>,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
}

impl Asg {
    pub fn new(id: AsgId) -> Self {
        Self { id, nodes: HashMap::new(), inputs: vec![], outputs: vec![] }
    }

    pub fn add_node(&mut self, name: Option<String>, node_type: NodeType) -> NodeId {
        let new_id = self.nodes.len();
        let mut node = Node { id: new_id, name, node_type, shape: None, dtype: None };

        // Literals carry their own shape so inference never misses them.
        match &node.node_type {
            NodeType::Literal(Value::Tensor(arr)) => {
                node.shape = Some(arr.shape().to_vec());
                node.dtype = Some(DType::F32);
            }
            NodeType::Literal(Value::ScalarF32(_)) => {
                node.shape = Some(vec![]);
                node.dtype = Some(DType::F32);
            }
            _ => {}
        }

        self.nodes.insert(new_id, node);
        new_id
    }

    pub fn set_outputs(&mut self, outputs: Vec<NodeId>) {
        self.outputs = outputs;
    }

    pub fn get_node(&self, id: NodeId) -> AsgResult<&Node> {
        self.nodes.get(&id).ok_or(AsgError::NodeNotFound(id))
    }

    pub fn get_node_mut(&mut self, id: NodeId) -> AsgResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(AsgError::NodeNotFound(id))
    }

    /// Inferred shape of a node, if shape inference has reached it.
    pub fn shape_of(&self, id: NodeId) -> AsgResult<Shape> {
        self.get_node(id)?.shape.clone().ok_or(AsgError::InvalidShape(id))
    }

    /// Looks up an `Input` or `Parameter` node by name.
    pub fn find_named(&self, wanted: &str) -> Option<NodeId> {
        self.nodes.values().find_map(|n| match &n.node_type {
            NodeType::Input { name } | NodeType::Parameter { name } if name == wanted => Some(n.id),
            _ => None,
        })
    }
}
