//! Module for shape and data type inference (Shape Inference).
//!
//! Traverses the computation graph and determines the shape and data type of
//! the output tensor for each node based on its input shapes and operation
//! type. This is where a malformed network is rejected, before anything runs.

use crate::asg::{Asg, AsgError, DType, Node, NodeId, NodeType, Shape, Value};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeInferenceError {
    #[error("Graph error: {0}")]
    AsgError(#[from] AsgError),

    #[error("Incompatible shapes for operation '{op}': left operand {shape1:?}, right operand {shape2:?}. \
             Ensure dimensions are compatible for broadcasting or matrix multiplication.")]
    IncompatibleShapes {
        op: String,
        shape1: Shape,
        shape2: Shape,
    },

    #[error("Shape information missing for node {0}. \
             This may mean the node has not been processed by shape inference yet.")]
    MissingShapeInfo(NodeId),

    #[error("Initial shape not specified for '{0}'. \
             Add the shape to the initial_shapes HashMap when calling ShapeInference::run().")]
    MissingInitialShape(String),

    #[error("Invalid tensor rank for node {node_id}: expected {expected}D, got {actual}D.")]
    InvalidRank {
        node_id: NodeId,
        expected: usize,
        actual: usize,
    },

    #[error("Axis {axis} out of range for node {node_id} of rank {rank}.")]
    AxisOutOfRange {
        node_id: NodeId,
        axis: usize,
        rank: usize,
    },

    #[error("Cannot reshape {from:?} into {to:?}: element counts differ.")]
    ReshapeSizeMismatch { from: Shape, to: Shape },

    #[error("Invalid window of width {width} for node {node_id}.")]
    InvalidWindow { node_id: NodeId, width: usize },

    #[error("Broadcast error: cannot broadcast shapes {0:?} and {1:?} to a common shape.")]
    BroadcastError(Shape, Shape),
}

type Result<T> = std::result::Result<T, ShapeInferenceError>;

/// Structure that performs shape inference for ASG.
pub struct ShapeInference;

impl ShapeInference {
    /// Runs shape inference over every node reachable from the graph outputs,
    /// or over the whole graph when no outputs are set.
    ///
    /// Modifies the graph in-place, filling in `shape` and `dtype`.
    ///
    /// # Arguments
    /// * `asg` - Graph to analyze.
    /// * `initial_shapes` - Shapes and types of all `Input` and `Parameter`
    ///   nodes, keyed by node name.
    pub fn run(asg: &mut Asg, initial_shapes: &HashMap<String, (Shape, DType)>) -> Result<()> {
        let sorted_nodes = Self::topological_sort(asg)?;

        for node_id in sorted_nodes {
            let node = asg.get_node(node_id)?;
            let (shape, dtype) = Self::infer_node_shape(asg, node, initial_shapes)?;

            let node = asg.get_node_mut(node_id)?;
            node.shape = Some(shape);
            node.dtype = Some(dtype);
        }

        Ok(())
    }

    fn infer_node_shape(
        asg: &Asg,
        node: &Node,
        initial_shapes: &HashMap<String, (Shape, DType)>,
    ) -> Result<(Shape, DType)> {
        match &node.node_type {
            NodeType::Input { name } | NodeType::Parameter { name } => initial_shapes
                .get(name)
                .cloned()
                .ok_or_else(|| ShapeInferenceError::MissingInitialShape(name.clone())),

            NodeType::Literal(value) => match value {
                Value::Tensor(arr) => Ok((arr.shape().to_vec(), DType::F32)),
                Value::ScalarF32(_) => Ok((vec![], DType::F32)),
            },

            NodeType::Add(l, r)
            | NodeType::Subtract(l, r)
            | NodeType::Multiply(l, r)
            | NodeType::Divide(l, r) => {
                let (ls, ld) = Self::get_shape_dtype(asg, *l)?;
                let (rs, _) = Self::get_shape_dtype(asg, *r)?;
                Ok((broadcast_shapes(&ls, &rs)?, ld))
            }

            NodeType::GreaterThan(l, r) | NodeType::Equal(l, r) | NodeType::NotEqual(l, r) => {
                let (ls, _) = Self::get_shape_dtype(asg, *l)?;
                let (rs, _) = Self::get_shape_dtype(asg, *r)?;
                // Masks are stored as 0.0 / 1.0.
                Ok((broadcast_shapes(&ls, &rs)?, DType::Bool))
            }

            NodeType::Power(base, exponent) => {
                let (es, _) = Self::get_shape_dtype(asg, *exponent)?;
                if es.iter().product::<usize>() != 1 {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: 0,
                        actual: es.len(),
                    });
                }
                Self::get_shape_dtype(asg, *base)
            }

            NodeType::MatrixMultiply(l, r) => {
                let (ls, ld) = Self::get_shape_dtype(asg, *l)?;
                let (rs, _) = Self::get_shape_dtype(asg, *r)?;

                if ls.len() != 2 || rs.len() != 2 {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: 2,
                        actual: if ls.len() != 2 { ls.len() } else { rs.len() },
                    });
                }
                if ls[1] != rs[0] {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "MatrixMultiply".to_string(),
                        shape1: ls,
                        shape2: rs,
                    });
                }
                Ok((vec![ls[0], rs[1]], ld))
            }

            // Element-wise operations - shape unchanged
            NodeType::Negate(id)
            | NodeType::Log(id)
            | NodeType::Sqrt(id)
            | NodeType::ReLU(id)
            | NodeType::Sigmoid(id)
            | NodeType::Tanh(id)
            | NodeType::Sign(id) => Self::get_shape_dtype(asg, *id),

            NodeType::Softmax(id) => {
                let (shape, dtype) = Self::get_shape_dtype(asg, *id)?;
                if shape.is_empty() {
                    return Err(ShapeInferenceError::InvalidRank { node_id: node.id, expected: 1, actual: 0 });
                }
                Ok((shape, dtype))
            }

            NodeType::Sum(_) => Ok((vec![], DType::F32)),

            NodeType::SumAxes { input, axes } | NodeType::MeanAxes { input, axes } => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *input)?;
                for &axis in axes {
                    if axis >= shape.len() {
                        return Err(ShapeInferenceError::AxisOutOfRange { node_id: node.id, axis, rank: shape.len() });
                    }
                    // Keep the axis with size 1 so the result broadcasts back.
                    shape[axis] = 1;
                }
                Ok((shape, dtype))
            }

            NodeType::ArgMax { input, axis } => {
                let (mut shape, _) = Self::get_shape_dtype(asg, *input)?;
                if *axis >= shape.len() {
                    return Err(ShapeInferenceError::AxisOutOfRange { node_id: node.id, axis: *axis, rank: shape.len() });
                }
                shape.remove(*axis);
                Ok((shape, DType::F32))
            }

            NodeType::OneHot { input, classes } => {
                let (mut shape, _) = Self::get_shape_dtype(asg, *input)?;
                shape.push(*classes);
                Ok((shape, DType::F32))
            }

            NodeType::Reshape(id, new_shape) => {
                let (shape, dtype) = Self::get_shape_dtype(asg, *id)?;
                if shape.iter().product::<usize>() != new_shape.iter().product::<usize>() {
                    return Err(ShapeInferenceError::ReshapeSizeMismatch { from: shape, to: new_shape.clone() });
                }
                Ok((new_shape.clone(), dtype))
            }

            NodeType::Transpose(id, axis1, axis2) => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *id)?;
                if *axis1 >= shape.len() || *axis2 >= shape.len() {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: axis1.max(axis2) + 1,
                        actual: shape.len(),
                    });
                }
                shape.swap(*axis1, *axis2);
                Ok((shape, dtype))
            }

            NodeType::Broadcast(source_id, target_id) => {
                let (source_shape, dtype) = Self::get_shape_dtype(asg, *source_id)?;
                let (target_shape, _) = Self::get_shape_dtype(asg, *target_id)?;
                if broadcast_shapes(&source_shape, &target_shape)? != target_shape {
                    return Err(ShapeInferenceError::BroadcastError(source_shape, target_shape));
                }
                Ok((target_shape, dtype))
            }

            NodeType::ReduceSumTo(source_id, target_id) => {
                let (source_shape, dtype) = Self::get_shape_dtype(asg, *source_id)?;
                let (target_shape, _) = Self::get_shape_dtype(asg, *target_id)?;
                if broadcast_shapes(&source_shape, &target_shape)? != source_shape {
                    return Err(ShapeInferenceError::BroadcastError(source_shape, target_shape));
                }
                Ok((target_shape, dtype))
            }

            // CausalConv1d: [N, C, L] * [F, C, K] -> [N, F, L]
            NodeType::CausalConv1d { input, weight } => {
                let (input_shape, dtype) = Self::get_shape_dtype(asg, *input)?;
                let (weight_shape, _) = Self::get_shape_dtype(asg, *weight)?;
                Self::check_rank(node.id, &input_shape, 3)?;
                Self::check_rank(node.id, &weight_shape, 3)?;
                if input_shape[1] != weight_shape[1] {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "CausalConv1d".to_string(),
                        shape1: input_shape,
                        shape2: weight_shape,
                    });
                }
                Ok((vec![input_shape[0], weight_shape[0], input_shape[2]], dtype))
            }

            // Gradient w.r.t. input: [N, F, L] * [F, C, K] -> [N, C, L]
            NodeType::CausalConv1dBackwardInput { grad_output, weight } => {
                let (grad_shape, dtype) = Self::get_shape_dtype(asg, *grad_output)?;
                let (weight_shape, _) = Self::get_shape_dtype(asg, *weight)?;
                Self::check_rank(node.id, &grad_shape, 3)?;
                Self::check_rank(node.id, &weight_shape, 3)?;
                Ok((vec![grad_shape[0], weight_shape[1], grad_shape[2]], dtype))
            }

            // Gradient w.r.t. weight: [N, F, L] and [N, C, L] -> [F, C, K]
            NodeType::CausalConv1dBackwardWeight { grad_output, input, filter_length } => {
                let (grad_shape, dtype) = Self::get_shape_dtype(asg, *grad_output)?;
                let (input_shape, _) = Self::get_shape_dtype(asg, *input)?;
                Self::check_rank(node.id, &grad_shape, 3)?;
                Self::check_rank(node.id, &input_shape, 3)?;
                Ok((vec![grad_shape[1], input_shape[1], *filter_length], dtype))
            }

            // Pool1d: [N, C, L] -> [N, C, ceil(L / width)]
            NodeType::Pool1d { input, width, .. } => {
                let (input_shape, dtype) = Self::get_shape_dtype(asg, *input)?;
                Self::check_rank(node.id, &input_shape, 3)?;
                if *width == 0 {
                    return Err(ShapeInferenceError::InvalidWindow { node_id: node.id, width: *width });
                }
                let pooled = input_shape[2].div_ceil(*width);
                Ok((vec![input_shape[0], input_shape[1], pooled], dtype))
            }

            // Unpooling output shape always matches the original pooling input shape.
            NodeType::Unpool1d { original_input, .. } => Self::get_shape_dtype(asg, *original_input),
        }
    }

    fn check_rank(node_id: NodeId, shape: &Shape, expected: usize) -> Result<()> {
        if shape.len() != expected {
            return Err(ShapeInferenceError::InvalidRank { node_id, expected, actual: shape.len() });
        }
        Ok(())
    }

    /// Helper function to get already computed shape and type for a node.
    fn get_shape_dtype(asg: &Asg, node_id: NodeId) -> Result<(Shape, DType)> {
        let node = asg.get_node(node_id)?;
        match (&node.shape, &node.dtype) {
            (Some(s), Some(d)) => Ok((s.clone(), *d)),
            _ => Err(ShapeInferenceError::MissingShapeInfo(node_id)),
        }
    }

    /// Performs topological sort of the graph.
    ///
    /// Starts from the graph outputs; with no outputs set, every node is a root.
    pub fn topological_sort(asg: &Asg) -> Result<Vec<NodeId>> {
        let roots: Vec<NodeId> = if asg.outputs.is_empty() {
            let mut all: Vec<NodeId> = asg.nodes.keys().copied().collect();
            all.sort_unstable();
            all
        } else {
            asg.outputs.clone()
        };
        Self::topological_sort_from(asg, &roots)
    }

    /// Topological order of every node `roots` depend on, roots included.
    pub fn topological_sort_from(asg: &Asg, roots: &[NodeId]) -> Result<Vec<NodeId>> {
        let mut sorted = Vec::new();
        let mut visited = HashSet::new();
        for &root in roots {
            Self::build_sorted_graph(root, asg, &mut visited, &mut sorted)?;
        }
        Ok(sorted)
    }

    fn build_sorted_graph(
        node_id: NodeId,
        asg: &Asg,
        visited: &mut HashSet<NodeId>,
        sorted: &mut Vec<NodeId>,
    ) -> Result<()> {
        if visited.contains(&node_id) {
            return Ok(());
        }

        let node = asg.get_node(node_id)?;
        for input_id in node.node_type.inputs() {
            Self::build_sorted_graph(input_id, asg, visited, sorted)?;
        }

        visited.insert(node_id);
        sorted.push(node_id);
        Ok(())
    }
}

/// Numpy-style broadcast of two shapes.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Result<Shape> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return Err(ShapeInferenceError::BroadcastError(a.to_vec(), b.to_vec())),
        };
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{GraphContext, Tensor};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn shapes(entries: &[(&str, Shape)]) -> HashMap<String, (Shape, DType)> {
        entries.iter().map(|(n, s)| (n.to_string(), (s.clone(), DType::F32))).collect()
    }

    #[test]
    fn test_broadcast_shapes() {
        assert_eq!(broadcast_shapes(&[10, 16], &[16]).unwrap(), vec![10, 16]);
        assert_eq!(broadcast_shapes(&[10, 3, 8], &[1, 3, 1]).unwrap(), vec![10, 3, 8]);
        assert_eq!(broadcast_shapes(&[], &[4, 2]).unwrap(), vec![4, 2]);
        assert!(broadcast_shapes(&[3], &[4]).is_err());
    }

    #[test]
    fn test_conv_pool_shapes() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let w = Tensor::new_parameter(&ctx, "w");
        let pooled = x.causal_conv1d(&w).pool1d(2, crate::asg::PoolMode::Max);

        let mut graph = ctx.borrow().main_graph().clone();
        ShapeInference::run(&mut graph, &shapes(&[("x", vec![4, 1, 7]), ("w", vec![3, 1, 5])])).unwrap();
        assert_eq!(graph.shape_of(pooled.node_id).unwrap(), vec![4, 3, 4]);
    }

    #[test]
    fn test_matmul_mismatch_is_rejected() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let w = Tensor::new_parameter(&ctx, "w");
        let _ = x.dot(&w);

        let mut graph = ctx.borrow().main_graph().clone();
        let err = ShapeInference::run(&mut graph, &shapes(&[("x", vec![2, 8]), ("w", vec![6, 4])])).unwrap_err();
        assert!(matches!(err, ShapeInferenceError::IncompatibleShapes { .. }));
    }

    #[test]
    fn test_missing_initial_shape() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let _ = x.tanh();

        let mut graph = ctx.borrow().main_graph().clone();
        let err = ShapeInference::run(&mut graph, &HashMap::new()).unwrap_err();
        assert_eq!(err, ShapeInferenceError::MissingInitialShape("x".to_string()));
    }

    #[test]
    fn test_reductions_keep_axes() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let m = x.mean_axes(&[0, 1]);
        let a = x.argmax(1);

        let mut graph = ctx.borrow().main_graph().clone();
        ShapeInference::run(&mut graph, &shapes(&[("x", vec![5, 2, 9])])).unwrap();
        assert_eq!(graph.shape_of(m.node_id).unwrap(), vec![1, 1, 9]);
        assert_eq!(graph.shape_of(a.node_id).unwrap(), vec![5, 9]);
    }
}
