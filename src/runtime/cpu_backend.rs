//! Backend executing the ASG on the CPU.
//!
//! Walks the graph in topological order and evaluates every node with
//! `ndarray`.

use super::backend::{Backend, Memo, RuntimeError};
use crate::analysis::shape_inference::broadcast_shapes;
use crate::asg::{Asg, AsgId, NodeId, NodeType, PoolMode, Value};
use ndarray::{Array3, ArrayD, Axis, Ix2, Ix3, IxDyn, Zip};
use std::collections::HashMap;

type OpResult = Result<ArrayD<f32>, RuntimeError>;

/// Execution context for one graph on the CPU.
struct ExecutionContext<'a> {
    asg: &'a Asg,
    /// Values already computed, keyed by (AsgId, NodeId).
    memo: Memo<Value>,
}

impl<'a> ExecutionContext<'a> {
    fn new(asg: &'a Asg, initial_memo: Memo<Value>) -> Self {
        Self { asg, memo: initial_memo }
    }

    fn operand(&mut self, node_id: NodeId) -> OpResult {
        Ok(self.evaluate_node(node_id)?.into_tensor())
    }

    /// Computes the value of a node, recursing into operands not yet cached.
    fn evaluate_node(&mut self, node_id: NodeId) -> Result<Value, RuntimeError> {
        let asg_id: AsgId = self.asg.id;
        if let Some(value) = self.memo.get(&(asg_id, node_id)) {
            return Ok(value.clone());
        }

        let node = self
            .asg
            .nodes
            .get(&node_id)
            .ok_or(RuntimeError::NodeNotFound(node_id, asg_id))?;

        let result = match &node.node_type {
            NodeType::Input { name } => {
                return Err(RuntimeError::MissingInput(name.clone(), node.id));
            }
            NodeType::Parameter { name } => {
                return Err(RuntimeError::MissingParameter(name.clone(), node.id));
            }
            NodeType::Literal(value) => Ok(value.clone().into_tensor()),

            NodeType::Add(l, r)
            | NodeType::Subtract(l, r)
            | NodeType::Multiply(l, r)
            | NodeType::Divide(l, r)
            | NodeType::Power(l, r)
            | NodeType::MatrixMultiply(l, r)
            | NodeType::GreaterThan(l, r)
            | NodeType::Equal(l, r)
            | NodeType::NotEqual(l, r)
            | NodeType::Broadcast(l, r)
            | NodeType::ReduceSumTo(l, r) => {
                let lhs = self.operand(*l)?;
                let rhs = self.operand(*r)?;
                match &node.node_type {
                    NodeType::Add(..) => op_binary(&lhs, &rhs, |a, b| a + b),
                    NodeType::Subtract(..) => op_binary(&lhs, &rhs, |a, b| a - b),
                    NodeType::Multiply(..) => op_binary(&lhs, &rhs, |a, b| a * b),
                    NodeType::Divide(..) => op_binary(&lhs, &rhs, |a, b| a / b),
                    NodeType::GreaterThan(..) => op_binary(&lhs, &rhs, |a, b| bool_to_f32(a > b)),
                    NodeType::Equal(..) => op_binary(&lhs, &rhs, |a, b| bool_to_f32(a == b)),
                    NodeType::NotEqual(..) => op_binary(&lhs, &rhs, |a, b| bool_to_f32(a != b)),
                    NodeType::Power(..) => op_power(lhs, &rhs),
                    NodeType::MatrixMultiply(..) => op_matmul(lhs, rhs),
                    NodeType::Broadcast(..) => op_broadcast(&lhs, rhs.shape()),
                    NodeType::ReduceSumTo(..) => op_reduce_sum_to(lhs, rhs.shape()),
                    _ => unreachable!(),
                }
            }

            NodeType::Negate(op)
            | NodeType::Log(op)
            | NodeType::Sqrt(op)
            | NodeType::ReLU(op)
            | NodeType::Sigmoid(op)
            | NodeType::Tanh(op)
            | NodeType::Sign(op)
            | NodeType::Softmax(op)
            | NodeType::Sum(op) => {
                let operand = self.operand(*op)?;
                match &node.node_type {
                    NodeType::Negate(_) => Ok(operand.mapv(|x| -x)),
                    NodeType::Log(_) => Ok(operand.mapv(f32::ln)),
                    NodeType::Sqrt(_) => Ok(operand.mapv(f32::sqrt)),
                    NodeType::ReLU(_) => Ok(operand.mapv(|x| x.max(0.0))),
                    NodeType::Sigmoid(_) => Ok(operand.mapv(|x| 1.0 / (1.0 + (-x).exp()))),
                    NodeType::Tanh(_) => Ok(operand.mapv(f32::tanh)),
                    NodeType::Sign(_) => Ok(operand.mapv(sign)),
                    NodeType::Softmax(_) => op_softmax(operand),
                    NodeType::Sum(_) => Ok(ndarray::arr0(operand.sum()).into_dyn()),
                    _ => unreachable!(),
                }
            }

            NodeType::SumAxes { input, axes } => {
                let operand = self.operand(*input)?;
                op_sum_axes(operand, axes)
            }
            NodeType::MeanAxes { input, axes } => {
                let operand = self.operand(*input)?;
                let n: usize = axes.iter().filter_map(|&a| operand.shape().get(a)).product();
                let summed = op_sum_axes(operand, axes)?;
                Ok(summed / n as f32)
            }
            NodeType::ArgMax { input, axis } => {
                let operand = self.operand(*input)?;
                op_argmax(&operand, *axis)
            }
            NodeType::OneHot { input, classes } => {
                let operand = self.operand(*input)?;
                op_one_hot(&operand, *classes)
            }

            NodeType::Reshape(op, shape) => {
                let operand = self.operand(*op)?;
                let reshaped = operand
                    .to_shape(shape.as_slice())
                    .map_err(|e| RuntimeError::ShapeError(e.to_string()))?;
                Ok(reshaped.to_owned())
            }
            NodeType::Transpose(op, ax1, ax2) => {
                let operand = self.operand(*op)?;
                op_transpose(operand, *ax1, *ax2)
            }

            NodeType::CausalConv1d { input, weight } => {
                let x = self.operand(*input)?;
                let w = self.operand(*weight)?;
                op_causal_conv1d(x, w)
            }
            NodeType::CausalConv1dBackwardInput { grad_output, weight } => {
                let g = self.operand(*grad_output)?;
                let w = self.operand(*weight)?;
                op_causal_conv1d_backward_input(g, w)
            }
            NodeType::CausalConv1dBackwardWeight { grad_output, input, filter_length } => {
                let g = self.operand(*grad_output)?;
                let x = self.operand(*input)?;
                op_causal_conv1d_backward_weight(g, x, *filter_length)
            }

            NodeType::Pool1d { input, width, mode } => {
                let x = self.operand(*input)?;
                op_pool1d(x, *width, *mode)
            }
            NodeType::Unpool1d { input, original_input, width, mode } => {
                let g = self.operand(*input)?;
                let x = self.operand(*original_input)?;
                op_unpool1d(g, x, *width, *mode)
            }
        }?;

        let value = Value::Tensor(result);
        self.memo.insert((asg_id, node_id), value.clone());
        Ok(value)
    }
}

pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuBackend {
    type DeviceData = Value;

    fn load_data(
        &self,
        data: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Self::DeviceData>, RuntimeError> {
        Ok(data.clone())
    }

    fn run(
        &self,
        main_asg: &Asg,
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<(Vec<Self::DeviceData>, Memo<Self::DeviceData>), RuntimeError> {
        let sorted_nodes = crate::analysis::shape_inference::ShapeInference::topological_sort_from(
            main_asg,
            &main_asg.outputs,
        )
        .map_err(|e| RuntimeError::ShapeError(format!("Topological sort failed: {}", e)))?;

        let mut context = ExecutionContext::new(main_asg, initial_memo);
        for node_id in sorted_nodes {
            context.evaluate_node(node_id)?;
        }

        let mut results = Vec::with_capacity(main_asg.outputs.len());
        for output_node_id in &main_asg.outputs {
            let result = context
                .memo
                .get(&(main_asg.id, *output_node_id))
                .ok_or(RuntimeError::NodeNotFound(*output_node_id, main_asg.id))?
                .clone();
            results.push(result);
        }
        Ok((results, context.memo))
    }

    fn retrieve_data(&self, device_data: &[Self::DeviceData]) -> Result<Vec<Value>, RuntimeError> {
        Ok(device_data.to_vec())
    }
}

fn bool_to_f32(b: bool) -> f32 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn sign(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn shape_error(what: &str, a: &[usize], b: &[usize]) -> RuntimeError {
    RuntimeError::ShapeError(format!("{}: {:?} and {:?}", what, a, b))
}

fn op_binary(a: &ArrayD<f32>, b: &ArrayD<f32>, f: impl Fn(f32, f32) -> f32) -> OpResult {
    let shape = broadcast_shapes(a.shape(), b.shape()).map_err(|_| shape_error("Cannot broadcast", a.shape(), b.shape()))?;
    let av = a.broadcast(shape.as_slice()).ok_or_else(|| shape_error("Cannot broadcast", a.shape(), &shape))?;
    let bv = b.broadcast(shape.as_slice()).ok_or_else(|| shape_error("Cannot broadcast", b.shape(), &shape))?;
    Ok(Zip::from(&av).and(&bv).map_collect(|&x, &y| f(x, y)))
}

fn op_power(base: ArrayD<f32>, exponent: &ArrayD<f32>) -> OpResult {
    if exponent.len() != 1 {
        return Err(RuntimeError::TypeError {
            expected: "scalar exponent".to_string(),
            actual: format!("tensor of shape {:?}", exponent.shape()),
        });
    }
    let e = exponent.iter().next().copied().unwrap_or(1.0);
    Ok(base.mapv(|v| v.powf(e)))
}

fn op_matmul(lhs: ArrayD<f32>, rhs: ArrayD<f32>) -> OpResult {
    let a = lhs
        .into_dimensionality::<Ix2>()
        .map_err(|e| RuntimeError::ShapeError(format!("MatrixMultiply lhs: {}", e)))?;
    let b = rhs
        .into_dimensionality::<Ix2>()
        .map_err(|e| RuntimeError::ShapeError(format!("MatrixMultiply rhs: {}", e)))?;
    if a.ncols() != b.nrows() {
        return Err(shape_error("Incompatible matmul shapes", a.shape(), b.shape()));
    }
    Ok(a.dot(&b).into_dyn())
}

fn op_broadcast(source: &ArrayD<f32>, target_shape: &[usize]) -> OpResult {
    let view = source
        .broadcast(target_shape)
        .ok_or_else(|| shape_error("Cannot broadcast", source.shape(), target_shape))?;
    Ok(view.to_owned())
}

fn op_reduce_sum_to(source: ArrayD<f32>, target_shape: &[usize]) -> OpResult {
    let original = source.shape().to_vec();
    let mut reduced = source;
    while reduced.ndim() > target_shape.len() {
        reduced = reduced.sum_axis(Axis(0));
    }
    for (axis, &dim) in target_shape.iter().enumerate() {
        if dim == 1 && reduced.shape()[axis] != 1 {
            reduced = reduced.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    if reduced.shape() != target_shape {
        return Err(shape_error("Cannot reduce", &original, target_shape));
    }
    Ok(reduced)
}

fn op_sum_axes(operand: ArrayD<f32>, axes: &[usize]) -> OpResult {
    let mut sorted = axes.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    let mut result = operand;
    for &axis in sorted.iter().rev() {
        if axis >= result.ndim() {
            return Err(RuntimeError::ShapeError(format!("axis {} out of range for {:?}", axis, result.shape())));
        }
        result = result.sum_axis(Axis(axis)).insert_axis(Axis(axis));
    }
    Ok(result)
}

fn op_softmax(operand: ArrayD<f32>) -> OpResult {
    if operand.ndim() == 0 {
        return Err(RuntimeError::ShapeError("softmax of a scalar".to_string()));
    }
    let mut result = operand;
    let last_axis = Axis(result.ndim() - 1);
    for mut row in result.lanes_mut(last_axis) {
        let max_val = row.iter().fold(f32::NEG_INFINITY, |max, &val| max.max(val));
        row.mapv_inplace(|x| (x - max_val).exp());
        let sum = row.sum();
        row.mapv_inplace(|x| x / sum);
    }
    Ok(result)
}

fn op_argmax(operand: &ArrayD<f32>, axis: usize) -> OpResult {
    if axis >= operand.ndim() {
        return Err(RuntimeError::ShapeError(format!("argmax axis {} out of range for {:?}", axis, operand.shape())));
    }
    Ok(operand.map_axis(Axis(axis), |lane| {
        let mut best = 0;
        for (i, &v) in lane.iter().enumerate() {
            if v > lane[best] {
                best = i;
            }
        }
        best as f32
    }))
}

fn op_one_hot(indices: &ArrayD<f32>, classes: usize) -> OpResult {
    let mut shape = indices.shape().to_vec();
    shape.push(classes);
    let mut out = ArrayD::<f32>::zeros(IxDyn(&shape));
    for (lane, &idx) in out.lanes_mut(Axis(shape.len() - 1)).into_iter().zip(indices.iter()) {
        if idx < 0.0 || idx.fract() != 0.0 || idx as usize >= classes {
            return Err(RuntimeError::ComputationError(format!(
                "class index {} is not in 0..{}",
                idx, classes
            )));
        }
        let mut lane = lane;
        lane[idx as usize] = 1.0;
    }
    Ok(out)
}

fn op_transpose(operand: ArrayD<f32>, axis1: usize, axis2: usize) -> OpResult {
    if axis1 >= operand.ndim() || axis2 >= operand.ndim() {
        return Err(RuntimeError::ShapeError(format!(
            "cannot swap axes {} and {} of {:?}",
            axis1,
            axis2,
            operand.shape()
        )));
    }
    let mut axes: Vec<usize> = (0..operand.ndim()).collect();
    axes.swap(axis1, axis2);
    Ok(operand.permuted_axes(axes).as_standard_layout().into_owned())
}

fn to_array3(value: ArrayD<f32>, what: &str) -> Result<Array3<f32>, RuntimeError> {
    value
        .into_dimensionality::<Ix3>()
        .map_err(|e| RuntimeError::ShapeError(format!("{}: {}", what, e)))
}

/// `y[n, f, t] = sum_c sum_k w[f, c, k] * x[n, c, t - k]`, with `x` zero before 0.
fn op_causal_conv1d(input: ArrayD<f32>, weight: ArrayD<f32>) -> OpResult {
    let x = to_array3(input, "CausalConv1d input")?;
    let w = to_array3(weight, "CausalConv1d weight")?;
    let (n, c, l) = x.dim();
    let (f, wc, k) = w.dim();
    if wc != c {
        return Err(shape_error("CausalConv1d channels", x.shape(), w.shape()));
    }

    let mut y = Array3::<f32>::zeros((n, f, l));
    for ni in 0..n {
        for fi in 0..f {
            for t in 0..l {
                let mut acc = 0.0;
                for ci in 0..c {
                    for ki in 0..k.min(t + 1) {
                        acc += w[[fi, ci, ki]] * x[[ni, ci, t - ki]];
                    }
                }
                y[[ni, fi, t]] = acc;
            }
        }
    }
    Ok(y.into_dyn())
}

/// `dx[n, c, s] = sum_f sum_k g[n, f, s + k] * w[f, c, k]`.
fn op_causal_conv1d_backward_input(grad_output: ArrayD<f32>, weight: ArrayD<f32>) -> OpResult {
    let g = to_array3(grad_output, "CausalConv1d grad")?;
    let w = to_array3(weight, "CausalConv1d weight")?;
    let (n, f, l) = g.dim();
    let (wf, c, k) = w.dim();
    if wf != f {
        return Err(shape_error("CausalConv1d filters", g.shape(), w.shape()));
    }

    let mut dx = Array3::<f32>::zeros((n, c, l));
    for ni in 0..n {
        for ci in 0..c {
            for s in 0..l {
                let mut acc = 0.0;
                for fi in 0..f {
                    for ki in 0..k.min(l - s) {
                        acc += g[[ni, fi, s + ki]] * w[[fi, ci, ki]];
                    }
                }
                dx[[ni, ci, s]] = acc;
            }
        }
    }
    Ok(dx.into_dyn())
}

/// `dw[f, c, k] = sum_n sum_t g[n, f, t] * x[n, c, t - k]`.
fn op_causal_conv1d_backward_weight(grad_output: ArrayD<f32>, input: ArrayD<f32>, filter_length: usize) -> OpResult {
    let g = to_array3(grad_output, "CausalConv1d grad")?;
    let x = to_array3(input, "CausalConv1d input")?;
    let (n, f, l) = g.dim();
    let (xn, c, xl) = x.dim();
    if xn != n || xl != l {
        return Err(shape_error("CausalConv1d grad/input", g.shape(), x.shape()));
    }

    let mut dw = Array3::<f32>::zeros((f, c, filter_length));
    for fi in 0..f {
        for ci in 0..c {
            for ki in 0..filter_length {
                let mut acc = 0.0;
                for ni in 0..n {
                    for t in ki..l {
                        acc += g[[ni, fi, t]] * x[[ni, ci, t - ki]];
                    }
                }
                dw[[fi, ci, ki]] = acc;
            }
        }
    }
    Ok(dw.into_dyn())
}

fn op_pool1d(input: ArrayD<f32>, width: usize, mode: PoolMode) -> OpResult {
    if width == 0 {
        return Err(RuntimeError::ShapeError("pool width must be positive".to_string()));
    }
    let x = to_array3(input, "Pool1d input")?;
    let (n, c, l) = x.dim();
    let pooled = l.div_ceil(width);

    let mut y = Array3::<f32>::zeros((n, c, pooled));
    for ni in 0..n {
        for ci in 0..c {
            for j in 0..pooled {
                let start = j * width;
                let end = (start + width).min(l);
                let window = x.slice(ndarray::s![ni, ci, start..end]);
                y[[ni, ci, j]] = match mode {
                    PoolMode::Max => window.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v)),
                    PoolMode::Average => window.sum() / (end - start) as f32,
                };
            }
        }
    }
    Ok(y.into_dyn())
}

fn op_unpool1d(grad: ArrayD<f32>, original_input: ArrayD<f32>, width: usize, mode: PoolMode) -> OpResult {
    let g = to_array3(grad, "Unpool1d grad")?;
    let x = to_array3(original_input, "Unpool1d input")?;
    let (n, c, l) = x.dim();
    let pooled = l.div_ceil(width.max(1));
    if g.dim() != (n, c, pooled) {
        return Err(shape_error("Unpool1d grad/input", g.shape(), x.shape()));
    }

    let mut dx = Array3::<f32>::zeros((n, c, l));
    for ni in 0..n {
        for ci in 0..c {
            for j in 0..pooled {
                let start = j * width;
                let end = (start + width).min(l);
                match mode {
                    PoolMode::Max => {
                        // The first maximum of the window receives the gradient.
                        let mut best = start;
                        for t in start..end {
                            if x[[ni, ci, t]] > x[[ni, ci, best]] {
                                best = t;
                            }
                        }
                        dx[[ni, ci, best]] += g[[ni, ci, j]];
                    }
                    PoolMode::Average => {
                        let share = g[[ni, ci, j]] / (end - start) as f32;
                        for t in start..end {
                            dx[[ni, ci, t]] += share;
                        }
                    }
                }
            }
        }
    }
    Ok(dx.into_dyn())
}
