//! Finite-difference checks of the gradients the network relies on.

use causal_cnn::analysis::shape_inference::ShapeInference;
use causal_cnn::asg::{DType, PoolMode, Value};
use causal_cnn::autograd::grad;
use causal_cnn::losses::negative_log_likelihood;
use causal_cnn::nn::{BatchNorm, Module, Shared};
use causal_cnn::runtime::{Session, StateStore};
use causal_cnn::tensor::{GraphContext, Tensor};

use ndarray::{ArrayD, IxDyn};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

const EPSILON: f32 = 1e-3;
const RTOL: f32 = 2e-2;
const ATOL: f32 = 1e-3;

type Ctx = Rc<RefCell<GraphContext>>;

/// Builds a scalar from `x`, returning any extra state the graph reads.
type Builder = dyn Fn(&Ctx, &Tensor) -> (Tensor, Vec<Shared>);

fn assert_grads_are_close(analytic: &ArrayD<f32>, numeric: &ArrayD<f32>) {
    assert_eq!(analytic.shape(), numeric.shape(), "Gradient shapes do not match!");
    for (i, (a, n)) in analytic.iter().zip(numeric.iter()).enumerate() {
        let diff = (a - n).abs();
        let bound = ATOL + RTOL * a.abs().max(n.abs());
        assert!(diff <= bound, "Gradients differ at {}: analytic {:.6}, numeric {:.6}", i, a, n);
    }
}

fn session_for(ctx: &Ctx, outputs: Vec<usize>, x: &ArrayD<f32>, extra: &[Shared]) -> Session {
    let mut state: StateStore = extra.iter().map(|s| (s.name(), Value::Tensor(s.initial.clone()))).collect();
    state.insert("x".to_string(), Value::Tensor(x.clone()));
    Session::new(ctx.borrow().main_graph().clone(), outputs, vec![], state)
}

fn infer(ctx: &Ctx, x: &ArrayD<f32>, extra: &[Shared]) {
    let mut shapes: HashMap<_, _> = extra.iter().map(|s| (s.name(), (s.shape().to_vec(), DType::F32))).collect();
    shapes.insert("x".to_string(), (x.shape().to_vec(), DType::F32));
    ShapeInference::run(ctx.borrow_mut().main_graph_mut(), &shapes).unwrap();
}

fn analytic_grad(build: &Builder, x0: &ArrayD<f32>) -> ArrayD<f32> {
    let ctx: Ctx = Rc::new(RefCell::new(GraphContext::new()));
    let x = Tensor::new_parameter(&ctx, "x");
    let (y, extra) = build(&ctx, &x);
    infer(&ctx, x0, &extra);

    let grads = grad(&y, &[x]).unwrap();
    infer(&ctx, x0, &extra);

    let session = session_for(&ctx, vec![grads[0].node_id], x0, &extra);
    session.evaluate(&HashMap::new()).unwrap().remove(0).into_tensor()
}

fn forward(build: &Builder, x0: &ArrayD<f32>) -> f32 {
    let ctx: Ctx = Rc::new(RefCell::new(GraphContext::new()));
    let x = Tensor::new_parameter(&ctx, "x");
    let (y, extra) = build(&ctx, &x);
    let session = session_for(&ctx, vec![y.node_id], x0, &extra);
    session.evaluate(&HashMap::new()).unwrap()[0].scalar().unwrap()
}

fn numeric_grad(build: &Builder, x0: &ArrayD<f32>) -> ArrayD<f32> {
    let mut g = ArrayD::zeros(x0.raw_dim());
    for i in 0..x0.len() {
        let mut plus = x0.clone();
        plus.as_slice_mut().unwrap()[i] += EPSILON;
        let mut minus = x0.clone();
        minus.as_slice_mut().unwrap()[i] -= EPSILON;
        g.as_slice_mut().unwrap()[i] = (forward(build, &plus) - forward(build, &minus)) / (2.0 * EPSILON);
    }
    g
}

fn check(build: &Builder, x0: ArrayD<f32>) {
    assert_grads_are_close(&analytic_grad(build, &x0), &numeric_grad(build, &x0));
}

/// Deterministic, distinct values in [-1, 1].
fn sample(shape: &[usize], offset: f32) -> ArrayD<f32> {
    let n: usize = shape.iter().product();
    let data = (0..n).map(|i| ((i as f32 * 0.73 + offset).sin() * 0.9)).collect();
    ArrayD::from_shape_vec(IxDyn(shape), data).unwrap()
}

#[test]
fn test_causal_conv_input_gradient() {
    check(
        &|ctx, x| {
            let w = Tensor::new_literal(ctx, sample(&[2, 1, 3], 1.0), "w");
            let y = x.causal_conv1d(&w);
            ((&y * &y).sum(), vec![])
        },
        sample(&[2, 1, 6], 0.0),
    );
}

#[test]
fn test_causal_conv_weight_gradient() {
    check(
        &|ctx, w| {
            let input = Tensor::new_literal(ctx, sample(&[2, 1, 6], 0.3), "input");
            let y = input.causal_conv1d(w).tanh();
            (y.sum(), vec![])
        },
        sample(&[3, 1, 4], 2.0),
    );
}

#[test]
fn test_max_pool_gradient() {
    check(&|_, x| (x.pool1d(2, PoolMode::Max).powf(2.0).sum(), vec![]), sample(&[1, 2, 5], 0.5));
}

#[test]
fn test_average_pool_gradient() {
    check(&|_, x| (x.pool1d(3, PoolMode::Average).tanh().sum(), vec![]), sample(&[2, 1, 7], 0.1));
}

#[test]
fn test_batchnorm_gradient() {
    check(
        &|ctx, x| {
            let bn = BatchNorm::new(ctx, "bn", &[3, 4], &[0, 1]);
            let out = bn.forward(x).output;
            let weights = Tensor::new_literal(ctx, sample(&[3, 4], 4.0), "weights");
            let state = bn.buffers().into_iter().cloned().collect();
            ((&out * &weights).sum(), state)
        },
        sample(&[3, 4], 0.2),
    );
}

#[test]
fn test_dense_gradient() {
    check(
        &|ctx, w| {
            let input = Tensor::new_literal(ctx, sample(&[3, 4], 0.7), "input");
            let bias = Tensor::new_literal(ctx, sample(&[2], 1.5), "bias");
            let y = &input.dot(w) + &bias;
            (y.sigmoid().sum(), vec![])
        },
        sample(&[4, 2], 3.0),
    );
}

#[test]
fn test_softmax_nll_gradient() {
    check(
        &|ctx, logits| {
            let labels = Tensor::new_literal(ctx, ArrayD::from_shape_vec(IxDyn(&[3]), vec![1.0, -1.0, 1.0]).unwrap(), "y");
            (negative_log_likelihood(&logits.softmax(), &labels), vec![])
        },
        sample(&[3, 2], 0.9),
    );
}

#[test]
fn test_saturated_softmax_gradient_is_finite() {
    let x0 = ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![100.0, -100.0, 0.5, -0.5]).unwrap();
    let build: &Builder = &|ctx, logits| {
        let labels = Tensor::new_literal(ctx, ArrayD::from_shape_vec(IxDyn(&[2]), vec![1.0, 1.0]).unwrap(), "y");
        (negative_log_likelihood(&logits.softmax(), &labels), vec![])
    };
    assert!(forward(build, &x0).is_finite());

    let analytic = analytic_grad(build, &x0);
    assert!(analytic.iter().all(|g| g.is_finite()));
    // The saturated row contributes nothing; the other row keeps its gradient.
    assert_eq!(analytic[[0, 0]], 0.0);
    assert!(analytic[[1, 1]] < 0.0);
}

#[test]
fn test_flatten_gradient() {
    check(
        &|ctx, x| {
            let w = Tensor::new_literal(ctx, sample(&[6, 2], 0.4), "w");
            let flat = x.reshape(vec![2, 6]);
            (flat.dot(&w).tanh().sum(), vec![])
        },
        sample(&[2, 2, 3], 1.1),
    );
}
