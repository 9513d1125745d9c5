//! Loss, prediction and error assembly for two-class sequence labels.
//!
//! Labels live in {-1, +1}. Probabilities come from the output stage as a
//! `(batch, 2)` tensor, class 0 standing for -1 and class 1 for +1. Every
//! function here only adds nodes to the graph.

use crate::nn::NUM_CLASSES;
use crate::tensor::Tensor;

// ============================================================================
// Prediction
// ============================================================================

/// Maps probabilities to labels: `sign(argmax(p, 1) - 0.5)`, giving -1 or +1.
pub fn prediction(probabilities: &Tensor) -> Tensor {
    probabilities.argmax(1).shift(-0.5).sign()
}

/// Class index used for the likelihood lookup: 1 where the label is +1, else 0.
pub fn class_index(labels: &Tensor) -> Tensor {
    let positive = Tensor::scalar(&labels.context, 1.0);
    labels.equal(&positive)
}

// ============================================================================
// Negative Log Likelihood
// ============================================================================

/// Floor applied to the true-class probability before the logarithm.
pub const MIN_PROBABILITY: f32 = f32::MIN_POSITIVE;

/// Summed negative log-likelihood of the true classes.
///
/// Formula: `NLL = -sum_n log max(p[n, class(n)], MIN_PROBABILITY)`.
///
/// The probability of the true class is picked with a one-hot mask before the
/// logarithm, so zero probabilities of other classes never reach `log`. A true
/// class whose probability underflowed to zero contributes about 87.3 to the
/// loss and no gradient.
pub fn negative_log_likelihood(probabilities: &Tensor, labels: &Tensor) -> Tensor {
    let one_hot = class_index(labels).one_hot(NUM_CLASSES);
    let picked = (probabilities * &one_hot).sum_axes(&[1]);
    let floored = picked.shift(-MIN_PROBABILITY).relu().shift(MIN_PROBABILITY);
    -&floored.log().sum()
}

// ============================================================================
// Regularization
// ============================================================================

/// `coefficient * sum_w ||w||^2` over the given weights.
pub fn l2_penalty(coefficient: f32, weights: &[&Tensor]) -> Option<Tensor> {
    let squared_norms = weights.iter().map(|w| (*w * *w).sum());
    let total = squared_norms.reduce(|acc, norm| &acc + &norm)?;
    Some(total.scale(coefficient))
}

/// Likelihood term plus the L2 penalty on `weights`.
pub fn regularized_loss(probabilities: &Tensor, labels: &Tensor, coefficient: f32, weights: &[&Tensor]) -> Tensor {
    let nll = negative_log_likelihood(probabilities, labels);
    match l2_penalty(coefficient, weights) {
        Some(penalty) => &nll + &penalty,
        None => nll,
    }
}

// ============================================================================
// Error
// ============================================================================

/// Number of examples whose prediction differs from the label.
pub fn error_count(prediction: &Tensor, labels: &Tensor) -> Tensor {
    prediction.not_equal(labels).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Session, StateStore};
    use crate::tensor::GraphContext;
    use approx::assert_relative_eq;
    use ndarray::{arr1, arr2, ArrayD};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    fn eval(ctx: &Rc<RefCell<GraphContext>>, out: &Tensor, feeds: &[(&str, ArrayD<f32>)]) -> ArrayD<f32> {
        let graph = ctx.borrow().main_graph().clone();
        let session = Session::new(graph, vec![out.node_id], vec![], StateStore::new());
        let feeds: HashMap<String, ArrayD<f32>> = feeds.iter().map(|(n, v)| (n.to_string(), v.clone())).collect();
        session.evaluate(&feeds).unwrap().remove(0).into_tensor()
    }

    #[test]
    fn test_prediction_from_probabilities() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let p = Tensor::new_input(&ctx, "p");
        let pred = prediction(&p);

        let probs = arr2(&[[0.2, 0.8], [0.9, 0.1]]).into_dyn();
        let out = eval(&ctx, &pred, &[("p", probs)]);
        assert_eq!(out, arr1(&[1.0, -1.0]).into_dyn());
    }

    #[test]
    fn test_nll_picks_true_class() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let p = Tensor::new_input(&ctx, "p");
        let y = Tensor::new_input(&ctx, "y");
        let nll = negative_log_likelihood(&p, &y);

        let probs = arr2(&[[0.25, 0.75], [1.0, 0.0]]).into_dyn();
        let labels = arr1(&[1.0, -1.0]).into_dyn();
        let out = eval(&ctx, &nll, &[("p", probs), ("y", labels)]);
        assert_relative_eq!(out.sum(), -(0.75f32.ln()), epsilon = 1e-6);
        assert!(out.sum() >= 0.0);
    }

    #[test]
    fn test_nll_of_zero_probability_is_finite() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let p = Tensor::new_input(&ctx, "p");
        let y = Tensor::new_input(&ctx, "y");
        let nll = negative_log_likelihood(&p, &y);

        let probs = arr2(&[[1.0, 0.0]]).into_dyn();
        let labels = arr1(&[1.0]).into_dyn();
        let out = eval(&ctx, &nll, &[("p", probs), ("y", labels)]);
        assert_relative_eq!(out.sum(), -MIN_PROBABILITY.ln(), max_relative = 1e-6);
    }

    #[test]
    fn test_penalty_and_error_count() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let a = Tensor::new_input(&ctx, "a");
        let b = Tensor::new_input(&ctx, "b");
        let penalty = l2_penalty(0.5, &[&a, &b]).unwrap();
        let errors = error_count(&a, &b);
        assert!(l2_penalty(0.5, &[]).is_none());

        let feeds = [("a", arr1(&[1.0, -1.0, 1.0]).into_dyn()), ("b", arr1(&[1.0, 1.0, -1.0]).into_dyn())];
        assert_relative_eq!(eval(&ctx, &penalty, &feeds).sum(), 3.0);
        assert_relative_eq!(eval(&ctx, &errors, &feeds).sum(), 2.0);
    }
}
