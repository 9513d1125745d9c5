//! Training-mode batch normalization.
//!
//! Normalizes with the statistics of the current batch and returns the
//! running mean/variance updates alongside the output. Scale and shift are
//! persistent scalars that are never trained.

use crate::nn::module::{Forward, Module, Shared, Update};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Small constant added to the variance.
pub const EPS: f32 = 1e-4;

/// Weight of the current batch in the running averages.
pub const DEFAULT_MOMENTUM: f32 = 0.1;

/// `y = gamma * (x - mean) / sqrt(var + eps) + beta` over a fixed set of axes.
pub struct BatchNorm {
    pub gamma: Shared,
    pub beta: Shared,
    pub running_mean: Shared,
    pub running_var: Shared,
    axes: Vec<usize>,
    /// Number of elements each statistic is taken over.
    reduced: usize,
    pub momentum: f32,
    pub name: String,
}

impl BatchNorm {
    /// Creates the normalization state for inputs of `input_shape`.
    ///
    /// Running statistics have the input shape with every axis of `axes`
    /// collapsed to 1, and start at zero.
    pub fn new(ctx: &Rc<RefCell<GraphContext>>, name: &str, input_shape: &[usize], axes: &[usize]) -> Self {
        let stats_shape: Vec<usize> = input_shape
            .iter()
            .enumerate()
            .map(|(i, &d)| if axes.contains(&i) { 1 } else { d })
            .collect();
        let reduced = axes.iter().filter_map(|&a| input_shape.get(a)).product();

        Self {
            gamma: Shared::scalar(ctx, &format!("{}.gamma", name), 1.0),
            beta: Shared::scalar(ctx, &format!("{}.beta", name), 0.0),
            running_mean: Shared::zeros(ctx, &format!("{}.running_mean", name), &stats_shape),
            running_var: Shared::zeros(ctx, &format!("{}.running_var", name), &stats_shape),
            axes: axes.to_vec(),
            reduced,
            momentum: DEFAULT_MOMENTUM,
            name: name.to_string(),
        }
    }

    /// Factor turning the biased batch variance into the unbiased estimate.
    fn variance_correction(&self) -> f32 {
        if self.reduced > 1 {
            self.reduced as f32 / (self.reduced - 1) as f32
        } else {
            1.0
        }
    }
}

impl Module for BatchNorm {
    fn forward(&self, x: &Tensor) -> Forward {
        let mean = x.mean_axes(&self.axes);
        let centered = x - &mean;
        let variance = (&centered * &centered).mean_axes(&self.axes);

        let std = variance.shift(EPS).sqrt();
        let normalized = &centered / &std;
        let output = &(&normalized * &self.gamma.tensor) + &self.beta.tensor;

        let keep = 1.0 - self.momentum;
        let new_mean = &self.running_mean.tensor.scale(keep) + &mean.scale(self.momentum);
        let new_var =
            &self.running_var.tensor.scale(keep) + &variance.scale(self.variance_correction() * self.momentum);

        Forward {
            output,
            updates: vec![Update::new(&self.running_mean, new_mean), Update::new(&self.running_var, new_var)],
        }
    }

    fn parameters(&self) -> Vec<&Shared> {
        Vec::new()
    }

    fn buffers(&self) -> Vec<&Shared> {
        vec![&self.gamma, &self.beta, &self.running_mean, &self.running_var]
    }
}

/// Passes the output of `forward` through `norm`, when there is one.
pub(crate) fn normalize_optional(forward: Forward, norm: Option<&BatchNorm>) -> Forward {
    match norm {
        Some(norm) => {
            let normalized = norm.forward(&forward.output);
            forward.then(normalized)
        }
        None => forward,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batchnorm_state_shapes() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let bn = BatchNorm::new(&ctx, "conv.norm", &[10, 4, 100], &[0, 1]);

        assert_eq!(bn.running_mean.shape(), &[1, 1, 100]);
        assert_eq!(bn.running_var.shape(), &[1, 1, 100]);
        assert!(bn.running_mean.initial.iter().all(|&v| v == 0.0));
        assert_eq!(bn.gamma.initial.first(), Some(&1.0));
        assert_eq!(bn.beta.initial.first(), Some(&0.0));
        assert!(bn.parameters().is_empty());
        assert_eq!(bn.buffers().len(), 4);
    }

    #[test]
    fn test_forward_updates_running_stats_in_order() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let bn = BatchNorm::new(&ctx, "dense.norm", &[10, 16], &[0, 1]);
        let x = Tensor::new_input(&ctx, "x");
        let out = bn.forward(&x);

        assert_eq!(out.updates.len(), 2);
        assert_eq!(out.updates[0].target.name().as_deref(), Some("dense.norm.running_mean"));
        assert_eq!(out.updates[1].target.name().as_deref(), Some("dense.norm.running_var"));
        assert!((bn.variance_correction() - 160.0 / 159.0).abs() < 1e-6);
    }
}
