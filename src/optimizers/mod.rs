//! Update rules turning gradients into state updates.
//!
//! An optimizer does not touch numbers. It appends the nodes computing the
//! new parameter values to the graph and returns them as `Update` pairs,
//! together with any per-parameter state it needs (velocities).

use crate::nn::{Shared, Update};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Output of an optimizer: its own persistent state plus the ordered updates.
#[derive(Debug, Default)]
pub struct OptimizerStep {
    /// Extra persistent tensors, one per parameter.
    pub slots: Vec<Shared>,
    pub updates: Vec<Update>,
}

/// Common interface of the update rules.
pub trait Optimizer {
    /// Builds the updates of `parameters` given their `gradients` (same order).
    fn build(&self, ctx: &Rc<RefCell<GraphContext>>, parameters: &[&Shared], gradients: &[Tensor]) -> OptimizerStep;
}

/// Gradient descent with momentum.
///
/// `v <- momentum * v - learning_rate * g`, then `p <- p + v` with the new `v`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MomentumSgd {
    pub learning_rate: f32,
    pub momentum: f32,
}

impl MomentumSgd {
    pub fn new(learning_rate: f32, momentum: f32) -> Self {
        Self { learning_rate, momentum }
    }
}

impl Optimizer for MomentumSgd {
    /// For each parameter in order: `(velocity, new_velocity)` then
    /// `(parameter, parameter + new_velocity)`.
    fn build(&self, ctx: &Rc<RefCell<GraphContext>>, parameters: &[&Shared], gradients: &[Tensor]) -> OptimizerStep {
        let mut step = OptimizerStep::default();
        for (parameter, gradient) in parameters.iter().zip(gradients) {
            let velocity = Shared::zeros(ctx, &format!("{}.velocity", parameter.name()), parameter.shape());

            let new_velocity = &velocity.tensor.scale(self.momentum) - &gradient.scale(self.learning_rate);
            let new_parameter = &parameter.tensor + &new_velocity;

            step.updates.push(Update::new(&velocity, new_velocity));
            step.updates.push(Update::new(parameter, new_parameter));
            step.slots.push(velocity);
        }
        step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::Value;
    use crate::runtime::{Session, StateStore};
    use approx::assert_relative_eq;
    use ndarray::arr1;
    use std::collections::HashMap;

    #[test]
    fn test_one_momentum_step() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let param = Shared::new(&ctx, "w", arr1(&[1.5]).into_dyn());
        let gradient = Tensor::scalar(&ctx, 2.0);

        let step = MomentumSgd::new(0.01, 0.9).build(&ctx, &[&param], &[gradient]);
        assert_eq!(step.slots.len(), 1);
        assert_eq!(step.updates.len(), 2);
        assert_eq!(step.updates[0].target.name().as_deref(), Some("w.velocity"));
        assert_eq!(step.updates[1].target.name().as_deref(), Some("w"));

        let mut state = StateStore::new();
        state.insert("w".to_string(), Value::Tensor(param.initial.clone()));
        state.insert("w.velocity".to_string(), Value::Tensor(step.slots[0].initial.clone()));
        let updates = step
            .updates
            .iter()
            .map(|u| (u.target.name().unwrap_or_default(), u.value.node_id))
            .collect();
        let graph = ctx.borrow().main_graph().clone();
        let mut session = Session::new(graph, vec![], updates, state);

        session.run(&HashMap::new()).unwrap();
        assert_relative_eq!(session.get("w.velocity").unwrap()[[0]], -0.02, epsilon = 1e-7);
        assert_relative_eq!(session.get("w").unwrap()[[0]], 1.48, epsilon = 1e-6);

        // v2 = 0.9 * -0.02 - 0.02
        session.run(&HashMap::new()).unwrap();
        assert_relative_eq!(session.get("w.velocity").unwrap()[[0]], -0.038, epsilon = 1e-7);
        assert_relative_eq!(session.get("w").unwrap()[[0]], 1.442, epsilon = 1e-6);
    }
}
