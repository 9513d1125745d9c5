//! Core building blocks shared by every stage of the network.

use crate::tensor::{GraphContext, Tensor};
use ndarray::{ArrayD, IxDyn};
use std::cell::RefCell;
use std::rc::Rc;

/// A persistent tensor: a `Parameter` node plus the value it starts from.
///
/// Weights, biases, velocities, running statistics and the fixed
/// normalization scale/shift are all `Shared`.
#[derive(Debug, Clone)]
pub struct Shared {
    pub tensor: Tensor,
    pub initial: ArrayD<f32>,
}

impl Shared {
    pub fn new(context: &Rc<RefCell<GraphContext>>, name: &str, initial: ArrayD<f32>) -> Self {
        Self { tensor: Tensor::new_parameter(context, name), initial }
    }

    pub fn zeros(context: &Rc<RefCell<GraphContext>>, name: &str, shape: &[usize]) -> Self {
        Self::new(context, name, ArrayD::zeros(IxDyn(shape)))
    }

    /// Scalar state such as a normalization scale.
    pub fn scalar(context: &Rc<RefCell<GraphContext>>, name: &str, value: f32) -> Self {
        Self::new(context, name, ndarray::arr0(value).into_dyn())
    }

    pub fn name(&self) -> String {
        self.tensor.name().unwrap_or_default()
    }

    pub fn shape(&self) -> &[usize] {
        self.initial.shape()
    }
}

/// A pending assignment `target <- value`, applied once per step.
#[derive(Debug, Clone)]
pub struct Update {
    pub target: Tensor,
    pub value: Tensor,
}

impl Update {
    pub fn new(target: &Shared, value: Tensor) -> Self {
        Self { target: target.tensor.clone(), value }
    }
}

/// Result of a symbolic forward pass.
#[derive(Debug, Clone)]
pub struct Forward {
    pub output: Tensor,
    /// State updates introduced by the pass (running statistics).
    pub updates: Vec<Update>,
}

impl Forward {
    pub fn new(output: Tensor) -> Self {
        Self { output, updates: Vec::new() }
    }

    /// Continues with `f` applied to the output, keeping the updates.
    pub fn map(self, f: impl FnOnce(&Tensor) -> Tensor) -> Self {
        Self { output: f(&self.output), updates: self.updates }
    }

    /// Continues through another stage, concatenating the updates.
    pub fn then(self, next: Forward) -> Self {
        let mut updates = self.updates;
        updates.extend(next.updates);
        Self { output: next.output, updates }
    }
}

/// Common interface of the network stages.
///
/// `forward` only appends nodes to the graph: it returns its output together
/// with the updates it introduces instead of registering them anywhere.
pub trait Module {
    /// Builds the stage's part of the graph on top of `inputs`.
    fn forward(&self, inputs: &Tensor) -> Forward;

    /// Trainable parameters, in registration order.
    fn parameters(&self) -> Vec<&Shared>;

    /// Persistent state that is not trained.
    fn buffers(&self) -> Vec<&Shared> {
        Vec::new()
    }
}
