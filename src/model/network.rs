//! The assembled network and its execution helpers.

use super::builder::LayerShapes;
use super::config::CnnConfig;
use crate::asg::{Asg, Value};
use crate::nn::{Shared, Update};
use crate::runtime::{RuntimeError, Session, StateStore};
use crate::tensor::{GraphContext, Tensor};
use ndarray::ArrayD;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Everything `GraphBuilder::assemble` produces.
pub struct Network {
    pub config: CnnConfig,
    pub shapes: LayerShapes,
    pub(crate) context: Rc<RefCell<GraphContext>>,
    pub input: Tensor,
    pub labels: Tensor,
    /// `(batch, 2)` class probabilities.
    pub probabilities: Tensor,
    /// `(batch,)` predicted labels in {-1, +1}.
    pub prediction: Tensor,
    /// Scalar: summed negative log-likelihood plus L2 penalty.
    pub loss: Tensor,
    /// Scalar: number of mispredicted examples.
    pub error: Tensor,
    /// Trainable parameters: conv filters, conv bias, dense weights, dense
    /// bias, output weights, output bias.
    pub parameters: Vec<Shared>,
    /// Normalization scale/shift and running statistics.
    pub buffers: Vec<Shared>,
    /// One velocity per parameter.
    pub velocities: Vec<Shared>,
    /// Running statistics first, then (velocity, parameter) pairs.
    pub updates: Vec<Update>,
}

/// Values produced by one evaluation of the network.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub probabilities: ArrayD<f32>,
    pub prediction: ArrayD<f32>,
    pub loss: f32,
    pub error: f32,
}

impl StepResult {
    fn from_values(values: Vec<Value>) -> Result<Self, RuntimeError> {
        let [probabilities, prediction, loss, error]: [Value; 4] = values.try_into().map_err(|v: Vec<Value>| {
            RuntimeError::ComputationError(format!("expected 4 outputs, got {}", v.len()))
        })?;
        let scalar = |value: Value| {
            value.scalar().ok_or_else(|| RuntimeError::TypeError {
                expected: "scalar".to_string(),
                actual: format!("shape {:?}", value.shape()),
            })
        };
        Ok(Self {
            probabilities: probabilities.into_tensor(),
            prediction: prediction.into_tensor(),
            loss: scalar(loss)?,
            error: scalar(error)?,
        })
    }
}

impl Network {
    /// Snapshot of the graph with all gradient and update nodes.
    pub fn graph(&self) -> Asg {
        self.context.borrow().main_graph().clone()
    }

    /// Every persistent tensor: parameters, buffers, velocities.
    pub fn state(&self) -> impl Iterator<Item = &Shared> {
        self.parameters.iter().chain(&self.buffers).chain(&self.velocities)
    }

    /// Starting values of all persistent tensors, keyed by name.
    pub fn initial_state(&self) -> StateStore {
        self.state().map(|s| (s.name(), Value::Tensor(s.initial.clone()))).collect()
    }

    /// Update pairs as (state name, node of the new value).
    pub fn update_pairs(&self) -> Vec<(String, usize)> {
        self.updates
            .iter()
            .map(|u| (u.target.name().unwrap_or_default(), u.value.node_id))
            .collect()
    }

    /// A session over the initial state. Outputs are probabilities,
    /// prediction, loss and error, in that order.
    pub fn session(&self) -> Session {
        let outputs = vec![self.probabilities.node_id, self.prediction.node_id, self.loss.node_id, self.error.node_id];
        Session::new(self.graph(), outputs, self.update_pairs(), self.initial_state())
    }

    /// Feeds for one mini-batch.
    pub fn feeds(&self, input: ArrayD<f32>, labels: ArrayD<f32>) -> HashMap<String, ArrayD<f32>> {
        HashMap::from([
            (self.input.name().unwrap_or_default(), input),
            (self.labels.name().unwrap_or_default(), labels),
        ])
    }

    /// One forward/backward pass followed by the update batch.
    pub fn train_step(
        &self,
        session: &mut Session,
        input: ArrayD<f32>,
        labels: ArrayD<f32>,
    ) -> Result<StepResult, RuntimeError> {
        let values = session.run(&self.feeds(input, labels))?;
        StepResult::from_values(values)
    }

    /// Forward pass only; the state is left as it is.
    pub fn evaluate(&self, session: &Session, input: ArrayD<f32>, labels: ArrayD<f32>) -> Result<StepResult, RuntimeError> {
        let values = session.evaluate(&self.feeds(input, labels))?;
        StepResult::from_values(values)
    }
}
