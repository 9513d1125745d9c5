//! Stateful execution of an assembled graph.
//!
//! A `Session` owns the values of every `Parameter` node (weights, velocities,
//! running statistics). One call to [`Session::run`] evaluates the requested
//! outputs and every update value against the current state, then replaces the
//! state in a single step. A failed step leaves the state untouched.

use super::backend::{Backend, Memo, RuntimeError};
use super::cpu_backend::CpuBackend;
use crate::asg::{Asg, NodeId, NodeType, Value};
use ndarray::ArrayD;
use std::collections::HashMap;

/// Persistent state, keyed by parameter name.
pub type StateStore = HashMap<String, Value>;

pub struct Session<B: Backend<DeviceData = Value> = CpuBackend> {
    graph: Asg,
    outputs: Vec<NodeId>,
    /// (state name, node computing its new value), applied in order.
    updates: Vec<(String, NodeId)>,
    state: StateStore,
    backend: B,
}

impl Session<CpuBackend> {
    pub fn new(graph: Asg, outputs: Vec<NodeId>, updates: Vec<(String, NodeId)>, state: StateStore) -> Self {
        Self::with_backend(graph, outputs, updates, state, CpuBackend::new())
    }
}

impl<B: Backend<DeviceData = Value>> Session<B> {
    pub fn with_backend(
        graph: Asg,
        outputs: Vec<NodeId>,
        updates: Vec<(String, NodeId)>,
        state: StateStore,
        backend: B,
    ) -> Self {
        Self { graph, outputs, updates, state, backend }
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Current value of one state entry.
    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.state.get(name).and_then(Value::as_tensor)
    }

    /// Replaces state entries by name. Unknown names and shape changes are rejected.
    pub fn load_state(&mut self, values: StateStore) -> Result<(), RuntimeError> {
        for (name, value) in &values {
            let current = self
                .state
                .get(name)
                .ok_or_else(|| RuntimeError::UnknownState(name.clone()))?;
            if current.shape() != value.shape() {
                return Err(RuntimeError::UpdateShapeMismatch {
                    name: name.clone(),
                    expected: current.shape(),
                    actual: value.shape(),
                });
            }
        }
        self.state.extend(values);
        Ok(())
    }

    /// One training step: evaluates the outputs, then applies the update batch.
    pub fn run(&mut self, feeds: &HashMap<String, ArrayD<f32>>) -> Result<Vec<Value>, RuntimeError> {
        let update_ids: Vec<NodeId> = self.updates.iter().map(|(_, id)| *id).collect();
        let mut results = self.execute(feeds, &update_ids)?;
        let new_values = results.split_off(self.outputs.len());

        let mut staged = Vec::with_capacity(new_values.len());
        for ((name, _), value) in self.updates.iter().zip(new_values) {
            let expected = self
                .state
                .get(name)
                .map(Value::shape)
                .ok_or_else(|| RuntimeError::UnknownState(name.clone()))?;
            if expected != value.shape() {
                return Err(RuntimeError::UpdateShapeMismatch {
                    name: name.clone(),
                    expected,
                    actual: value.shape(),
                });
            }
            staged.push((name.clone(), value));
        }

        for (name, value) in staged {
            self.state.insert(name, value);
        }
        log::debug!("Applied {} state updates", self.updates.len());
        Ok(results)
    }

    /// Evaluates the outputs without touching the state.
    pub fn evaluate(&self, feeds: &HashMap<String, ArrayD<f32>>) -> Result<Vec<Value>, RuntimeError> {
        self.execute(feeds, &[])
    }

    fn execute(&self, feeds: &HashMap<String, ArrayD<f32>>, extra: &[NodeId]) -> Result<Vec<Value>, RuntimeError> {
        for node in self.graph.nodes.values() {
            if let (NodeType::Input { name }, Some(shape)) = (&node.node_type, &node.shape) {
                if let Some(data) = feeds.get(name) {
                    if data.shape() != shape.as_slice() {
                        return Err(RuntimeError::ShapeError(format!(
                            "input '{}' expects shape {:?}, got {:?}",
                            name,
                            shape,
                            data.shape()
                        )));
                    }
                }
            }
        }

        let mut host = self.state.clone();
        host.extend(feeds.iter().map(|(name, data)| (name.clone(), Value::Tensor(data.clone()))));
        let device = self.backend.load_data(&host)?;

        let mut memo: Memo<Value> = HashMap::new();
        for node in self.graph.nodes.values() {
            if let NodeType::Input { name } | NodeType::Parameter { name } = &node.node_type {
                if let Some(value) = device.get(name) {
                    memo.insert((self.graph.id, node.id), value.clone());
                }
            }
        }

        let mut graph = self.graph.clone();
        graph.set_outputs(self.outputs.iter().chain(extra).copied().collect());

        let (device_results, _) = self.backend.run(&graph, memo)?;
        self.backend.retrieve_data(&device_results)
    }
}
