//! Abstract interface (trait) for execution backends.

use crate::asg::{Asg, AsgId, NodeId, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while executing a graph. Shared by all backends.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Node with ID {0} not found in graph {1}. Check that the graph was built correctly.")]
    NodeNotFound(NodeId, AsgId),

    #[error("Type mismatch: operation expected {expected}, got {actual}.")]
    TypeError { expected: String, actual: String },

    #[error("Tensor shape error: {0}. Check the dimensions of the input tensors.")]
    ShapeError(String),

    #[error("Missing value for input '{0}' (node ID: {1}). Feed it when running the graph.")]
    MissingInput(String, NodeId),

    #[error("Missing value for parameter '{0}' (node ID: {1}). Initialize the state before running the graph.")]
    MissingParameter(String, NodeId),

    #[error("No state entry named '{0}'.")]
    UnknownState(String),

    #[error("Computation error: {0}")]
    ComputationError(String),

    #[error("Update of '{name}' rejected: state has shape {expected:?}, new value has shape {actual:?}.")]
    UpdateShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

/// Cache of already evaluated node values, keyed by (AsgId, NodeId).
pub type Memo<T> = HashMap<(AsgId, NodeId), T>;

/// Common interface of an execution environment (backend).
///
/// Any implementor can take an ASG plus data, execute it and return results.
pub trait Backend {
    /// Device-specific data representation.
    type DeviceData: std::fmt::Debug;

    /// Moves host values onto the device.
    fn load_data(
        &self,
        data: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Self::DeviceData>, RuntimeError>;

    /// Executes the graph, using and extending the evaluation cache.
    ///
    /// # Arguments
    /// * `main_asg` - Graph to execute; its `outputs` are the requested nodes.
    /// * `initial_memo` - Cache pre-filled with inputs and parameters.
    ///
    /// # Returns
    /// The output values in order, and the final cache with every evaluated node.
    fn run(
        &self,
        main_asg: &Asg,
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<(Vec<Self::DeviceData>, Memo<Self::DeviceData>), RuntimeError>;

    /// Copies results back to host values.
    fn retrieve_data(&self, device_data: &[Self::DeviceData]) -> Result<Vec<Value>, RuntimeError>;
}
