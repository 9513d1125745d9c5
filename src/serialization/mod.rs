//! Saving and restoring the network's persistent state.
//!
//! - **SafeTensors**: the state tensors, keyed by state name
//! - **Checkpoint**: configuration (JSON), training progress and state together
//!
//! ```rust,ignore
//! use causal_cnn::serialization::{save_state, load_state};
//!
//! save_state("state.safetensors", session.state())?;
//! session.load_state(load_state("state.safetensors")?)?;
//! ```

pub mod checkpoint;
pub mod safetensors_io;

pub use checkpoint::{load_checkpoint, save_checkpoint, Checkpoint, CheckpointError, CheckpointMeta};
pub use safetensors_io::{list_tensors, load_state, save_state, SafeTensorsError};
