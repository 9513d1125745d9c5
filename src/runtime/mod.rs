//! Execution environments for the ASG.
//!
//! - [`backend`]: the `Backend` trait and `RuntimeError`.
//! - [`cpu_backend`]: evaluation of every node type with `ndarray`.
//! - [`session`]: persistent state plus one atomic update batch per step.

pub mod backend;
pub mod cpu_backend;
pub mod session;

pub use backend::{Backend, RuntimeError};
pub use cpu_backend::CpuBackend;
pub use session::{Session, StateStore};
