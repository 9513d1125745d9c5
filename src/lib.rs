//! # causal-cnn: a causal 1-D CNN as a symbolic graph
//!
//! Builds a binary sequence classifier as an **Abstract Semantic Graph (ASG)**:
//! optional input normalization, causal convolution, pooling, a dense layer and
//! a two-way softmax output, together with the loss, its gradients and the
//! momentum updates of every parameter. The graph is then executed by a
//! [`runtime::Session`] that applies all state updates of a step at once.
//!
//! ## Usage Example
//!
//! ```no_run
//! use causal_cnn::model::{CnnConfig, GraphBuilder};
//! use ndarray::{Array1, Array2};
//!
//! let config = CnnConfig::default().with_sequence_length(64).with_batch_size(4).with_seed(1);
//! let builder = GraphBuilder::new(config)?;
//! let x = builder.input("x");
//! let y = builder.input("y");
//! let network = builder.assemble(&x, &y)?;
//!
//! let mut session = network.session();
//! let inputs = Array2::<f32>::zeros((4, 64)).into_dyn();
//! let labels = Array1::from(vec![1.0f32, -1.0, 1.0, -1.0]).into_dyn();
//! let step = network.train_step(&mut session, inputs, labels)?;
//! println!("loss {} errors {}", step.loss, step.error);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod analysis;
pub mod asg;
pub mod autograd;
pub mod losses;
pub mod model;
pub mod nn;
pub mod optimizers;
pub mod runtime;
pub mod serialization;
pub mod tensor;
