//! # Graph Analysis Module
//!
//! Analysis passes that process the ASG before execution.
//!
//! - [`ShapeInference`](shape_inference::ShapeInference): propagates tensor
//!   shapes through the graph, rejecting shape mismatches at construction time.
//!
//! ```text
//! ASG (untyped) -> Shape Inference -> ASG (with shapes/dtypes)
//! ```
//!
//! Autograd relies on the inferred shapes (mean normalizers, reshape targets),
//! so inference runs before gradients are built and again afterwards.
//!
//! ## Example
//!
//! ```ignore
//! use causal_cnn::analysis::shape_inference::ShapeInference;
//!
//! let mut graph = context.borrow().main_graph().clone();
//! let shapes = HashMap::from([
//!     ("input".to_string(), (vec![10, 38400], DType::F32)),
//! ]);
//! ShapeInference::run(&mut graph, &shapes)?;
//! ```

pub mod shape_inference;
