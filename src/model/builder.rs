//! One-shot assembly of the network graph.

use super::config::CnnConfig;
use super::network::Network;
use super::{ModelError, Result};
use crate::analysis::shape_inference::ShapeInference;
use crate::asg::{DType, NodeType, Shape};
use crate::autograd;
use crate::losses;
use crate::nn::{
    CausalConv1d, CausalConv1dConfig, Dense, Forward, InputLayer, Linear, Module, OutputLayer, Pool1d, Shared,
    NUM_CLASSES,
};
use crate::optimizers::{MomentumSgd, Optimizer};
use crate::tensor::{GraphContext, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Shapes of every stage, fixed by the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerShapes {
    /// Raw mini-batch `(batch, L)`.
    pub input: [usize; 2],
    /// Convolution input `(batch, 1, L)`.
    pub conv_input: [usize; 3],
    /// Filters `(filters, 1, filter_length)`.
    pub filter: [usize; 3],
    /// Pool window width.
    pub pool: usize,
    /// Length after pooling, `ceil(L / pool)`.
    pub pooled_length: usize,
    /// Dense weight `(filters * floor(L / pool), dense)`.
    pub dense: [usize; 2],
    /// Output weight `(dense, 2)`.
    pub output: [usize; 2],
}

impl LayerShapes {
    pub fn from_config(config: &CnnConfig) -> Self {
        let (batch, length, pool) = (config.batch_size, config.sequence_length, config.pool_size);
        Self {
            input: [batch, length],
            conv_input: [batch, 1, length],
            filter: [config.number_of_filters, 1, config.filter_length],
            pool,
            pooled_length: length.div_ceil(pool),
            dense: [config.number_of_filters * (length / pool), config.dense_neurons],
            output: [config.dense_neurons, NUM_CLASSES],
        }
    }

    /// Width of the flattened pooling output, `filters * ceil(L / pool)`.
    pub fn flattened(&self) -> usize {
        self.filter[0] * self.pooled_length
    }
}

/// Builds the graph of one network.
///
/// `assemble` consumes the builder, so parameters are registered exactly once.
pub struct GraphBuilder {
    config: CnnConfig,
    shapes: LayerShapes,
    context: Rc<RefCell<GraphContext>>,
    rng: StdRng,
}

impl GraphBuilder {
    pub fn new(config: CnnConfig) -> Result<Self> {
        config.validate()?;
        let shapes = LayerShapes::from_config(&config);
        if config.sequence_length % config.pool_size != 0 {
            log::warn!(
                "Sequence length {} is not a multiple of the pool size {}; assembly will fail",
                config.sequence_length,
                config.pool_size
            );
        }
        log::debug!("Layer shapes: {:?}", shapes);

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self { config, shapes, context: Rc::new(RefCell::new(GraphContext::new())), rng })
    }

    pub fn config(&self) -> &CnnConfig {
        &self.config
    }

    pub fn shapes(&self) -> &LayerShapes {
        &self.shapes
    }

    pub fn context(&self) -> &Rc<RefCell<GraphContext>> {
        &self.context
    }

    /// Declares a named input of this builder's graph.
    pub fn input(&self, name: &str) -> Tensor {
        Tensor::new_input(&self.context, name)
    }

    /// Builds the forward pass, loss, gradients and update rule on top of
    /// `input` `(batch, L)` and `labels` `(batch,)` with values in {-1, +1}.
    pub fn assemble(mut self, input: &Tensor, labels: &Tensor) -> Result<Network> {
        let input_name = self.own_input(input)?;
        let labels_name = self.own_input(labels)?;
        let ctx = Rc::clone(&self.context);
        let config = self.config.clone();
        let shapes = self.shapes.clone();
        let normalize = config.perform_normalization;

        // Stages
        let input_layer = InputLayer::new(&ctx, config.batch_size, config.sequence_length, normalize);
        let conv_config = CausalConv1dConfig::new(
            config.batch_size,
            config.sequence_length,
            config.number_of_filters,
            config.filter_length,
        )
        .with_activation(config.activation)
        .with_normalization(normalize);
        let conv = CausalConv1d::new(&ctx, "conv", &conv_config, &mut self.rng);
        let pool = Pool1d::new(config.pool_size, config.pooling_mode);

        let dense_std = 1.0 / (config.batch_size as f32).sqrt();
        let dense_linear = Linear::new(&ctx, "dense", shapes.dense[0], shapes.dense[1], dense_std, &mut self.rng);
        let dense = Dense::new(&ctx, "dense", dense_linear, config.batch_size, config.activation, normalize);

        let output_std = 1.0 / (config.dense_neurons as f32).sqrt();
        let output_linear = Linear::new(&ctx, "output", shapes.output[0], shapes.output[1], output_std, &mut self.rng);
        let output = OutputLayer::new(&ctx, "output", output_linear, config.batch_size, config.classifier, normalize);

        // Forward pass
        let mut forward = input_layer.forward(input);
        forward = chain(forward, &conv);
        forward = chain(forward, &pool);
        let flat = [config.batch_size, shapes.flattened()];
        forward = forward.map(|x| x.reshape(flat.to_vec()));
        forward = chain(forward, &dense);
        forward = chain(forward, &output);
        let Forward { output: probabilities, mut updates } = forward;

        // Loss, prediction, error
        let prediction = losses::prediction(&probabilities);
        let penalized = [&conv.filters.tensor, &dense.linear.weights.tensor, &output.linear.weights.tensor];
        let loss = losses::regularized_loss(&probabilities, labels, config.regularization_coefficient, &penalized);
        let error = losses::error_count(&prediction, labels);

        let parameters: Vec<Shared> = [conv.parameters(), dense.parameters(), output.parameters()]
            .into_iter()
            .flatten()
            .cloned()
            .collect();
        let buffers: Vec<Shared> = [input_layer.buffers(), conv.buffers(), dense.buffers(), output.buffers()]
            .into_iter()
            .flatten()
            .cloned()
            .collect();

        let mut initial_shapes = HashMap::from([
            (input_name, (shapes.input.to_vec(), DType::F32)),
            (labels_name, (vec![config.batch_size], DType::F32)),
        ]);
        register_shapes(&mut initial_shapes, parameters.iter().chain(&buffers));
        ShapeInference::run(ctx.borrow_mut().main_graph_mut(), &initial_shapes)?;

        // Update rule
        let parameter_tensors: Vec<Tensor> = parameters.iter().map(|p| p.tensor.clone()).collect();
        let gradients = autograd::grad(&loss, &parameter_tensors)?;
        let optimizer = MomentumSgd::new(config.learning_rate, config.momentum);
        let parameter_refs: Vec<&Shared> = parameters.iter().collect();
        let step = optimizer.build(&ctx, &parameter_refs, &gradients);
        updates.extend(step.updates);

        register_shapes(&mut initial_shapes, &step.slots);
        ShapeInference::run(ctx.borrow_mut().main_graph_mut(), &initial_shapes)?;

        log::info!(
            "Assembled network: {} parameters, {} updates, {} graph nodes",
            parameters.len(),
            updates.len(),
            ctx.borrow().main_graph().nodes.len()
        );

        Ok(Network {
            config,
            shapes,
            context: ctx,
            input: input.clone(),
            labels: labels.clone(),
            probabilities,
            prediction,
            loss,
            error,
            parameters,
            buffers,
            velocities: step.slots,
            updates,
        })
    }

    /// Name of `tensor`, checking it is an `Input` node of this builder's graph.
    fn own_input(&self, tensor: &Tensor) -> Result<String> {
        let name = tensor.name().ok_or(ModelError::UnnamedInput)?;
        if !Rc::ptr_eq(&tensor.context, &self.context) {
            return Err(ModelError::ForeignTensor(name));
        }
        let ctx = self.context.borrow();
        match ctx.main_graph().get_node(tensor.node_id).map(|node| &node.node_type) {
            Ok(NodeType::Input { .. }) => Ok(name),
            _ => Err(ModelError::NotAnInput(name)),
        }
    }
}

fn chain(forward: Forward, stage: &dyn Module) -> Forward {
    let next = stage.forward(&forward.output);
    forward.then(next)
}

fn register_shapes<'a>(shapes: &mut HashMap<String, (Shape, DType)>, state: impl IntoIterator<Item = &'a Shared>) {
    for shared in state {
        shapes.insert(shared.name(), (shared.shape().to_vec(), DType::F32));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> CnnConfig {
        CnnConfig::default()
            .with_sequence_length(16)
            .with_batch_size(3)
            .with_filters(2, 3)
            .with_dense_neurons(4)
            .with_seed(11)
    }

    #[test]
    fn test_layer_shapes() {
        let shapes = LayerShapes::from_config(&small_config().with_pooling(3, Default::default()));
        assert_eq!(shapes.conv_input, [3, 1, 16]);
        assert_eq!(shapes.filter, [2, 1, 3]);
        assert_eq!(shapes.pooled_length, 6);
        assert_eq!(shapes.dense, [10, 4]);
        assert_eq!(shapes.output, [4, 2]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = GraphBuilder::new(small_config().with_batch_size(0)).err();
        assert!(matches!(err, Some(ModelError::Config(_))));
    }

    #[test]
    fn test_foreign_input_rejected() {
        let builder = GraphBuilder::new(small_config()).unwrap();
        let other = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&other, "x");
        let y = builder.input("y");
        assert!(matches!(builder.assemble(&x, &y), Err(ModelError::ForeignTensor(_))));
    }

    #[test]
    fn test_parameter_handle_rejected_as_input() {
        let builder = GraphBuilder::new(small_config()).unwrap();
        let x = Tensor::new_parameter(builder.context(), "x");
        let y = builder.input("y");
        match builder.assemble(&x, &y) {
            Err(ModelError::NotAnInput(name)) => assert_eq!(name, "x"),
            other => panic!("expected NotAnInput, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_indivisible_length_fails_shape_inference() {
        let builder = GraphBuilder::new(small_config().with_sequence_length(15)).unwrap();
        let x = builder.input("x");
        let y = builder.input("y");
        assert!(matches!(builder.assemble(&x, &y), Err(ModelError::Shape(_))));
    }
}
