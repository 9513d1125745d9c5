//! Trains the causal CNN on a synthetic two-class sequence stream.

use causal_cnn::model::{CnnConfig, GraphBuilder};
use causal_cnn::serialization::{save_checkpoint, Checkpoint, CheckpointMeta};

use clap::Parser;
use ndarray::{Array1, Array2, ArrayD, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(author, version, about = "Causal 1-D CNN for binary sequence classification", long_about = None)]
struct Args {
    /// JSON configuration; defaults are used for missing fields
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of training steps
    #[arg(short, long, default_value_t = 20)]
    steps: usize,

    #[arg(long)]
    sequence_length: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f32>,

    /// Disable batch normalization at all four sites
    #[arg(long)]
    no_normalization: bool,

    #[arg(long)]
    seed: Option<u64>,

    /// Directory to write a checkpoint to after training
    #[arg(long)]
    checkpoint: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => CnnConfig::from_file(path)?,
        None => CnnConfig::default(),
    };
    if let Some(length) = args.sequence_length {
        config = config.with_sequence_length(length);
    }
    if let Some(batch) = args.batch_size {
        config = config.with_batch_size(batch);
    }
    if let Some(rate) = args.learning_rate {
        config = config.with_learning_rate(rate);
    }
    if args.no_normalization {
        config = config.with_normalization(false);
    }
    if let Some(seed) = args.seed {
        config = config.with_seed(seed);
    }

    let builder = GraphBuilder::new(config.clone())?;
    let x = builder.input("x");
    let y = builder.input("y");
    let network = builder.assemble(&x, &y)?;
    let mut session = network.session();

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
        None => StdRng::from_entropy(),
    };

    let mut last = None;
    for step in 1..=args.steps {
        let (inputs, labels) = synthetic_batch(&config, &mut rng);
        let started = Instant::now();
        let result = network.train_step(&mut session, inputs, labels)?;
        log::info!(
            "step {:>4}: loss {:.4}, errors {}/{} ({:?})",
            step,
            result.loss,
            result.error,
            config.batch_size,
            started.elapsed()
        );
        last = Some(result);
    }

    if let Some(dir) = args.checkpoint {
        let mut meta = CheckpointMeta::default().with_global_step(args.steps);
        if let Some(result) = &last {
            meta = meta.with_last_step(result.loss, result.error);
        }
        let checkpoint = Checkpoint::new(config, session.state().clone()).with_meta(meta);
        save_checkpoint(dir, &checkpoint)?;
    }
    Ok(())
}

/// Noisy sequences: label +1 carries a slow sine wave, label -1 only noise.
fn synthetic_batch(config: &CnnConfig, rng: &mut StdRng) -> (ArrayD<f32>, ArrayD<f32>) {
    let (batch, length) = (config.batch_size, config.sequence_length);
    let labels = Array1::from_shape_fn(batch, |_| if rng.gen_bool(0.5) { 1.0f32 } else { -1.0 });

    let mut inputs = Array2::random_using((batch, length), Uniform::new(-1.0f32, 1.0), rng);
    for (mut row, &label) in inputs.axis_iter_mut(Axis(0)).zip(labels.iter()) {
        if label > 0.0 {
            for (t, v) in row.iter_mut().enumerate() {
                *v += (t as f32 * 0.05).sin();
            }
        }
    }
    (inputs.into_dyn(), labels.into_dyn())
}
