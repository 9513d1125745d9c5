//! Non-overlapping 1-D pooling over the sequence axis.

use crate::asg::PoolMode;
use crate::nn::module::{Forward, Module, Shared};
use crate::tensor::Tensor;

/// Pools `(batch, channels, length)` into `(batch, channels, ceil(length / width))`.
///
/// The trailing window is kept even when it holds fewer than `width` elements.
#[derive(Debug, Clone, Copy)]
pub struct Pool1d {
    pub width: usize,
    pub mode: PoolMode,
}

impl Pool1d {
    pub fn new(width: usize, mode: PoolMode) -> Self {
        Self { width, mode }
    }

    /// Output length for an input of `length` positions.
    pub fn output_length(&self, length: usize) -> usize {
        length.div_ceil(self.width)
    }
}

impl Module for Pool1d {
    fn forward(&self, inputs: &Tensor) -> Forward {
        Forward::new(inputs.pool1d(self.width, self.mode))
    }

    fn parameters(&self) -> Vec<&Shared> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_length_rounds_up() {
        let pool = Pool1d::new(2, PoolMode::Max);
        assert_eq!(pool.output_length(7), 4);
        assert_eq!(pool.output_length(8), 4);
        assert_eq!(Pool1d::new(3, PoolMode::Average).output_length(1), 1);
    }
}
