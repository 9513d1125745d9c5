//! Random initialization of weights.

use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::Rng;

/// Independent draws from `N(0, std^2)`.
pub fn gaussian<R: Rng + ?Sized>(shape: &[usize], std: f32, rng: &mut R) -> ArrayD<f32> {
    ArrayD::<f32>::random_using(IxDyn(shape), StandardNormal, rng) * std
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_gaussian_is_seeded_and_scaled() {
        let a = gaussian(&[4, 250], 0.5, &mut StdRng::seed_from_u64(7));
        let b = gaussian(&[4, 250], 0.5, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);

        let n = a.len() as f32;
        let mean = a.sum() / n;
        let var = a.mapv(|v| (v - mean) * (v - mean)).sum() / n;
        assert!(mean.abs() < 0.1);
        assert!((var.sqrt() - 0.5).abs() < 0.1);
    }
}
