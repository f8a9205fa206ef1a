use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

fn standard_normal<R: Rng>(rng: &mut R) -> f32 {
    // Box-Muller; u1 is kept away from zero so ln stays finite.
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

pub fn normal<R: Rng>(
    rows: usize,
    cols: usize,
    mean: f32,
    std_dev: f32,
    rng: &mut R,
) -> Array2<f32> {
    Array2::from_shape_simple_fn((rows, cols), || standard_normal(rng) * std_dev + mean)
}

pub fn uniform<R: Rng>(rows: usize, cols: usize, low: f32, high: f32, rng: &mut R) -> Array2<f32> {
    Array2::from_shape_simple_fn((rows, cols), || rng.gen_range(low..high))
}

/// Glorot normal: std = sqrt(2 / (fan_in + fan_out)).
pub fn xavier_normal<R: Rng>(rows: usize, cols: usize, rng: &mut R) -> Array2<f32> {
    let std_dev = (2.0 / (rows + cols).max(1) as f32).sqrt();
    normal(rows, cols, 0.0, std_dev, rng)
}

pub fn xavier_uniform<R: Rng>(rows: usize, cols: usize, rng: &mut R) -> Array2<f32> {
    let limit = (6.0 / (rows + cols).max(1) as f32).sqrt();
    uniform(rows, cols, -limit, limit, rng)
}

pub fn zeros(rows: usize, cols: usize) -> Array2<f32> {
    Array2::zeros((rows, cols))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitializationMethod {
    XavierUniform,
    XavierNormal,
    Normal { mean: f32, std_dev: f32 },
    Uniform { low: f32, high: f32 },
    Zeros,
}

impl InitializationMethod {
    pub fn initialize<R: Rng>(&self, rows: usize, cols: usize, rng: &mut R) -> Array2<f32> {
        match self {
            InitializationMethod::XavierUniform => xavier_uniform(rows, cols, rng),
            InitializationMethod::XavierNormal => xavier_normal(rows, cols, rng),
            InitializationMethod::Normal { mean, std_dev } => {
                normal(rows, cols, *mean, *std_dev, rng)
            }
            InitializationMethod::Uniform { low, high } => uniform(rows, cols, *low, *high, rng),
            InitializationMethod::Zeros => zeros(rows, cols),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_normal_statistics() {
        let mut rng = StdRng::seed_from_u64(7);
        let m = normal(200, 50, 0.0, 0.05, &mut rng);
        let n = m.len() as f32;
        let mean = m.sum() / n;
        let var = m.mapv(|x| (x - mean).powi(2)).sum() / n;
        assert!(mean.abs() < 0.01);
        assert!((var.sqrt() - 0.05).abs() < 0.01);
        assert!(m.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_xavier_uniform_bounds() {
        let mut rng = StdRng::seed_from_u64(1);
        let m = xavier_uniform(10, 30, &mut rng);
        let limit = (6.0f32 / 40.0).sqrt();
        assert_eq!(m.dim(), (10, 30));
        assert!(m.iter().all(|&w| w >= -limit && w <= limit));
    }

    #[test]
    fn test_seeded_initialization_is_reproducible() {
        let method = InitializationMethod::XavierNormal;
        let a = method.initialize(4, 3, &mut StdRng::seed_from_u64(42));
        let b = method.initialize(4, 3, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }
}
