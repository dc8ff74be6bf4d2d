//! Fixed random projection between embedding dimensions.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::clip::normalize;
use crate::error::FinderError;

const SEED: u64 = 42;

/// Gaussian random projection from `source_dim` to `target_dim`.
///
/// This is LOSSY: the matrix is random, not learned, so projected queries
/// only roughly preserve similarity. It exists so a model of another width
/// can still query an index, and is off unless
/// `search.allow_lossy_projection` is set.
#[derive(Debug, Clone)]
pub struct LossyProjection {
    source_dim: usize,
    target_dim: usize,
    /// Row-major `source_dim x target_dim`, unit-norm columns.
    matrix: Vec<f32>,
}

impl LossyProjection {
    pub fn new(source_dim: usize, target_dim: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(SEED);
        let mut matrix: Vec<f32> = (0..source_dim * target_dim)
            .map(|_| standard_normal(&mut rng))
            .collect();

        for col in 0..target_dim {
            let norm = (0..source_dim)
                .map(|row| matrix[row * target_dim + col].powi(2))
                .sum::<f32>()
                .sqrt();
            if norm > 0.0 {
                for row in 0..source_dim {
                    matrix[row * target_dim + col] /= norm;
                }
            }
        }

        tracing::warn!(
            source_dim,
            target_dim,
            "Using a lossy random projection for queries; similarity scores are approximate"
        );
        Self {
            source_dim,
            target_dim,
            matrix,
        }
    }

    pub fn source_dim(&self) -> usize {
        self.source_dim
    }

    pub fn target_dim(&self) -> usize {
        self.target_dim
    }

    /// Project and re-normalize `v`.
    pub fn project(&self, v: &[f32]) -> Result<Vec<f32>, FinderError> {
        if v.len() != self.source_dim {
            return Err(FinderError::DimensionMismatch {
                expected: self.source_dim,
                actual: v.len(),
            });
        }
        let mut out = vec![0.0f32; self.target_dim];
        for (row, &x) in self.matrix.chunks_exact(self.target_dim).zip(v) {
            out.iter_mut().zip(row).for_each(|(o, m)| *o += x * m);
        }
        normalize(&mut out);
        Ok(out)
    }
}

/// Box-Muller draw from N(0, 1).
fn standard_normal(rng: &mut StdRng) -> f32 {
    let u1: f32 = rng.random_range(f32::EPSILON..1.0);
    let u2: f32 = rng.random();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_projection_is_seeded_and_normalized() {
        let a = LossyProjection::new(12, 8);
        let b = LossyProjection::new(12, 8);
        let v: Vec<f32> = (0..12).map(|i| i as f32 - 5.5).collect();

        let pa = a.project(&v).unwrap();
        assert_eq!(pa, b.project(&v).unwrap());
        assert_eq!(pa.len(), 8);
        let norm: f32 = pa.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);

        for col in 0..8 {
            let col_norm: f32 = (0..12).map(|r| a.matrix[r * 8 + col].powi(2)).sum::<f32>().sqrt();
            assert!((col_norm - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_rejects_wrong_source_dim() {
        let projection = LossyProjection::new(6, 4);
        assert!(matches!(
            projection.project(&[1.0; 4]),
            Err(FinderError::DimensionMismatch { expected: 6, actual: 4 })
        ));
    }
}
