//! Lloyd's k-means over row-major `f32` data.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

/// Squared Euclidean distance.
pub fn l2_sq(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Index of the centroid closest to `v`, and its squared distance.
pub fn nearest(centroids: &[f32], dim: usize, v: &[f32]) -> (usize, f32) {
    centroids
        .chunks_exact(dim)
        .enumerate()
        .map(|(i, c)| (i, l2_sq(c, v)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .unwrap_or((0, f32::INFINITY))
}

/// Nearest centroid of every row in `data`.
pub fn assign(data: &[f32], dim: usize, centroids: &[f32]) -> Vec<usize> {
    data.par_chunks_exact(dim)
        .map(|row| nearest(centroids, dim, row).0)
        .collect()
}

/// Train `k` centroids on `data`. `k` is capped at the number of rows.
/// Returns `k * dim` floats.
pub fn train(data: &[f32], dim: usize, k: usize, iterations: usize, seed: u64) -> Vec<f32> {
    let n = data.len() / dim;
    let k = k.min(n);
    if k == 0 {
        return Vec::new();
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids = Vec::with_capacity(k * dim);
    for row in rand::seq::index::sample(&mut rng, n, k) {
        centroids.extend_from_slice(&data[row * dim..(row + 1) * dim]);
    }

    let mut labels = vec![usize::MAX; n];
    for iteration in 0..iterations {
        let next = assign(data, dim, &centroids);
        if next == labels {
            tracing::trace!(iteration, k, "k-means converged");
            break;
        }
        labels = next;

        let mut sums = vec![0f32; k * dim];
        let mut counts = vec![0usize; k];
        for (row, &label) in data.chunks_exact(dim).zip(&labels) {
            counts[label] += 1;
            sums[label * dim..(label + 1) * dim]
                .iter_mut()
                .zip(row)
                .for_each(|(s, x)| *s += x);
        }

        for cluster in 0..k {
            let centroid = &mut centroids[cluster * dim..(cluster + 1) * dim];
            if counts[cluster] == 0 {
                // Reseed an empty cluster on a random point
                let row = rng.random_range(0..n);
                centroid.copy_from_slice(&data[row * dim..(row + 1) * dim]);
                continue;
            }
            let inv = 1.0 / counts[cluster] as f32;
            centroid
                .iter_mut()
                .zip(&sums[cluster * dim..(cluster + 1) * dim])
                .for_each(|(c, s)| *c = s * inv);
        }
    }

    centroids
}
