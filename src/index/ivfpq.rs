//! Inverted file over a k-means coarse quantizer, with residuals compressed
//! by a product quantizer.
//!
//! Vectors are assigned to their L2-nearest coarse centroid and stored as
//! one byte per sub-quantizer. A query probes the `nprobe` nearest lists and
//! scores each entry as `q·c + Σ q_j·codebook_j[code_j]`, reading the second
//! term from a table built once per query.

use anyhow::{ensure, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::kmeans::{self, dot, l2_sq};
use super::TopK;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IvfPqParams {
    pub nlist: usize,
    pub m: usize,
    pub nbits: u32,
    pub iterations: usize,
    pub train_points_per_list: usize,
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductQuantizer {
    m: usize,
    dsub: usize,
    ksub: usize,
    /// `m * ksub * dsub` floats, sub-quantizer major.
    codebooks: Vec<f32>,
}

impl ProductQuantizer {
    fn train(data: &[f32], dim: usize, m: usize, ksub: usize, iterations: usize, seed: u64) -> Self {
        let dsub = dim / m;
        let n = data.len() / dim;

        let codebooks: Vec<Vec<f32>> = (0..m)
            .into_par_iter()
            .map(|j| {
                let mut sub = Vec::with_capacity(n * dsub);
                for row in data.chunks_exact(dim) {
                    sub.extend_from_slice(&row[j * dsub..(j + 1) * dsub]);
                }
                kmeans::train(&sub, dsub, ksub, iterations, seed.wrapping_add(j as u64 + 1))
            })
            .collect();

        Self {
            m,
            dsub,
            ksub,
            codebooks: codebooks.concat(),
        }
    }

    fn codebook(&self, j: usize) -> &[f32] {
        let size = self.ksub * self.dsub;
        &self.codebooks[j * size..(j + 1) * size]
    }

    fn encode_into(&self, v: &[f32], codes: &mut Vec<u8>) {
        for j in 0..self.m {
            let sub = &v[j * self.dsub..(j + 1) * self.dsub];
            codes.push(kmeans::nearest(self.codebook(j), self.dsub, sub).0 as u8);
        }
    }

    /// `table[j * ksub + c]` = inner product of the query's j-th sub-vector
    /// with codeword `c`.
    fn inner_product_table(&self, query: &[f32]) -> Vec<f32> {
        let mut table = Vec::with_capacity(self.m * self.ksub);
        for j in 0..self.m {
            let sub = &query[j * self.dsub..(j + 1) * self.dsub];
            table.extend(self.codebook(j).chunks_exact(self.dsub).map(|c| dot(c, sub)));
        }
        table
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct InvertedList {
    ids: Vec<i64>,
    codes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvfPqIndex {
    dim: usize,
    centroids: Vec<f32>,
    pq: ProductQuantizer,
    lists: Vec<InvertedList>,
}

impl IvfPqIndex {
    /// Train the coarse and product quantizers on a sample of `vectors`.
    pub fn train(vectors: &[f32], dim: usize, params: &IvfPqParams) -> Result<Self> {
        ensure!(params.m > 0 && dim % params.m == 0, "m ({}) must divide dim ({})", params.m, dim);
        ensure!((1..=8).contains(&params.nbits), "nbits must be in 1..=8, got {}", params.nbits);
        ensure!(params.nlist > 0, "nlist must be at least 1");
        let n = vectors.len() / dim;
        ensure!(n > 0 && n >= params.nlist, "{} vectors cannot train {} lists", n, params.nlist);

        let n_train = n.min(params.nlist.saturating_mul(params.train_points_per_list.max(1)));
        let training: Vec<f32> = if n_train == n {
            vectors.to_vec()
        } else {
            let mut rng = <rand::rngs::StdRng as rand::SeedableRng>::seed_from_u64(params.seed);
            let mut sample = Vec::with_capacity(n_train * dim);
            for row in rand::seq::index::sample(&mut rng, n, n_train) {
                sample.extend_from_slice(&vectors[row * dim..(row + 1) * dim]);
            }
            sample
        };

        tracing::info!(
            vectors = n,
            training = n_train,
            nlist = params.nlist,
            m = params.m,
            nbits = params.nbits,
            "Training IVF-PQ index"
        );

        let centroids = kmeans::train(&training, dim, params.nlist, params.iterations, params.seed);
        let nlist = centroids.len() / dim;

        let labels = kmeans::assign(&training, dim, &centroids);
        let mut residuals = training;
        for (row, &label) in residuals.chunks_exact_mut(dim).zip(&labels) {
            let centroid = &centroids[label * dim..(label + 1) * dim];
            row.iter_mut().zip(centroid).for_each(|(x, c)| *x -= c);
        }

        let ksub = (1usize << params.nbits).min(n_train);
        let pq = ProductQuantizer::train(&residuals, dim, params.m, ksub, params.iterations, params.seed);

        Ok(Self {
            dim,
            centroids,
            pq,
            lists: vec![InvertedList::default(); nlist],
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn nlist(&self) -> usize {
        self.lists.len()
    }

    pub fn len(&self) -> usize {
        self.lists.iter().map(|list| list.ids.len()).sum()
    }

    pub fn ids(&self) -> Vec<i64> {
        self.lists.iter().flat_map(|list| list.ids.iter().copied()).collect()
    }

    pub fn add(&mut self, ids: &[i64], vectors: &[f32]) {
        let dim = self.dim;
        let encoded: Vec<(usize, Vec<u8>)> = vectors
            .par_chunks_exact(dim)
            .map(|row| {
                let (label, _) = kmeans::nearest(&self.centroids, dim, row);
                let centroid = &self.centroids[label * dim..(label + 1) * dim];
                let residual: Vec<f32> = row.iter().zip(centroid).map(|(x, c)| x - c).collect();
                let mut codes = Vec::with_capacity(self.pq.m);
                self.pq.encode_into(&residual, &mut codes);
                (label, codes)
            })
            .collect();

        for (&id, (label, codes)) in ids.iter().zip(encoded) {
            let list = &mut self.lists[label];
            list.ids.push(id);
            list.codes.extend_from_slice(&codes);
        }
    }

    pub fn search(&self, query: &[f32], k: usize, nprobe: usize) -> Vec<(f32, i64)> {
        let dim = self.dim;
        let mut order: Vec<(usize, f32)> = self
            .centroids
            .chunks_exact(dim)
            .enumerate()
            .map(|(i, c)| (i, l2_sq(c, query)))
            .collect();
        order.sort_by(|a, b| a.1.total_cmp(&b.1));
        order.truncate(nprobe.clamp(1, self.nlist().max(1)));

        let table = self.pq.inner_product_table(query);
        let (m, ksub) = (self.pq.m, self.pq.ksub);

        let mut top = TopK::new(k);
        for (list_no, _) in order {
            let list = &self.lists[list_no];
            let base = dot(&self.centroids[list_no * dim..(list_no + 1) * dim], query);
            for (codes, &id) in list.codes.chunks_exact(m).zip(&list.ids) {
                let score = base
                    + codes
                        .iter()
                        .enumerate()
                        .map(|(j, &code)| table[j * ksub + code as usize])
                        .sum::<f32>();
                top.push(score, id);
            }
        }
        top.into_sorted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIM: usize = 8;

    fn params() -> IvfPqParams {
        IvfPqParams {
            nlist: 4,
            m: 4,
            nbits: 8,
            iterations: 15,
            train_points_per_list: 64,
            seed: 42,
        }
    }

    /// 8 groups of 40 vectors, group `g` near basis vector `e_g`.
    fn grouped() -> (Vec<i64>, Vec<f32>) {
        let mut ids = Vec::new();
        let mut data = Vec::new();
        for g in 0..DIM {
            for i in 0..40 {
                let mut v = vec![0.0f32; DIM];
                v[g] = 1.0;
                v[(g + 1) % DIM] = 0.01 * (i % 5) as f32;
                let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
                data.extend(v.iter().map(|x| x / norm));
                ids.push((g * 40 + i) as i64);
            }
        }
        (ids, data)
    }

    #[test]
    fn test_train_add_and_probe_all_lists() {
        let (ids, data) = grouped();
        let mut index = IvfPqIndex::train(&data, DIM, &params()).unwrap();
        assert_eq!(index.nlist(), 4);
        index.add(&ids, &data);
        assert_eq!(index.len(), ids.len());

        let mut all = index.ids();
        all.sort_unstable();
        assert_eq!(all, ids);

        let mut query = vec![0.0; DIM];
        query[3] = 1.0;
        let hits = index.search(&query, 10, 4);
        assert_eq!(hits.len(), 10);
        assert!(hits.iter().all(|&(_, id)| (120..160).contains(&id)), "{:?}", hits);
        assert!(hits.windows(2).all(|w| w[0].0 >= w[1].0));
    }

    #[test]
    fn test_rejects_bad_parameters() {
        let (_, data) = grouped();
        let mut bad = params();
        bad.m = 3;
        assert!(IvfPqIndex::train(&data, DIM, &bad).is_err());

        let mut bad = params();
        bad.nlist = 10_000;
        assert!(IvfPqIndex::train(&data, DIM, &bad).is_err());

        let mut bad = params();
        bad.nlist = 0;
        assert!(IvfPqIndex::train(&data, DIM, &bad).is_err());
    }

    #[test]
    fn test_sampled_training_is_seeded() {
        let (ids, data) = grouped();
        let mut small = params();
        small.train_points_per_list = 20;

        let mut a = IvfPqIndex::train(&data, DIM, &small).unwrap();
        let mut b = IvfPqIndex::train(&data, DIM, &small).unwrap();
        a.add(&ids, &data);
        b.add(&ids, &data);
        assert_eq!(a.search(&data[..DIM], 5, 2), b.search(&data[..DIM], 5, 2));
    }
}
