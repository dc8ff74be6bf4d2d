use serde::{Deserialize, Serialize};

use super::kmeans::dot;
use super::TopK;

/// Exact inner-product search over every stored vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlatIndex {
    dim: usize,
    ids: Vec<i64>,
    vectors: Vec<f32>,
}

impl FlatIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            ids: Vec::new(),
            vectors: Vec::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn ids(&self) -> &[i64] {
        &self.ids
    }

    /// `vectors` holds `ids.len()` rows of `dim` floats.
    pub fn add(&mut self, ids: &[i64], vectors: &[f32]) {
        self.ids.extend_from_slice(ids);
        self.vectors.extend_from_slice(vectors);
    }

    pub fn search(&self, query: &[f32], k: usize) -> Vec<(f32, i64)> {
        let mut top = TopK::new(k);
        for (row, &id) in self.vectors.chunks_exact(self.dim).zip(&self.ids) {
            top.push(dot(row, query), id);
        }
        top.into_sorted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_ranking() {
        let mut index = FlatIndex::new(2);
        index.add(&[5, 9, 2], &[1.0, 0.0, 0.6, 0.8, 0.0, 1.0]);
        assert_eq!(index.len(), 3);

        let hits = index.search(&[0.0, 1.0], 2);
        assert_eq!(hits, vec![(1.0, 2), (0.8, 9)]);

        // k larger than the index returns what exists
        assert_eq!(index.search(&[1.0, 0.0], 10).len(), 3);
    }
}
