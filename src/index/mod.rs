//! Approximate nearest-neighbour index over embedding slots.
//!
//! Small corpora get an exact `Flat` index. Larger ones get an `IvfPq`
//! index trained on a sample of the store. Either way the index holds slot
//! numbers as ids and scores by inner product.

pub mod flat;
pub mod ivfpq;
pub mod kmeans;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::config::IndexConfig;
use crate::error::FinderError;
pub use flat::FlatIndex;
pub use ivfpq::{IvfPqIndex, IvfPqParams};

const MAGIC: &[u8; 8] = b"IMFINDX\0";
const VERSION: u32 = 1;

/// Id reported for result positions the index could not fill.
pub const MISSING_ID: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Flat,
    IvfPq,
}

impl std::fmt::Display for IndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexKind::Flat => write!(f, "flat"),
            IndexKind::IvfPq => write!(f, "ivf-pq"),
        }
    }
}

/// Parallel `scores`/`ids`, best first, always `k` long.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutput {
    pub scores: Vec<f32>,
    pub ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SearchIndex {
    Flat(FlatIndex),
    IvfPq(IvfPqIndex),
}

impl SearchIndex {
    /// Build an index over `ids.len()` rows of `vectors`.
    pub fn build(ids: &[i64], vectors: &[f32], dim: usize, config: &IndexConfig) -> Result<Self> {
        check_rows(ids, vectors, dim)?;
        let n = ids.len();

        let mut index = if n < config.flat_threshold || n <= config.nlist {
            tracing::info!(vectors = n, "Building flat index");
            SearchIndex::Flat(FlatIndex::new(dim))
        } else {
            let params = IvfPqParams {
                nlist: config.nlist,
                m: config.m,
                nbits: config.nbits,
                iterations: config.kmeans_iterations,
                train_points_per_list: config.train_points_per_list,
                seed: config.seed,
            };
            SearchIndex::IvfPq(IvfPqIndex::train(vectors, dim, &params)?)
        };

        index.add(ids, vectors)?;
        Ok(index)
    }

    pub fn kind(&self) -> IndexKind {
        match self {
            SearchIndex::Flat(_) => IndexKind::Flat,
            SearchIndex::IvfPq(_) => IndexKind::IvfPq,
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            SearchIndex::Flat(index) => index.dim(),
            SearchIndex::IvfPq(index) => index.dim(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SearchIndex::Flat(index) => index.len(),
            SearchIndex::IvfPq(index) => index.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every slot the index holds.
    pub fn ids(&self) -> Vec<i64> {
        match self {
            SearchIndex::Flat(index) => index.ids().to_vec(),
            SearchIndex::IvfPq(index) => index.ids(),
        }
    }

    pub fn add(&mut self, ids: &[i64], vectors: &[f32]) -> Result<()> {
        check_rows(ids, vectors, self.dim())?;
        match self {
            SearchIndex::Flat(index) => index.add(ids, vectors),
            SearchIndex::IvfPq(index) => index.add(ids, vectors),
        }
        Ok(())
    }

    /// Top `k` by inner product, with `k` capped at the number of stored
    /// vectors. Positions the probed lists could not fill hold `MISSING_ID`.
    /// `nprobe` only matters for `IvfPq`.
    pub fn search(&self, query: &[f32], k: usize, nprobe: usize) -> Result<SearchOutput> {
        if query.len() != self.dim() {
            return Err(FinderError::DimensionMismatch {
                expected: self.dim(),
                actual: query.len(),
            }
            .into());
        }

        let k = k.min(self.len());
        let hits = match self {
            SearchIndex::Flat(index) => index.search(query, k),
            SearchIndex::IvfPq(index) => index.search(query, k, nprobe),
        };

        let mut output = SearchOutput {
            scores: Vec::with_capacity(k),
            ids: Vec::with_capacity(k),
        };
        for (score, id) in hits {
            output.scores.push(score);
            output.ids.push(id);
        }
        output.scores.resize(k, f32::NEG_INFINITY);
        output.ids.resize(k, MISSING_ID);
        Ok(output)
    }

    /// Write the artifact atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = std::path::PathBuf::from(tmp);

        {
            let file = File::create(&tmp)
                .with_context(|| format!("Failed to create {}", tmp.display()))?;
            let mut writer = BufWriter::new(file);
            writer.write_all(MAGIC)?;
            writer.write_all(&VERSION.to_le_bytes())?;
            bincode::serialize_into(&mut writer, self)
                .with_context(|| format!("Failed to serialize index to {}", tmp.display()))?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, path)?;

        tracing::info!(
            path = %path.display(),
            kind = %self.kind(),
            vectors = self.len(),
            "Saved search index"
        );
        Ok(())
    }

    /// Read an artifact and check it was built for `expected_dim`.
    pub fn load(path: &Path, expected_dim: usize) -> Result<Self> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FinderError::IndexUnavailable(path.to_path_buf()).into())
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to open {}", path.display())),
        };
        let mut reader = BufReader::new(file);

        let mut header = [0u8; 12];
        if reader.read_exact(&mut header).is_err() || &header[..8] != MAGIC {
            return Err(FinderError::IndexCorrupt(format!(
                "{} is not a search index",
                path.display()
            ))
            .into());
        }
        let version = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        if version != VERSION {
            return Err(FinderError::IndexCorrupt(format!(
                "{} has version {}, expected {}",
                path.display(),
                version,
                VERSION
            ))
            .into());
        }

        let index: SearchIndex = bincode::deserialize_from(&mut reader)
            .map_err(|e| FinderError::IndexCorrupt(format!("{}: {}", path.display(), e)))?;

        if index.dim() != expected_dim {
            return Err(FinderError::DimensionMismatch {
                expected: expected_dim,
                actual: index.dim(),
            }
            .into());
        }

        tracing::debug!(path = %path.display(), kind = %index.kind(), vectors = index.len(), "Loaded search index");
        Ok(index)
    }
}

fn check_rows(ids: &[i64], vectors: &[f32], dim: usize) -> Result<()> {
    if dim == 0 || vectors.len() % dim != 0 {
        return Err(FinderError::DimensionMismatch {
            expected: dim,
            actual: if ids.is_empty() { vectors.len() } else { vectors.len() / ids.len() },
        }
        .into());
    }
    anyhow::ensure!(
        vectors.len() / dim == ids.len(),
        "{} vectors given for {} ids",
        vectors.len() / dim,
        ids.len()
    );
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Scored {
    score: f32,
    id: i64,
}

impl Eq for Scored {}

impl Ord for Scored {
    /// Higher score first, lower id on ties.
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Largest heap `TopK` reserves up front; bigger heaps grow on demand.
const TOPK_PREALLOC: usize = 4096;

/// Bounded min-heap keeping the best `k` scores seen.
pub(crate) struct TopK {
    k: usize,
    heap: BinaryHeap<Reverse<Scored>>,
}

impl TopK {
    pub(crate) fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k.min(TOPK_PREALLOC) + 1),
        }
    }

    pub(crate) fn push(&mut self, score: f32, id: i64) {
        if self.k == 0 {
            return;
        }
        let item = Scored { score, id };
        if self.heap.len() < self.k {
            self.heap.push(Reverse(item));
        } else if let Some(Reverse(worst)) = self.heap.peek() {
            if item > *worst {
                self.heap.pop();
                self.heap.push(Reverse(item));
            }
        }
    }

    /// Best first.
    pub(crate) fn into_sorted(self) -> Vec<(f32, i64)> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(s)| (s.score, s.id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_unit_rows(n: usize, dim: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut data = Vec::with_capacity(n * dim);
        for _ in 0..n {
            let row: Vec<f32> = (0..dim).map(|_| rng.random_range(-1.0f32..1.0)).collect();
            let norm = row.iter().map(|x| x * x).sum::<f32>().sqrt();
            data.extend(row.iter().map(|x| x / norm));
        }
        data
    }

    fn small_config() -> IndexConfig {
        IndexConfig {
            nlist: 8,
            m: 4,
            nbits: 8,
            nprobe: 8,
            ..IndexConfig::default()
        }
    }

    #[test]
    fn test_top_k_orders_and_bounds() {
        let mut top = TopK::new(3);
        for (score, id) in [(0.1, 1), (0.9, 2), (0.5, 3), (0.9, 0), (0.2, 4)] {
            top.push(score, id);
        }
        assert_eq!(top.into_sorted(), vec![(0.9, 0), (0.9, 2), (0.5, 3)]);
        assert!(TopK::new(0).into_sorted().is_empty());

        let mut huge = TopK::new(usize::MAX);
        huge.push(0.5, 1);
        assert_eq!(huge.into_sorted(), vec![(0.5, 1)]);
    }

    #[test]
    fn test_build_selects_kind() {
        let dim = 8;
        let config = small_config();

        let data = random_unit_rows(50, dim, 1);
        let ids: Vec<i64> = (0..50).collect();
        let index = SearchIndex::build(&ids, &data, dim, &config).unwrap();
        assert_eq!(index.kind(), IndexKind::Flat);

        let data = random_unit_rows(300, dim, 2);
        let ids: Vec<i64> = (0..300).collect();
        let index = SearchIndex::build(&ids, &data, dim, &config).unwrap();
        assert_eq!(index.kind(), IndexKind::IvfPq);
        assert_eq!(index.len(), 300);

        // Above the flat threshold but not above nlist
        let config = IndexConfig {
            flat_threshold: 10,
            nlist: 64,
            ..small_config()
        };
        let data = random_unit_rows(40, dim, 3);
        let ids: Vec<i64> = (0..40).collect();
        let index = SearchIndex::build(&ids, &data, dim, &config).unwrap();
        assert_eq!(index.kind(), IndexKind::Flat);
    }

    #[test]
    fn test_search_pads_missing_entries() {
        let dim = 4;
        let ids = [3, 7];
        let data = [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0];
        let index = SearchIndex::build(&ids, &data, dim, &small_config()).unwrap();

        // `k` beyond the stored count is capped, not padded
        let output = index.search(&[1.0, 0.0, 0.0, 0.0], 4, 1).unwrap();
        assert_eq!(output.ids, vec![3, 7]);
        assert_eq!(output.scores[0], 1.0);
        let output = index.search(&[1.0, 0.0, 0.0, 0.0], usize::MAX, 1).unwrap();
        assert_eq!(output.ids.len(), 2);

        // One probed list of an IVF index cannot fill `k`
        let groups = 4;
        let ivf_ids: Vec<i64> = (0..(groups * 10) as i64).collect();
        let mut ivf_data = Vec::new();
        for g in 0..groups {
            for _ in 0..10 {
                let mut row = [0.0f32; 4];
                row[g] = 1.0;
                ivf_data.extend_from_slice(&row);
            }
        }
        let ivf_config = IndexConfig {
            flat_threshold: 8,
            nlist: 4,
            m: 2,
            nbits: 4,
            ..IndexConfig::default()
        };
        let ivf = SearchIndex::build(&ivf_ids, &ivf_data, dim, &ivf_config).unwrap();
        assert_eq!(ivf.kind(), IndexKind::IvfPq);
        let output = ivf.search(&[1.0, 0.0, 0.0, 0.0], 40, 1).unwrap();
        assert_eq!(output.ids.len(), 40);
        let found = output.ids.iter().take_while(|&&id| id != MISSING_ID).count();
        assert!(found >= 10 && found < 40);
        assert!(output.ids[found..].iter().all(|&id| id == MISSING_ID));
        assert!(output.scores[found..].iter().all(|&s| s == f32::NEG_INFINITY));
        // Probing every list fills it
        let output = ivf.search(&[1.0, 0.0, 0.0, 0.0], 40, 4).unwrap();
        assert!(!output.ids.contains(&MISSING_ID));

        let err = index.search(&[1.0, 0.0], 1, 1).unwrap_err();
        assert!(crate::error::is_dimension_mismatch(&err));
    }

    #[test]
    fn test_save_load_and_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.bin");
        let dim = 8;
        let data = random_unit_rows(300, dim, 4);
        let ids: Vec<i64> = (100..400).collect();
        let index = SearchIndex::build(&ids, &data, dim, &small_config()).unwrap();
        index.save(&path).unwrap();

        let loaded = SearchIndex::load(&path, dim).unwrap();
        assert_eq!(loaded.kind(), IndexKind::IvfPq);
        let query = &data[..dim];
        assert_eq!(
            loaded.search(query, 10, 8).unwrap(),
            index.search(query, 10, 8).unwrap()
        );

        let err = SearchIndex::load(&path, dim * 2).unwrap_err();
        assert!(crate::error::is_dimension_mismatch(&err));

        let err = SearchIndex::load(&dir.path().join("missing.bin"), dim).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FinderError>(),
            Some(FinderError::IndexUnavailable(_))
        ));

        fs::write(&path, b"garbage").unwrap();
        let err = SearchIndex::load(&path, dim).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FinderError>(),
            Some(FinderError::IndexCorrupt(_))
        ));
    }

    #[test]
    fn test_incremental_add() {
        let dim = 4;
        let mut index = SearchIndex::build(&[0], &[0.0, 1.0, 0.0, 0.0], dim, &small_config()).unwrap();
        index.add(&[5], &[0.0, 0.0, 1.0, 0.0]).unwrap();

        let mut ids = index.ids();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 5]);
        assert_eq!(index.search(&[0.0, 0.0, 1.0, 0.0], 1, 1).unwrap().ids, vec![5]);
        assert!(index.add(&[6], &[1.0, 0.0]).is_err());
    }
}
