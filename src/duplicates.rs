//! Perceptual-hash duplicate detection.
//!
//! Records whose hashes are within `threshold` bits of each other are linked,
//! and every connected component becomes one cluster whose lowest id is the
//! canonical record. Linking is transitive: A~B and B~C put A, B and C in
//! one cluster even when A and C are further apart than the threshold.

use anyhow::Result;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::config::DuplicateConfig;
use crate::db::Catalog;
use crate::scanner::PerceptualHash;

/// How candidate pairs are found before the exact distance check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStrategy {
    /// Compare every pair. Quadratic in the number of hashed records.
    Pairwise,
    /// Bucket hashes by bit bands first. Finds exactly the same pairs as
    /// `Pairwise` when `threshold + 1` bands fit in the hash.
    #[default]
    Banded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DuplicateReport {
    pub hashed: usize,
    pub invalid_hashes: usize,
    pub clusters: usize,
    pub duplicates: usize,
}

pub struct DuplicateDetector {
    threshold: u32,
    strategy: MatchStrategy,
}

impl DuplicateDetector {
    pub fn new(threshold: u32, strategy: MatchStrategy) -> Self {
        Self {
            threshold,
            strategy,
        }
    }

    pub fn from_config(config: &DuplicateConfig) -> Self {
        Self::new(config.threshold, config.strategy)
    }

    /// Detect duplicates across the whole catalog and replace the stored
    /// relation with the result.
    pub fn run(&self, catalog: &Catalog) -> Result<DuplicateReport> {
        let mut report = DuplicateReport::default();
        let mut hashes = Vec::new();

        for (id, hex) in catalog.hashed_records()? {
            match PerceptualHash::from_hex(&hex) {
                Ok(hash) => hashes.push((id, hash)),
                Err(_) => {
                    tracing::warn!(id, hash = %hex, "Skipping record with unparseable perceptual hash");
                    report.invalid_hashes += 1;
                }
            }
        }
        report.hashed = hashes.len();

        let assignments = self.assignments(&hashes);
        let clusters: std::collections::HashSet<i64> =
            assignments.iter().map(|&(_, canonical)| canonical).collect();
        report.clusters = clusters.len();
        report.duplicates = assignments.len();

        catalog.replace_duplicate_assignments(&assignments)?;

        tracing::info!(
            hashed = report.hashed,
            clusters = report.clusters,
            duplicates = report.duplicates,
            threshold = self.threshold,
            strategy = ?self.strategy,
            "Duplicate detection complete"
        );
        Ok(report)
    }

    /// `(duplicate id, canonical id)` for every non-canonical record, sorted
    /// by duplicate id.
    pub fn assignments(&self, hashes: &[(i64, PerceptualHash)]) -> Vec<(i64, i64)> {
        let mut sets = DisjointSet::new(hashes.len());
        for (i, j) in self.matching_pairs(hashes) {
            sets.union(i, j);
        }

        // Canonical = lowest id in each component
        let mut min_id: HashMap<usize, i64> = HashMap::new();
        for (i, &(id, _)) in hashes.iter().enumerate() {
            let root = sets.find(i);
            let entry = min_id.entry(root).or_insert(id);
            if id < *entry {
                *entry = id;
            }
        }

        let mut assignments: Vec<(i64, i64)> = hashes
            .iter()
            .enumerate()
            .filter_map(|(i, &(id, _))| {
                let canonical = min_id[&sets.find(i)];
                (canonical != id).then_some((id, canonical))
            })
            .collect();
        assignments.sort_unstable();
        assignments
    }

    /// Clusters (canonical id -> members, canonical first) with more than
    /// one member.
    pub fn clusters(&self, hashes: &[(i64, PerceptualHash)]) -> BTreeMap<i64, Vec<i64>> {
        let mut clusters: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
        for (duplicate, canonical) in self.assignments(hashes) {
            clusters
                .entry(canonical)
                .or_insert_with(|| vec![canonical])
                .push(duplicate);
        }
        clusters
    }

    /// Index pairs `(i, j)` into `hashes` within the threshold.
    fn matching_pairs(&self, hashes: &[(i64, PerceptualHash)]) -> Vec<(usize, usize)> {
        let bands = self.threshold + 1;
        match self.strategy {
            MatchStrategy::Banded if bands <= PerceptualHash::BITS => {
                self.banded_pairs(hashes, bands)
            }
            _ => self.pairwise_pairs(hashes),
        }
    }

    fn pairwise_pairs(&self, hashes: &[(i64, PerceptualHash)]) -> Vec<(usize, usize)> {
        let threshold = self.threshold;
        (0..hashes.len())
            .into_par_iter()
            .flat_map_iter(|i| {
                let hi = hashes[i].1;
                hashes[i + 1..]
                    .iter()
                    .enumerate()
                    .filter(move |(_, (_, hj))| hi.distance(hj) <= threshold)
                    .map(move |(offset, _)| (i, i + 1 + offset))
            })
            .collect()
    }

    /// Pigeonhole prefilter: with `threshold + 1` disjoint bands, two hashes
    /// at distance <= threshold agree exactly on at least one band.
    fn banded_pairs(&self, hashes: &[(i64, PerceptualHash)], bands: u32) -> Vec<(usize, usize)> {
        let mut pairs = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for (start, width) in band_layout(bands) {
            let mask = if width == 64 { u64::MAX } else { (1u64 << width) - 1 };
            let mut buckets: HashMap<u64, Vec<usize>> = HashMap::new();
            for (i, (_, hash)) in hashes.iter().enumerate() {
                buckets.entry((hash.0 >> start) & mask).or_default().push(i);
            }

            for members in buckets.values().filter(|m| m.len() > 1) {
                for (a, &i) in members.iter().enumerate() {
                    for &j in &members[a + 1..] {
                        if hashes[i].1.distance(&hashes[j].1) <= self.threshold
                            && seen.insert((i, j))
                        {
                            pairs.push((i, j));
                        }
                    }
                }
            }
        }

        pairs
    }
}

/// `(shift, width)` of each band; widths differ by at most one bit.
fn band_layout(bands: u32) -> Vec<(u32, u32)> {
    let base = PerceptualHash::BITS / bands;
    let extra = PerceptualHash::BITS % bands;
    let mut layout = Vec::with_capacity(bands as usize);
    let mut start = 0;
    for band in 0..bands {
        let width = base + u32::from(band < extra);
        layout.push((start, width));
        start += width;
    }
    layout
}

struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{new_image, open_temp};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn flip(hash: u64, bits: &[u32]) -> u64 {
        bits.iter().fold(hash, |h, b| h ^ (1u64 << b))
    }

    #[test]
    fn test_band_layout_covers_all_bits() {
        for bands in 1..=64 {
            let layout = band_layout(bands);
            assert_eq!(layout.len(), bands as usize);
            assert_eq!(layout.iter().map(|(_, w)| w).sum::<u32>(), 64);
            assert_eq!(layout[0].0, 0);
        }
    }

    #[test]
    fn test_threshold_example() {
        // Distances 0, 3 and 40 from A
        let a = 0x0123_4567_89ab_cdefu64;
        let hashes = vec![
            (1, PerceptualHash(a)),
            (2, PerceptualHash(a)),
            (3, PerceptualHash(flip(a, &[0, 17, 63]))),
            (4, PerceptualHash(flip(a, &(0..40).collect::<Vec<_>>()))),
        ];

        for strategy in [MatchStrategy::Pairwise, MatchStrategy::Banded] {
            let detector = DuplicateDetector::new(5, strategy);
            assert_eq!(detector.assignments(&hashes), vec![(2, 1), (3, 1)]);
        }
    }

    #[test]
    fn test_transitive_clusters_use_min_id() {
        let base = 0u64;
        let hashes = vec![
            (10, PerceptualHash(flip(base, &[0, 1, 2, 3]))),
            (7, PerceptualHash(base)),
            (12, PerceptualHash(flip(base, &[0, 1, 2, 3, 4, 5, 6, 7]))),
        ];
        // 7~10 (4 bits) and 10~12 (4 bits) but 7 and 12 are 8 apart
        let detector = DuplicateDetector::new(4, MatchStrategy::Banded);
        assert_eq!(detector.assignments(&hashes), vec![(10, 7), (12, 7)]);
        assert_eq!(detector.clusters(&hashes)[&7], vec![7, 10, 12]);
    }

    #[test]
    fn test_banded_matches_pairwise() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut hashes = Vec::new();
        let mut id = 1;
        for _ in 0..60 {
            let center: u64 = rng.random();
            hashes.push((id, PerceptualHash(center)));
            id += 1;
            for _ in 0..3 {
                let bits: Vec<u32> = (0..rng.random_range(0..9)).map(|_| rng.random_range(0..64)).collect();
                hashes.push((id, PerceptualHash(flip(center, &bits))));
                id += 1;
            }
        }

        for threshold in [0, 3, 5, 8] {
            let pairwise = DuplicateDetector::new(threshold, MatchStrategy::Pairwise).assignments(&hashes);
            let banded = DuplicateDetector::new(threshold, MatchStrategy::Banded).assignments(&hashes);
            assert_eq!(pairwise, banded, "threshold {threshold}");
        }
    }

    #[test]
    fn test_run_is_idempotent() {
        let (_dir, catalog) = open_temp();
        let a = catalog.register(&new_image("/a.png", Some("00000000000000ff"))).unwrap();
        let b = catalog.register(&new_image("/b.png", Some("00000000000000fe"))).unwrap();
        let c = catalog.register(&new_image("/c.png", Some("ffffffff00000000"))).unwrap();
        catalog.register(&new_image("/d.png", Some("garbage"))).unwrap();
        catalog.register(&new_image("/e.png", None)).unwrap();

        let detector = DuplicateDetector::new(5, MatchStrategy::Banded);
        let first = detector.run(&catalog).unwrap();
        assert_eq!(first.hashed, 3);
        assert_eq!(first.invalid_hashes, 1);
        assert_eq!(first.clusters, 1);
        assert_eq!(first.duplicates, 1);

        let snapshot = |catalog: &Catalog| {
            [a, b, c]
                .iter()
                .map(|&id| {
                    let r = catalog.get_record(id).unwrap().unwrap();
                    (r.is_duplicate, r.duplicate_of)
                })
                .collect::<Vec<_>>()
        };
        let before = snapshot(&catalog);
        assert_eq!(before, vec![(false, None), (true, Some(a)), (false, None)]);

        let second = detector.run(&catalog).unwrap();
        assert_eq!(first, second);
        assert_eq!(snapshot(&catalog), before);
    }
}
