use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet};

use super::{IndexingPipeline, PipelineProgress};
use crate::index::{IndexKind, SearchIndex};
use crate::store::StoreSnapshot;

/// Row norms further than this from 1 are reported by `verify`.
const NORM_TOLERANCE: f32 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBuildReport {
    pub kind: IndexKind,
    /// Vectors in the saved index.
    pub vectors: usize,
    /// Vectors added by this run.
    pub added: usize,
    /// The index was trained from scratch rather than extended.
    pub rebuilt: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub records_checked: usize,
    /// Records pointing past the end of the store.
    pub out_of_range: Vec<i64>,
    /// Records pointing at a slot that was never filled.
    pub zero_slots: Vec<i64>,
    /// Records sharing a slot with a lower-id record.
    pub shared_slots: Vec<i64>,
    /// Filled slots no record points at. Harmless but wasted.
    pub orphan_slots: usize,
    /// Records whose vector is not unit length.
    pub bad_norms: Vec<i64>,
}

impl VerifyReport {
    /// Every record resolves to its own unit vector.
    pub fn is_consistent(&self) -> bool {
        self.out_of_range.is_empty()
            && self.zero_slots.is_empty()
            && self.shared_slots.is_empty()
            && self.bad_norms.is_empty()
    }

    /// Record ids that need a fresh embedding.
    pub fn broken_records(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .out_of_range
            .iter()
            .chain(&self.zero_slots)
            .chain(&self.shared_slots)
            .chain(&self.bad_norms)
            .copied()
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

impl IndexingPipeline {
    /// Build the search index over every filled store slot and save it.
    ///
    /// Without `force`, an existing artifact is extended with the slots it
    /// lacks instead of being retrained.
    pub fn build_index(&self, force: bool) -> Result<IndexBuildReport> {
        let snapshot = self.store.load()?;
        let slots = snapshot.filled_slots();
        if slots.is_empty() {
            bail!("No embeddings to index; run the embed stage first");
        }
        let dim = snapshot.dim();
        let path = &self.config.index.path;

        if !force && path.exists() {
            match SearchIndex::load(path, dim) {
                Ok(mut index) => {
                    let present: HashSet<i64> = index.ids().into_iter().collect();
                    let missing: Vec<i64> =
                        slots.into_iter().filter(|slot| !present.contains(slot)).collect();
                    if !missing.is_empty() {
                        index.add(&missing, &gather(&snapshot, &missing))?;
                        index.save(path)?;
                    }
                    tracing::info!(
                        kind = %index.kind(),
                        vectors = index.len(),
                        added = missing.len(),
                        "Extended search index"
                    );
                    self.report(PipelineProgress::Completed { stage: "index" });
                    return Ok(IndexBuildReport {
                        kind: index.kind(),
                        vectors: index.len(),
                        added: missing.len(),
                        rebuilt: false,
                    });
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Existing index unusable, rebuilding");
                }
            }
        }

        let index = SearchIndex::build(&slots, &gather(&snapshot, &slots), dim, &self.config.index)?;
        index.save(path)?;
        tracing::info!(
            kind = %index.kind(),
            vectors = index.len(),
            path = %path.display(),
            "Built search index"
        );
        self.report(PipelineProgress::Completed { stage: "index" });
        Ok(IndexBuildReport {
            kind: index.kind(),
            vectors: index.len(),
            added: slots.len(),
            rebuilt: true,
        })
    }

    /// Cross-check catalog slot assignments against the store.
    pub fn verify(&self) -> Result<VerifyReport> {
        let snapshot = self.store.load()?;
        let assignments = self.catalog.embedding_assignments()?;
        let mut report = VerifyReport {
            records_checked: assignments.len(),
            ..Default::default()
        };

        let mut owners: HashMap<i64, i64> = HashMap::new();
        for &(id, slot) in &assignments {
            let Some(row) = snapshot.row(slot) else {
                report.out_of_range.push(id);
                continue;
            };
            // Assignments come ordered by id, so the first owner keeps the slot
            if owners.contains_key(&slot) {
                report.shared_slots.push(id);
            } else {
                owners.insert(slot, id);
            }
            if snapshot.is_zero(slot) {
                report.zero_slots.push(id);
                continue;
            }
            let norm = row.iter().map(|x| x * x).sum::<f32>().sqrt();
            if (norm - 1.0).abs() > NORM_TOLERANCE {
                report.bad_norms.push(id);
            }
        }

        report.orphan_slots = snapshot
            .filled_slots()
            .iter()
            .filter(|slot| !owners.contains_key(slot))
            .count();

        if report.is_consistent() {
            tracing::info!(
                records = report.records_checked,
                orphan_slots = report.orphan_slots,
                "Store and catalog are consistent"
            );
        } else {
            tracing::warn!(
                out_of_range = report.out_of_range.len(),
                zero_slots = report.zero_slots.len(),
                shared_slots = report.shared_slots.len(),
                bad_norms = report.bad_norms.len(),
                "Store and catalog disagree; regenerate the affected records"
            );
        }
        Ok(report)
    }
}

/// Row-major copy of the vectors at `slots`.
fn gather(snapshot: &StoreSnapshot, slots: &[i64]) -> Vec<f32> {
    let mut data = Vec::with_capacity(slots.len() * snapshot.dim());
    for &slot in slots {
        if let Some(row) = snapshot.row(slot) {
            data.extend(row.iter().copied());
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::clip::test_support::HashModel;
    use crate::db::test_support::new_image;
    use crate::query::{collapse_duplicates, QueryEngine};
    use crate::scanner::PerceptualHash;

    #[test]
    fn test_build_then_extend_ivf_index() {
        let root = tempfile::tempdir().unwrap();
        let images = write_images(root.path(), 40);
        let mut config = test_config(root.path());
        config.index.flat_threshold = 16;
        let pipeline = IndexingPipeline::new(config)
            .unwrap()
            .with_model(Box::new(HashModel { dim: DIM }))
            .unwrap();

        assert!(pipeline.build_index(false).is_err());

        pipeline.scan_and_register(&images).unwrap();
        pipeline.generate_embeddings(false).unwrap();
        let built = pipeline.build_index(false).unwrap();
        assert_eq!(built.kind, IndexKind::IvfPq);
        assert_eq!(built.vectors, 40);
        assert!(built.rebuilt);
        assert!(pipeline.stats().unwrap().index_ready);

        for i in 40..45 {
            crate::scanner::test_support::write_test_image(&images.join(format!("img_{i:04}.png")), i);
        }
        pipeline.scan_and_register(&images).unwrap();
        pipeline.generate_embeddings(false).unwrap();
        let extended = pipeline.build_index(false).unwrap();
        assert_eq!(extended.kind, IndexKind::IvfPq);
        assert_eq!(extended.vectors, 45);
        assert_eq!(extended.added, 5);
        assert!(!extended.rebuilt);

        let forced = pipeline.build_index(true).unwrap();
        assert!(forced.rebuilt);
        assert_eq!(forced.vectors, 45);
    }

    #[test]
    fn test_verify_reports_broken_assignments() {
        let root = tempfile::tempdir().unwrap();
        let images = write_images(root.path(), 4);
        let pipeline = pipeline(root.path());
        pipeline.scan_and_register(&images).unwrap();
        pipeline.generate_embeddings(false).unwrap();
        assert!(pipeline.verify().unwrap().is_consistent());

        // Slot 10 holds a unit vector, 11 an unnormalized one, 4..=9 stay zero
        let mut unit = vec![0.0; DIM];
        unit[0] = 1.0;
        let store = pipeline.store();
        store.commit(0, &[unit, vec![0.5; DIM]], &[10, 11], &[]).unwrap();

        let catalog = pipeline.catalog();
        let ids: Vec<i64> = catalog
            .embedding_assignments()
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        catalog.assign_embedding_index(ids[1], 99).unwrap();
        catalog.assign_embedding_index(ids[2], 7).unwrap();
        catalog.assign_embedding_index(ids[3], 11).unwrap();

        let report = pipeline.verify().unwrap();
        assert!(!report.is_consistent());
        assert_eq!(report.records_checked, 4);
        assert_eq!(report.out_of_range, vec![ids[1]]);
        assert_eq!(report.zero_slots, vec![ids[2]]);
        assert_eq!(report.bad_norms, vec![ids[3]]);
        assert!(report.shared_slots.is_empty());
        // Slots 1, 2, 3 lost their records and nobody claims slot 10
        assert_eq!(report.orphan_slots, 4);
        assert_eq!(report.broken_records(), vec![ids[1], ids[2], ids[3]]);
    }

    #[test]
    fn test_duplicates_collapse_in_search_results() {
        let root = tempfile::tempdir().unwrap();
        let pipeline = pipeline(root.path());
        let catalog = pipeline.catalog();
        let model = HashModel { dim: DIM };

        let base = 0xF0F0_F0F0_0F0F_0F0Fu64;
        let hashes = [
            base,
            base,
            base ^ 0b111,
            base ^ 0xFFFF_FFFF_FF00_0000,
        ];
        let mut ids = Vec::new();
        for (i, hash) in hashes.iter().enumerate() {
            let hex = PerceptualHash(*hash).to_hex();
            let path = format!("/photos/{}.jpg", i);
            ids.push(catalog.register(&new_image(&path, Some(&hex))).unwrap());
        }

        // The two exact copies and the near copy embed close to the original
        let a = model.vector_for(b"a");
        let mut vectors = vec![a.clone(), a.clone()];
        let mut near = a.clone();
        near[0] += 0.05;
        crate::clip::normalize(&mut near);
        vectors.push(near);
        vectors.push(model.vector_for(b"far"));

        let slots: Vec<i64> = catalog.reserve_slots(4).unwrap().collect();
        assert!(pipeline.store().commit(0, &vectors, &slots, &ids).unwrap().is_merged());
        let pairs: Vec<(i64, i64)> = ids.iter().copied().zip(slots.iter().copied()).collect();
        catalog.assign_embedding_indices(&pairs).unwrap();

        let dups = pipeline.detect_duplicates().unwrap();
        assert_eq!(dups.duplicates, 2);
        assert_eq!(catalog.canonical_id(ids[1]).unwrap(), ids[0]);
        assert_eq!(catalog.canonical_id(ids[2]).unwrap(), ids[0]);
        assert_eq!(catalog.canonical_id(ids[3]).unwrap(), ids[3]);

        pipeline.build_index(false).unwrap();
        let engine = QueryEngine::open(pipeline.config()).unwrap();
        let hits = engine.search_by_vector(&a, 4).unwrap();
        assert_eq!(hits.len(), 4);
        assert_eq!(hits[0].record.id, ids[0]);
        assert!((hits[0].score - 1.0).abs() < 1e-4);

        let collapsed = collapse_duplicates(hits);
        let canonicals: Vec<i64> = collapsed.iter().map(|h| h.record.canonical_id()).collect();
        assert_eq!(canonicals.len(), 2);
        assert_eq!(canonicals[0], ids[0]);
        assert!(canonicals.contains(&ids[3]));
    }
}
