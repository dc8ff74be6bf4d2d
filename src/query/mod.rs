//! Query engine: turns a query vector into ranked catalog records.
//!
//! With an IVF-PQ index and hybrid search on, the index only proposes
//! `k_approx` candidates and the full-precision store snapshot decides the
//! final order. Slots the index returns that the snapshot does not cover are
//! dropped, since the index may be newer or older than the store.

mod projection;

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;

use crate::clip::{normalize, EmbeddingModel};
use crate::config::{Config, SearchConfig};
use crate::db::{Catalog, ImageRecord};
use crate::error::FinderError;
use crate::index::{IndexKind, SearchIndex, TopK};
use crate::store::{EmbeddingStore, StoreSnapshot};

pub use projection::LossyProjection;

/// Extra candidates fetched so duplicate collapsing can still fill `k`.
const COLLAPSE_OVERFETCH: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub record: ImageRecord,
    pub score: f32,
    pub slot: i64,
}

pub struct QueryEngine {
    catalog: Catalog,
    index: SearchIndex,
    snapshot: StoreSnapshot,
    settings: SearchConfig,
    nprobe: usize,
    projection: Option<LossyProjection>,
    model: Option<Box<dyn EmbeddingModel>>,
}

impl QueryEngine {
    pub fn new(
        catalog: Catalog,
        index: SearchIndex,
        snapshot: StoreSnapshot,
        settings: SearchConfig,
        nprobe: usize,
    ) -> Self {
        Self {
            catalog,
            index,
            snapshot,
            settings,
            nprobe,
            projection: None,
            model: None,
        }
    }

    /// Open the catalog, index artifact and store named by `config`. A
    /// missing index is `IndexUnavailable`.
    pub fn open(config: &Config) -> Result<Self> {
        config.validate()?;
        let index = SearchIndex::load(&config.index.path, config.model.dim)?;
        let catalog = Catalog::from_config(&config.catalog)?;
        let snapshot = EmbeddingStore::from_config(&config.store, config.model.dim).load()?;

        if index.len() > snapshot.filled_slots().len() {
            tracing::warn!(
                index = index.len(),
                store = snapshot.len(),
                "Index holds more vectors than the store; stale slots will be dropped"
            );
        }

        Ok(Self::new(
            catalog,
            index,
            snapshot,
            config.search.clone(),
            config.index.nprobe,
        ))
    }

    /// Attach the model used by `search_text` and `search_image`. A model of
    /// another width needs `allow_lossy_projection`.
    pub fn with_model(mut self, model: Box<dyn EmbeddingModel>) -> Result<Self> {
        if model.dim() != self.index.dim() {
            if !self.settings.allow_lossy_projection {
                return Err(FinderError::DimensionMismatch {
                    expected: self.index.dim(),
                    actual: model.dim(),
                }
                .into());
            }
            self.projection = Some(LossyProjection::new(model.dim(), self.index.dim()));
        }
        self.model = Some(model);
        Ok(self)
    }

    pub fn index(&self) -> &SearchIndex {
        &self.index
    }

    pub fn snapshot(&self) -> &StoreSnapshot {
        &self.snapshot
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Top `k` records for `query`, best first.
    pub fn search_by_vector(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        let query = self.prepare_query(query)?;
        let ntotal = self.index.len();
        let k = k.min(ntotal);

        let ranked: Vec<(f32, i64)> =
            if self.settings.hybrid && self.index.kind() == IndexKind::IvfPq {
                let k_approx = self.settings.k_approx.max(k).min(ntotal);
                let candidates = self.index.search(&query, k_approx, self.nprobe)?;
                let mut top = TopK::new(k);
                for slot in candidates.ids {
                    // Out-of-range and missing slots have no exact score
                    if let Some(score) = self.snapshot.dot(slot, &query) {
                        top.push(score, slot);
                    }
                }
                top.into_sorted()
            } else {
                let output = self.index.search(&query, k, self.nprobe)?;
                output.scores.into_iter().zip(output.ids).collect()
            };

        let store_len = self.snapshot.len() as i64;
        let valid: Vec<(f32, i64)> = ranked
            .into_iter()
            .filter(|&(_, slot)| slot >= 0 && slot < store_len)
            .collect();

        let slots: Vec<i64> = valid.iter().map(|&(_, slot)| slot).collect();
        let mut records = self.catalog.records_by_embedding_indices(&slots)?;

        let mut hits: Vec<SearchHit> = valid
            .into_iter()
            .filter_map(|(score, slot)| {
                records
                    .remove(&slot)
                    .map(|record| SearchHit { record, score, slot })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(hits)
    }

    pub fn search_text(&self, text: &str, k: usize) -> Result<Vec<SearchHit>> {
        let query = self.model()?.encode_text(text)?;
        self.search_encoded(&query, k)
    }

    pub fn search_image(&self, path: &Path, k: usize) -> Result<Vec<SearchHit>> {
        let model = self.model()?;
        let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let query = model
            .encode_image(&bytes)
            .map_err(|e| FinderError::InvalidImage {
                path: path.to_path_buf(),
                reason: format!("{:#}", e),
            })?;
        self.search_encoded(&query, k)
    }

    fn search_encoded(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if !self.settings.collapse_duplicates {
            return self.search_by_vector(query, k);
        }
        let hits = self.search_by_vector(query, k.saturating_mul(COLLAPSE_OVERFETCH))?;
        let mut hits = collapse_duplicates(hits);
        hits.truncate(k);
        Ok(hits)
    }

    fn model(&self) -> Result<&dyn EmbeddingModel> {
        self.model
            .as_deref()
            .ok_or_else(|| FinderError::ModelUnavailable("no embedding model configured".to_string()).into())
    }

    /// Dimension check, optional projection, normalization.
    fn prepare_query(&self, query: &[f32]) -> Result<Vec<f32>> {
        let mut query = if query.len() == self.index.dim() {
            query.to_vec()
        } else {
            match &self.projection {
                Some(projection) if projection.source_dim() == query.len() => projection.project(query)?,
                _ => {
                    return Err(FinderError::DimensionMismatch {
                        expected: self.index.dim(),
                        actual: query.len(),
                    }
                    .into())
                }
            }
        };
        normalize(&mut query);
        Ok(query)
    }
}

/// Keep only the first hit of each duplicate cluster.
pub fn collapse_duplicates(hits: Vec<SearchHit>) -> Vec<SearchHit> {
    let mut seen = HashSet::new();
    hits.into_iter()
        .filter(|hit| seen.insert(hit.record.canonical_id()))
        .collect()
}
