//! Indexing pipeline: scan, register, embed, index.
//!
//! Nothing is kept in memory between runs. What is left to do is always
//! re-derived from the catalog plus any orphaned store buffers, which are
//! merged when the pipeline is constructed.

mod embed;
mod maintenance;
mod register;

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use crate::clip::EmbeddingModel;
use crate::config::Config;
use crate::db::Catalog;
use crate::duplicates::{DuplicateDetector, DuplicateReport};
use crate::error::FinderError;
use crate::scanner::{ThumbnailManager, Thumbnailer};
use crate::store::{EmbeddingStore, RecoveryReport};

pub use embed::EmbedReport;
pub use maintenance::{IndexBuildReport, VerifyReport};
pub use register::RegisterReport;

pub const EMBEDDING_JOB: &str = "embedding_generation";
pub const REGISTRATION_JOB: &str = "registration";

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineProgress {
    Discovered { files: usize, unseen: usize },
    Registered { done: usize, total: usize },
    Embedded { worker: usize, processed: usize, failed: usize, total: usize },
    Completed { stage: &'static str },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub total: usize,
    pub processed: usize,
    pub unprocessed: usize,
    pub failed: usize,
    pub duplicates: usize,
    pub store_slots: usize,
    pub pending_buffers: usize,
    pub index_ready: bool,
}

pub struct IndexingPipeline {
    config: Config,
    catalog: Catalog,
    store: EmbeddingStore,
    model: Option<Box<dyn EmbeddingModel>>,
    thumbnailer: Option<Box<dyn Thumbnailer>>,
    progress_tx: Option<mpsc::Sender<PipelineProgress>>,
    cancel: Arc<AtomicBool>,
    recovery: RecoveryReport,
}

impl IndexingPipeline {
    /// Open the catalog and store and merge any buffers a previous run left
    /// behind.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let catalog = Catalog::from_config(&config.catalog)?;
        let store = EmbeddingStore::from_config(&config.store, config.model.dim);
        let thumbnailer: Option<Box<dyn Thumbnailer>> = if config.thumbnails.enabled {
            Some(Box::new(ThumbnailManager::new(&config.thumbnails)))
        } else {
            None
        };

        let mut pipeline = Self {
            config,
            catalog,
            store,
            model: None,
            thumbnailer,
            progress_tx: None,
            cancel: Arc::new(AtomicBool::new(false)),
            recovery: RecoveryReport::default(),
        };
        pipeline.recovery = pipeline.recover()?;
        Ok(pipeline)
    }

    pub fn with_model(mut self, model: Box<dyn EmbeddingModel>) -> Result<Self> {
        if model.dim() != self.config.model.dim {
            return Err(FinderError::DimensionMismatch {
                expected: self.config.model.dim,
                actual: model.dim(),
            }
            .into());
        }
        self.model = Some(model);
        Ok(self)
    }

    pub fn with_thumbnailer(mut self, thumbnailer: Box<dyn Thumbnailer>) -> Self {
        self.thumbnailer = Some(thumbnailer);
        self
    }

    pub fn with_progress(mut self, tx: mpsc::Sender<PipelineProgress>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    /// Flag that stops scan and embed loops at the next batch boundary.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn store(&self) -> &EmbeddingStore {
        &self.store
    }

    /// What the startup recovery pass did.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Merge orphaned buffers, attach their vectors to records that are
    /// still unassigned, and move the slot allocator past the store.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let report = self.store.recover()?;

        let mut assignments = Vec::new();
        for &(record_id, slot) in &report.assignments {
            match self.catalog.get_record(record_id)? {
                Some(record) if record.embedding_index.is_none() => assignments.push((record_id, slot)),
                Some(record) if record.embedding_index != Some(slot) => {
                    tracing::warn!(
                        record_id,
                        slot,
                        assigned = ?record.embedding_index,
                        "Recovered slot not attached; record already has another"
                    );
                }
                Some(_) => {}
                None => tracing::warn!(record_id, slot, "Recovered slot belongs to an unknown record"),
            }
        }
        if !assignments.is_empty() {
            self.catalog.assign_embedding_indices(&assignments)?;
            tracing::info!(records = assignments.len(), "Attached recovered embeddings");
        }

        match self.store.len() {
            Ok(len) => self.catalog.raise_slot_floor(len as i64)?,
            Err(e) => tracing::error!(error = %e, "Embedding store unreadable; it will be reset by the next commit"),
        }
        Ok(report)
    }

    pub fn stats(&self) -> Result<PipelineStats> {
        let counts = self.catalog.counts()?;
        Ok(PipelineStats {
            total: counts.total,
            processed: counts.embedded,
            unprocessed: self.catalog.count_unprocessed(0, 1)?,
            failed: counts.failed,
            duplicates: counts.duplicates,
            store_slots: self.store.len()?,
            pending_buffers: self.store.pending_buffers()?,
            index_ready: self.config.index.path.exists(),
        })
    }

    pub fn detect_duplicates(&self) -> Result<DuplicateReport> {
        DuplicateDetector::from_config(&self.config.duplicates).run(&self.catalog)
    }

    fn model(&self) -> Result<&dyn EmbeddingModel> {
        self.model
            .as_deref()
            .ok_or_else(|| FinderError::ModelUnavailable("no embedding model configured".to_string()).into())
    }

    fn report(&self, progress: PipelineProgress) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.send(progress);
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}
