//! Embed phase: encode unprocessed records, commit their vectors, then
//! attach slots to records.
//!
//! A record only gets its `embedding_index` after the store reports the
//! batch merged, so a reader never sees a slot whose vector is not there.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;

use super::{IndexingPipeline, PipelineProgress, EMBEDDING_JOB};
use crate::clip::EmbeddingModel;
use crate::config::PipelineConfig;
use crate::db::{Catalog, ImageRecord};
use crate::error::FinderError;
use crate::store::{CommitOutcome, EmbeddingStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmbedReport {
    pub processed: usize,
    pub failed: usize,
    /// Batches safe in a buffer but not merged; the next run attaches them.
    pub deferred_batches: usize,
}

impl EmbedReport {
    fn absorb(&mut self, other: EmbedReport) {
        self.processed += other.processed;
        self.failed += other.failed;
        self.deferred_batches += other.deferred_batches;
    }
}

/// Per-batch result before it is folded into the report.
#[derive(Default)]
struct BatchOutcome {
    embedded: usize,
    failed: usize,
    deferred: bool,
}

struct EmbedWorker<'a> {
    catalog: &'a Catalog,
    store: &'a EmbeddingStore,
    model: &'a dyn EmbeddingModel,
    settings: &'a PipelineConfig,
    worker: usize,
    worker_count: usize,
    cancel: &'a AtomicBool,
    progress_tx: Option<mpsc::Sender<PipelineProgress>>,
    /// Records whose vectors sit in an unmerged buffer.
    pending: &'a HashSet<i64>,
}

impl EmbedWorker<'_> {
    fn job_name(&self) -> String {
        if self.worker_count == 1 {
            EMBEDDING_JOB.to_string()
        } else {
            format!("{}.worker{}", EMBEDDING_JOB, self.worker)
        }
    }

    fn run(&self, resume: bool) -> Result<EmbedReport> {
        let job = self.job_name();
        let (prior_processed, prior_failed) = match (resume, self.catalog.job_status(&job)?) {
            (true, Some(checkpoint)) => {
                tracing::info!(
                    job = %job,
                    processed = checkpoint.processed,
                    marker = ?checkpoint.marker,
                    "Resuming embedding job"
                );
                (checkpoint.processed as usize, checkpoint.failed as usize)
            }
            _ => {
                self.catalog.reset_job(&job)?;
                (0, 0)
            }
        };

        let remaining = self.catalog.count_unprocessed(self.worker, self.worker_count)?;
        let total = prior_processed + prior_failed + remaining;
        let mut report = EmbedReport::default();
        let mut after_id = 0;
        let mut since_checkpoint = 0;

        loop {
            if self.cancel.load(Ordering::Relaxed) {
                tracing::info!(job = %job, "Embedding cancelled");
                break;
            }

            let batch = self.catalog.unprocessed_records_for_worker(
                self.worker,
                self.worker_count,
                after_id,
                self.settings.batch_size,
            )?;
            let Some(last) = batch.last() else {
                break;
            };
            after_id = last.id;

            let outcome = self.embed_batch(&batch)?;
            report.processed += outcome.embedded;
            report.failed += outcome.failed;
            if outcome.deferred {
                report.deferred_batches += 1;
            }

            since_checkpoint += batch.len();
            if since_checkpoint >= self.settings.checkpoint_interval {
                since_checkpoint = 0;
                self.checkpoint(&job, total, prior_processed, prior_failed, &report, after_id)?;
                tracing::info!(
                    job = %job,
                    processed = prior_processed + report.processed,
                    total,
                    "Embedding checkpoint"
                );
            }
            if let Some(tx) = &self.progress_tx {
                let _ = tx.send(PipelineProgress::Embedded {
                    worker: self.worker,
                    processed: prior_processed + report.processed,
                    failed: prior_failed + report.failed,
                    total,
                });
            }
        }

        self.checkpoint(&job, total, prior_processed, prior_failed, &report, after_id)?;
        if !self.cancel.load(Ordering::Relaxed) {
            self.catalog.complete_job(&job)?;
        }
        Ok(report)
    }

    fn checkpoint(
        &self,
        job: &str,
        total: usize,
        prior_processed: usize,
        prior_failed: usize,
        report: &EmbedReport,
        after_id: i64,
    ) -> Result<()> {
        self.catalog.checkpoint(
            job,
            total as i64,
            (prior_processed + report.processed) as i64,
            (prior_failed + report.failed) as i64,
            Some(&after_id.to_string()),
        )
    }

    fn embed_batch(&self, batch: &[ImageRecord]) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();

        let mut readable = Vec::with_capacity(batch.len());
        let mut bytes = Vec::with_capacity(batch.len());
        for record in batch {
            if self.pending.contains(&record.id) {
                continue;
            }
            let path = Path::new(&record.file_path);
            match std::fs::read(path).with_context(|| format!("Failed to read {}", path.display())) {
                Ok(data) => {
                    readable.push(record);
                    bytes.push(data);
                }
                Err(e) => {
                    self.fail(path, &e)?;
                    outcome.failed += 1;
                }
            }
        }

        let refs: Vec<&[u8]> = bytes.iter().map(Vec::as_slice).collect();
        let mut vectors = Vec::with_capacity(readable.len());
        let mut record_ids = Vec::with_capacity(readable.len());
        for (record, encoded) in readable.into_iter().zip(self.model.encode_images(&refs)) {
            let path = Path::new(&record.file_path);
            match encoded {
                Ok(vector) if vector.len() == self.store.dim() => {
                    vectors.push(vector);
                    record_ids.push(record.id);
                }
                Ok(vector) => {
                    let e = anyhow::Error::from(FinderError::DimensionMismatch {
                        expected: self.store.dim(),
                        actual: vector.len(),
                    });
                    self.fail(path, &e)?;
                    outcome.failed += 1;
                }
                Err(e) => {
                    self.fail(path, &e)?;
                    outcome.failed += 1;
                }
            }
        }

        if vectors.is_empty() {
            return Ok(outcome);
        }

        let slots: Vec<i64> = self.catalog.reserve_slots(vectors.len())?.collect();
        match self.store.commit(self.worker, &vectors, &slots, &record_ids)? {
            CommitOutcome::Merged { reset, .. } => {
                if reset {
                    tracing::error!(
                        worker = self.worker,
                        "Embedding store was reset during commit; run verify to find records needing regeneration"
                    );
                }
                let assignments: Vec<(i64, i64)> = record_ids.iter().copied().zip(slots).collect();
                self.catalog.assign_embedding_indices(&assignments)?;
                outcome.embedded = assignments.len();
            }
            CommitOutcome::Deferred { buffer, reason } => {
                tracing::warn!(
                    worker = self.worker,
                    buffer = %buffer.display(),
                    reason = %reason,
                    records = record_ids.len(),
                    "Batch buffered but not merged; the next run attaches it"
                );
                outcome.deferred = true;
            }
        }
        Ok(outcome)
    }

    fn fail(&self, path: &Path, error: &anyhow::Error) -> Result<()> {
        tracing::warn!(path = %path.display(), error = %error, "Embedding failed");
        self.catalog.record_failure(path, &format!("{:#}", error))
    }
}

impl IndexingPipeline {
    /// Embed every unprocessed record using `pipeline.workers` threads.
    /// With `resume` the job's counters continue from its checkpoint;
    /// either way the work itself comes from the catalog.
    pub fn generate_embeddings(&self, resume: bool) -> Result<EmbedReport> {
        let workers = self.config.pipeline.workers.max(1);
        if workers == 1 {
            return self.generate_embeddings_partition(0, 1, resume);
        }

        let model = self.model()?;
        let pending = &self.start_run()?;
        // The pipeline's own connection stays on this thread; each worker
        // opens its own.
        let catalog_config = &self.config.catalog;
        let store = &self.store;
        let settings = &self.config.pipeline;
        let cancel: &AtomicBool = &self.cancel;
        tracing::info!(workers, "Starting parallel embedding workers");
        let results: Vec<Result<EmbedReport>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    let progress_tx = self.progress_tx.clone();
                    s.spawn(move || -> Result<EmbedReport> {
                        let catalog = Catalog::from_config(catalog_config)?;
                        EmbedWorker {
                            catalog: &catalog,
                            store,
                            model,
                            settings,
                            worker,
                            worker_count: workers,
                            cancel,
                            progress_tx,
                            pending,
                        }
                        .run(resume)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(anyhow::anyhow!("Embedding worker panicked")))
                })
                .collect()
        });

        let mut report = EmbedReport::default();
        for result in results {
            report.absorb(result?);
        }
        self.finish_embedding(&report);
        Ok(report)
    }

    /// Run the share of the work owned by `worker` out of `worker_count`, for
    /// callers that spread workers over separate processes.
    pub fn generate_embeddings_partition(
        &self,
        worker: usize,
        worker_count: usize,
        resume: bool,
    ) -> Result<EmbedReport> {
        if worker >= worker_count.max(1) {
            anyhow::bail!("Worker {} is outside 0..{}", worker, worker_count);
        }
        let model = self.model()?;
        let pending = self.start_run()?;
        let report = self
            .worker(&self.catalog, model, &pending, worker, worker_count)
            .run(resume)?;
        self.finish_embedding(&report);
        Ok(report)
    }

    fn worker<'a>(
        &'a self,
        catalog: &'a Catalog,
        model: &'a dyn EmbeddingModel,
        pending: &'a HashSet<i64>,
        worker: usize,
        worker_count: usize,
    ) -> EmbedWorker<'a> {
        EmbedWorker {
            catalog,
            store: &self.store,
            model,
            settings: &self.config.pipeline,
            worker,
            worker_count: worker_count.max(1),
            cancel: &self.cancel,
            progress_tx: self.progress_tx.clone(),
            pending,
        }
    }

    /// Attach buffers deferred by earlier runs, then list the records whose
    /// buffers still could not be merged so they are not encoded twice.
    fn start_run(&self) -> Result<HashSet<i64>> {
        let recovery = self.recover()?;
        if !recovery.deferred {
            return Ok(HashSet::new());
        }
        let pending = self.store.pending_records()?;
        tracing::warn!(
            records = pending.len(),
            "Deferred buffers still unmerged; their records are skipped this run"
        );
        Ok(pending)
    }

    fn finish_embedding(&self, report: &EmbedReport) {
        tracing::info!(
            processed = report.processed,
            failed = report.failed,
            deferred_batches = report.deferred_batches,
            "Embedding complete"
        );
        self.report(PipelineProgress::Completed { stage: "embed" });
    }

    /// Re-encode every embedded record into the slot it already owns.
    pub fn regenerate_embeddings(&self) -> Result<EmbedReport> {
        let model = self.model()?;
        self.recover()?;
        let batch_size = self.config.pipeline.batch_size;
        let mut report = EmbedReport::default();
        let mut after_id = 0;

        loop {
            if self.cancelled() {
                break;
            }
            let batch = self.catalog.embedded_records(after_id, batch_size)?;
            let Some(last) = batch.last() else {
                break;
            };
            after_id = last.id;

            let mut vectors = Vec::with_capacity(batch.len());
            let mut slots = Vec::with_capacity(batch.len());
            let mut record_ids = Vec::with_capacity(batch.len());
            for record in &batch {
                let Some(slot) = record.embedding_index else {
                    continue;
                };
                let encoded = std::fs::read(&record.file_path)
                    .with_context(|| format!("Failed to read {}", record.file_path))
                    .and_then(|bytes| model.encode_image(&bytes));
                match encoded {
                    Ok(vector) => {
                        vectors.push(vector);
                        slots.push(slot);
                        record_ids.push(record.id);
                    }
                    Err(e) => {
                        // The old vector stays in place
                        tracing::warn!(id = record.id, path = %record.file_path, error = %e, "Regeneration failed");
                        report.failed += 1;
                    }
                }
            }

            match self.store.commit_replacement(0, &vectors, &slots, &record_ids)? {
                CommitOutcome::Merged { written, .. } => report.processed += written,
                CommitOutcome::Deferred { .. } => report.deferred_batches += 1,
            }
        }

        if report.processed > 0 || report.deferred_batches > 0 {
            self.invalidate_index()?;
        }
        tracing::info!(
            processed = report.processed,
            failed = report.failed,
            deferred_batches = report.deferred_batches,
            "Regeneration complete"
        );
        Ok(report)
    }

    /// Remove the saved index so the next build retrains over the new
    /// vectors instead of extending stale ones.
    fn invalidate_index(&self) -> Result<()> {
        let path = &self.config.index.path;
        match std::fs::remove_file(path) {
            Ok(()) => {
                tracing::info!(path = %path.display(), "Removed stale search index");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }
}
