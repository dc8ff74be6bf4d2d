//! Crash-safe dense embedding store.
//!
//! The store is one `.npy` file holding an `[slots, dim]` `f32` matrix.
//! Writers never touch it directly: a commit first persists the batch to a
//! worker-private buffer, then merges under an advisory lock, and only
//! deletes the buffer once the merged store has been renamed into place.
//! A buffer whose merge failed or timed out stays on disk until `recover`
//! picks it up.

pub mod buffer;
pub mod lock;

use anyhow::{bail, Context, Result};
use ndarray::{s, Array2, ArrayView1, Axis};
use ndarray_npy::{read_npy, write_npy, ReadNpyError};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::StoreConfig;
use crate::error::FinderError;
use buffer::{BufferBatch, BufferFiles};
use lock::StoreLock;

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// The batch is in the store and its buffer is gone.
    Merged {
        written: usize,
        overwritten: usize,
        store_len: usize,
        /// The previous store failed validation and was replaced.
        reset: bool,
    },
    /// The batch is safe in `buffer` but not merged yet.
    Deferred { buffer: PathBuf, reason: String },
}

impl CommitOutcome {
    pub fn is_merged(&self) -> bool {
        matches!(self, CommitOutcome::Merged { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    pub buffers: usize,
    pub vectors: usize,
    pub overwritten: usize,
    /// Buffers missing their indices file, left untouched.
    pub incomplete: usize,
    pub unreadable: usize,
    /// `(record id, slot)` for merged vectors whose records are known.
    pub assignments: Vec<(i64, i64)>,
    /// The lock could not be taken; buffers stay for a later run.
    pub deferred: bool,
    pub reset: bool,
}

#[derive(Debug, Default)]
struct MergeStats {
    written: usize,
    overwritten: usize,
    store_len: usize,
    reset: bool,
}

/// Immutable view of the store at one point in time.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    vectors: Array2<f32>,
}

impl StoreSnapshot {
    pub fn from_vectors(vectors: Array2<f32>) -> Self {
        Self { vectors }
    }

    pub fn empty(dim: usize) -> Self {
        Self {
            vectors: Array2::zeros((0, dim)),
        }
    }

    pub fn len(&self) -> usize {
        self.vectors.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dim(&self) -> usize {
        self.vectors.ncols()
    }

    pub fn vectors(&self) -> &Array2<f32> {
        &self.vectors
    }

    pub fn row(&self, slot: i64) -> Option<ArrayView1<'_, f32>> {
        if slot < 0 || slot as usize >= self.len() {
            return None;
        }
        Some(self.vectors.row(slot as usize))
    }

    pub fn is_zero(&self, slot: i64) -> bool {
        self.row(slot).map_or(true, |row| is_zero_row(row))
    }

    /// Inner product of `query` with the vector at `slot`.
    pub fn dot(&self, slot: i64, query: &[f32]) -> Option<f32> {
        self.row(slot)
            .map(|row| row.iter().zip(query).map(|(a, b)| a * b).sum())
    }

    /// Slots holding a non-zero vector.
    pub fn filled_slots(&self) -> Vec<i64> {
        self.vectors
            .outer_iter()
            .enumerate()
            .filter(|(_, row)| !is_zero_row(*row))
            .map(|(slot, _)| slot as i64)
            .collect()
    }
}

fn is_zero_row(row: ArrayView1<'_, f32>) -> bool {
    row.iter().all(|v| *v == 0.0)
}

pub struct EmbeddingStore {
    path: PathBuf,
    lock_path: PathBuf,
    buffer_dir: PathBuf,
    dim: usize,
    lock_timeout: Duration,
}

impl EmbeddingStore {
    pub fn new(path: impl Into<PathBuf>, dim: usize, lock_timeout: Duration) -> Self {
        let path = path.into();
        Self {
            lock_path: sibling(&path, ".lock"),
            buffer_dir: sibling(&path, ".buffers"),
            path,
            dim,
            lock_timeout,
        }
    }

    pub fn from_config(config: &StoreConfig, dim: usize) -> Self {
        let mut store = Self::new(
            config.path.clone(),
            dim,
            Duration::from_secs(config.lock_timeout_secs),
        );
        store.buffer_dir = config.buffer_dir();
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn buffer_dir(&self) -> &Path {
        &self.buffer_dir
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Store `vectors[i]` at `slots[i]`. `record_ids`, when not empty, names
    /// the catalog record of each vector so a deferred merge can still be
    /// attributed by `recover`.
    pub fn commit(
        &self,
        worker_id: usize,
        vectors: &[Vec<f32>],
        slots: &[i64],
        record_ids: &[i64],
    ) -> Result<CommitOutcome> {
        self.commit_inner(worker_id, vectors, slots, record_ids, true)
    }

    /// Like `commit`, for rewriting slots that are expected to be filled.
    pub fn commit_replacement(
        &self,
        worker_id: usize,
        vectors: &[Vec<f32>],
        slots: &[i64],
        record_ids: &[i64],
    ) -> Result<CommitOutcome> {
        self.commit_inner(worker_id, vectors, slots, record_ids, false)
    }

    fn commit_inner(
        &self,
        worker_id: usize,
        vectors: &[Vec<f32>],
        slots: &[i64],
        record_ids: &[i64],
        warn_overwrites: bool,
    ) -> Result<CommitOutcome> {
        if slots.is_empty() {
            return Ok(CommitOutcome::Merged {
                written: 0,
                overwritten: 0,
                store_len: self.len()?,
                reset: false,
            });
        }

        let batch = self.make_batch(vectors, slots, record_ids)?;
        let files = BufferFiles::write(&self.buffer_dir, worker_id, &batch)?;

        let _lock = match StoreLock::acquire_with_timeout(&self.lock_path, self.lock_timeout) {
            Ok(lock) => lock,
            Err(e) => {
                tracing::warn!(
                    worker = worker_id,
                    buffer = %files.stem,
                    error = %e,
                    "Store lock unavailable, merge deferred"
                );
                return Ok(CommitOutcome::Deferred {
                    buffer: files.indices,
                    reason: e.to_string(),
                });
            }
        };

        if !files.is_complete() {
            // Another process's recovery merged it while we waited
            tracing::debug!(buffer = %files.stem, "Buffer already merged by recovery");
            return Ok(CommitOutcome::Merged {
                written: 0,
                overwritten: 0,
                store_len: self.len()?,
                reset: false,
            });
        }

        match self.merge_locked(std::slice::from_ref(&batch), warn_overwrites) {
            Ok(stats) => {
                if let Err(e) = files.remove() {
                    // Re-merging the same buffer later writes the same values
                    tracing::warn!(buffer = %files.stem, error = %e, "Failed to remove merged buffer");
                }
                tracing::debug!(
                    worker = worker_id,
                    written = stats.written,
                    store_len = stats.store_len,
                    "Committed embeddings"
                );
                Ok(CommitOutcome::Merged {
                    written: stats.written,
                    overwritten: stats.overwritten,
                    store_len: stats.store_len,
                    reset: stats.reset,
                })
            }
            Err(e) => {
                tracing::warn!(
                    worker = worker_id,
                    buffer = %files.stem,
                    error = %e,
                    "Merge failed, buffer kept for recovery"
                );
                Ok(CommitOutcome::Deferred {
                    buffer: files.indices,
                    reason: format!("{:#}", e),
                })
            }
        }
    }

    /// Persist a batch to a private buffer without merging it.
    pub fn write_buffer(
        &self,
        worker_id: usize,
        vectors: &[Vec<f32>],
        slots: &[i64],
        record_ids: &[i64],
    ) -> Result<BufferFiles> {
        let batch = self.make_batch(vectors, slots, record_ids)?;
        BufferFiles::write(&self.buffer_dir, worker_id, &batch)
    }

    fn make_batch(&self, vectors: &[Vec<f32>], slots: &[i64], record_ids: &[i64]) -> Result<BufferBatch> {
        if vectors.len() != slots.len() {
            bail!("{} vectors given for {} slots", vectors.len(), slots.len());
        }
        if !record_ids.is_empty() && record_ids.len() != slots.len() {
            bail!("{} record ids given for {} slots", record_ids.len(), slots.len());
        }
        if let Some(&slot) = slots.iter().find(|&&s| s < 0) {
            bail!("Negative embedding slot {}", slot);
        }

        let mut matrix = Array2::zeros((vectors.len(), self.dim));
        for (i, vector) in vectors.iter().enumerate() {
            if vector.len() != self.dim {
                return Err(FinderError::DimensionMismatch {
                    expected: self.dim,
                    actual: vector.len(),
                }
                .into());
            }
            matrix
                .row_mut(i)
                .iter_mut()
                .zip(vector)
                .for_each(|(dst, src)| *dst = *src);
        }

        Ok(BufferBatch {
            vectors: matrix,
            slots: slots.to_vec(),
            records: (!record_ids.is_empty()).then(|| record_ids.to_vec()),
        })
    }

    /// Merge every complete orphaned buffer, then delete them.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let (complete, incomplete) = buffer::scan(&self.buffer_dir)?;

        for stem in &incomplete {
            tracing::warn!(buffer = %stem, "Ignoring incomplete buffer (no indices file)");
        }
        report.incomplete = incomplete.len();
        if complete.is_empty() {
            return Ok(report);
        }

        let _lock = match StoreLock::acquire_with_timeout(&self.lock_path, self.lock_timeout) {
            Ok(lock) => lock,
            Err(e) => {
                tracing::warn!(
                    buffers = complete.len(),
                    error = %e,
                    "Store lock unavailable, recovery deferred"
                );
                report.deferred = true;
                return Ok(report);
            }
        };

        let mut merged = Vec::new();
        let mut batches = Vec::new();
        for files in complete {
            if !files.is_complete() {
                continue;
            }
            match files.read() {
                Ok(batch) => {
                    batches.push(batch);
                    merged.push(files);
                }
                Err(e) => {
                    tracing::error!(buffer = %files.stem, error = %e, "Unreadable buffer left in place");
                    report.unreadable += 1;
                }
            }
        }
        if batches.is_empty() {
            return Ok(report);
        }

        let stats = self.merge_locked(&batches, true)?;
        for files in &merged {
            files.remove()?;
        }

        for batch in &batches {
            if let Some(records) = &batch.records {
                report
                    .assignments
                    .extend(records.iter().copied().zip(batch.slots.iter().copied()));
            }
        }
        report.buffers = merged.len();
        report.vectors = stats.written;
        report.overwritten = stats.overwritten;
        report.reset = stats.reset;

        tracing::info!(
            buffers = report.buffers,
            vectors = report.vectors,
            store_len = stats.store_len,
            "Recovered orphaned buffers"
        );
        Ok(report)
    }

    /// Load, grow, write and persist. The caller holds the lock.
    fn merge_locked(&self, batches: &[BufferBatch], warn_overwrites: bool) -> Result<MergeStats> {
        let (mut store, reset) = self.load_for_merge()?;
        let mut stats = MergeStats {
            reset,
            ..Default::default()
        };

        let max_slot = batches
            .iter()
            .flat_map(|b| b.slots.iter().copied())
            .max()
            .unwrap_or(-1);
        let needed = (max_slot + 1) as usize;
        if needed > store.nrows() {
            let mut grown = Array2::zeros((needed, self.dim));
            grown.slice_mut(s![..store.nrows(), ..]).assign(&store);
            tracing::debug!(from = store.nrows(), to = needed, "Growing embedding store");
            store = grown;
        }

        for batch in batches {
            if batch.vectors.ncols() != self.dim {
                return Err(FinderError::DimensionMismatch {
                    expected: self.dim,
                    actual: batch.vectors.ncols(),
                }
                .into());
            }
            for (vector, &slot) in batch.vectors.outer_iter().zip(&batch.slots) {
                let mut row = store.row_mut(slot as usize);
                if !is_zero_row(row.view()) {
                    stats.overwritten += 1;
                    if warn_overwrites {
                        tracing::warn!(slot, "Overwriting non-zero embedding slot");
                    }
                }
                row.assign(&vector);
                stats.written += 1;
            }
        }

        self.persist(&store)?;
        stats.store_len = store.nrows();
        Ok(stats)
    }

    /// Current store for merging. A file that fails validation is moved
    /// aside and replaced by an empty store.
    fn load_for_merge(&self) -> Result<(Array2<f32>, bool)> {
        if !self.path.exists() {
            return Ok((Array2::zeros((0, self.dim)), false));
        }

        let problem = match self.read_store()? {
            Ok(store) => return Ok((store, false)),
            Err(problem) => problem,
        };

        let backup = sibling(
            &self.path,
            &format!(".corrupt-{}", chrono::Utc::now().format("%Y%m%dT%H%M%S")),
        );
        fs::rename(&self.path, &backup)
            .with_context(|| format!("Failed to move corrupt store to {}", backup.display()))?;
        tracing::error!(
            store = %self.path.display(),
            backup = %backup.display(),
            problem = %problem,
            "Embedding store failed validation; starting a fresh store, affected slots must be re-embedded"
        );
        Ok((Array2::zeros((0, self.dim)), true))
    }

    /// Read and validate the store file. The inner error describes why the
    /// content is unusable; the outer one is a plain I/O failure.
    fn read_store(&self) -> Result<std::result::Result<Array2<f32>, String>> {
        match read_npy::<_, Array2<f32>>(&self.path) {
            Ok(store) if store.ncols() == self.dim => Ok(Ok(store)),
            Ok(store) => Ok(Err(format!(
                "expected {} columns, found {}",
                self.dim,
                store.ncols()
            ))),
            Err(ReadNpyError::Io(e)) if e.kind() != io::ErrorKind::UnexpectedEof => {
                Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
            }
            Err(e) => Ok(Err(e.to_string())),
        }
    }

    fn persist(&self, store: &Array2<f32>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = sibling(&self.path, ".tmp");
        write_npy(&tmp, store).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Snapshot of the committed store. A missing store is empty; one that
    /// fails validation is an error.
    pub fn load(&self) -> Result<StoreSnapshot> {
        if !self.path.exists() {
            return Ok(StoreSnapshot::empty(self.dim));
        }
        let vectors = self
            .read_store()?
            .map_err(FinderError::StoreCorrupt)?;
        Ok(StoreSnapshot { vectors })
    }

    /// Vectors at `slots`, in order.
    pub fn get(&self, slots: &[i64]) -> Result<Array2<f32>> {
        let snapshot = self.load()?;
        let mut rows = Vec::with_capacity(slots.len());
        for &slot in slots {
            if slot < 0 || slot as usize >= snapshot.len() {
                return Err(FinderError::SlotOutOfRange {
                    slot,
                    len: snapshot.len(),
                }
                .into());
            }
            rows.push(slot as usize);
        }
        Ok(snapshot.vectors.select(Axis(0), &rows))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.load()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Complete buffers waiting to be merged.
    pub fn pending_buffers(&self) -> Result<usize> {
        Ok(buffer::scan(&self.buffer_dir)?.0.len())
    }

    /// Record ids held by complete buffers waiting to be merged. Unreadable
    /// buffers are logged and contribute nothing.
    pub fn pending_records(&self) -> Result<HashSet<i64>> {
        let mut ids = HashSet::new();
        for files in buffer::scan(&self.buffer_dir)?.0 {
            match files.read() {
                Ok(batch) => ids.extend(batch.records.unwrap_or_default()),
                Err(e) => tracing::warn!(buffer = %files.stem, error = %e, "Skipping unreadable buffer"),
            }
        }
        Ok(ids)
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
