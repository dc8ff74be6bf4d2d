//! Worker-private buffer files.
//!
//! A buffer is three `.npy` files sharing a stem:
//! `worker_<id>_<pid>_<stamp>_<seq>_{vectors,records,indices}.npy`.
//! Each file is written under a temporary name and renamed into place, and
//! the indices file goes last, so a buffer whose indices file exists is
//! complete. Only the writing worker touches a buffer until it is merged.

use anyhow::{Context, Result};
use ndarray::{Array1, Array2};
use ndarray_npy::{read_npy, write_npy, WriteNpyExt};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static BUFFER_SEQ: AtomicU64 = AtomicU64::new(0);

const VECTORS_SUFFIX: &str = "_vectors.npy";
const RECORDS_SUFFIX: &str = "_records.npy";
const INDICES_SUFFIX: &str = "_indices.npy";

/// Vectors and their target slots, plus the catalog records they belong to
/// when known.
#[derive(Debug, Clone)]
pub struct BufferBatch {
    pub vectors: Array2<f32>,
    pub slots: Vec<i64>,
    pub records: Option<Vec<i64>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferFiles {
    pub stem: String,
    pub vectors: PathBuf,
    pub records: PathBuf,
    pub indices: PathBuf,
}

impl BufferFiles {
    fn for_stem(dir: &Path, stem: &str) -> Self {
        Self {
            stem: stem.to_string(),
            vectors: dir.join(format!("{}{}", stem, VECTORS_SUFFIX)),
            records: dir.join(format!("{}{}", stem, RECORDS_SUFFIX)),
            indices: dir.join(format!("{}{}", stem, INDICES_SUFFIX)),
        }
    }

    /// Persist a batch under a fresh stem for `worker_id`.
    pub fn write(dir: &Path, worker_id: usize, batch: &BufferBatch) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create buffer directory {}", dir.display()))?;

        let stem = format!(
            "worker_{}_{}_{}_{}",
            worker_id,
            std::process::id(),
            chrono::Utc::now().format("%Y%m%dT%H%M%S%6f"),
            BUFFER_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let files = Self::for_stem(dir, &stem);

        write_atomic(&files.vectors, &batch.vectors)?;
        if let Some(records) = &batch.records {
            write_atomic(&files.records, &Array1::from_vec(records.clone()))?;
        }
        write_atomic(&files.indices, &Array1::from_vec(batch.slots.clone()))?;

        Ok(files)
    }

    /// True once the indices file exists and until the buffer is removed.
    pub fn is_complete(&self) -> bool {
        self.indices.exists()
    }

    pub fn read(&self) -> Result<BufferBatch> {
        let vectors: Array2<f32> = read_npy(&self.vectors)
            .with_context(|| format!("Failed to read {}", self.vectors.display()))?;
        let slots: Array1<i64> = read_npy(&self.indices)
            .with_context(|| format!("Failed to read {}", self.indices.display()))?;
        let records = if self.records.exists() {
            let records: Array1<i64> = read_npy(&self.records)
                .with_context(|| format!("Failed to read {}", self.records.display()))?;
            Some(records.to_vec())
        } else {
            None
        };

        anyhow::ensure!(
            vectors.nrows() == slots.len(),
            "Buffer {} holds {} vectors but {} indices",
            self.stem,
            vectors.nrows(),
            slots.len()
        );
        if let Some(records) = &records {
            anyhow::ensure!(
                records.len() == slots.len(),
                "Buffer {} holds {} records but {} indices",
                self.stem,
                records.len(),
                slots.len()
            );
        }

        Ok(BufferBatch {
            vectors,
            slots: slots.to_vec(),
            records,
        })
    }

    /// Delete the buffer, indices first so it stops counting as complete.
    pub fn remove(&self) -> Result<()> {
        for path in [&self.indices, &self.records, &self.vectors] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to remove {}", path.display()))
                }
            }
        }
        Ok(())
    }
}

fn write_atomic<T: WriteNpyExt>(path: &Path, array: &T) -> Result<()> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    write_npy(&tmp, array).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Complete buffers in `dir` in creation order, plus stems that have
/// vectors but no indices file.
pub fn scan(dir: &Path) -> Result<(Vec<BufferFiles>, Vec<String>)> {
    if !dir.exists() {
        return Ok((Vec::new(), Vec::new()));
    }

    let mut complete = Vec::new();
    let mut incomplete = Vec::new();

    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if !name.starts_with("worker_") {
            continue;
        }
        if let Some(stem) = name.strip_suffix(INDICES_SUFFIX) {
            complete.push(BufferFiles::for_stem(dir, stem));
        } else if let Some(stem) = name.strip_suffix(VECTORS_SUFFIX) {
            if !BufferFiles::for_stem(dir, stem).is_complete() {
                incomplete.push(stem.to_string());
            }
        }
    }

    complete.sort_by_key(|files| creation_key(&files.stem));
    incomplete.sort();
    Ok((complete, incomplete))
}

/// `(stamp, seq, stem)` so buffers from different workers merge oldest first.
fn creation_key(stem: &str) -> (String, u64, String) {
    let parts: Vec<&str> = stem.split('_').collect();
    let stamp = parts.get(3).copied().unwrap_or_default().to_string();
    let seq = parts.get(4).and_then(|s| s.parse().ok()).unwrap_or(0);
    (stamp, seq, stem.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let batch = BufferBatch {
            vectors: array![[1.0, 0.0], [0.0, 1.0]],
            slots: vec![4, 2],
            records: Some(vec![11, 12]),
        };

        let files = BufferFiles::write(dir.path(), 3, &batch).unwrap();
        assert!(files.is_complete());
        assert!(files.stem.starts_with("worker_3_"));

        let read = files.read().unwrap();
        assert_eq!(read.vectors, batch.vectors);
        assert_eq!(read.slots, vec![4, 2]);
        assert_eq!(read.records, Some(vec![11, 12]));

        let (complete, incomplete) = scan(dir.path()).unwrap();
        assert_eq!(complete, vec![files.clone()]);
        assert!(incomplete.is_empty());

        files.remove().unwrap();
        assert!(!files.is_complete());
        assert!(scan(dir.path()).unwrap().0.is_empty());
    }

    #[test]
    fn test_creation_key_orders_by_time() {
        let early = creation_key("worker_9_100_20240101T000000000001_5");
        let late = creation_key("worker_0_100_20240101T000000000002_1");
        assert!(early < late);
    }

    #[test]
    fn test_scan_reports_incomplete_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let batch = BufferBatch {
            vectors: array![[1.0, 0.0]],
            slots: vec![0],
            records: None,
        };
        let first = BufferFiles::write(dir.path(), 0, &batch).unwrap();
        let second = BufferFiles::write(dir.path(), 0, &batch).unwrap();
        // Crash between the vectors and indices writes
        fs::remove_file(&second.indices).unwrap();

        let (complete, incomplete) = scan(dir.path()).unwrap();
        assert_eq!(complete, vec![first]);
        assert_eq!(incomplete, vec![second.stem]);
        assert_eq!(complete[0].read().unwrap().records, None);
    }
}
