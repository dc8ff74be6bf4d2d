//! Directory-listing cache.
//!
//! Walking a tree of millions of files takes minutes, so listings are kept
//! as JSON keyed by the directory path and reused until they are older than
//! `max_age` or explicitly invalidated. This only saves time; a missing or
//! unreadable entry just means walking again.

use anyhow::{Context, Result};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::discovery::discover_images;

#[derive(Debug, Serialize, Deserialize)]
struct CachedListing {
    directory: String,
    extensions: Vec<String>,
    files: Vec<PathBuf>,
    scanned_at: i64,
    scan_secs: f64,
}

pub struct ScanCache {
    dir: PathBuf,
    max_age: Duration,
}

impl ScanCache {
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            dir: dir.into(),
            max_age,
        }
    }

    fn entry_path(&self, directory: &Path) -> PathBuf {
        let key = format!("{:x}", Md5::digest(directory.to_string_lossy().as_bytes()));
        self.dir.join(format!("scan_{}.json", key))
    }

    /// Cached listing for `directory`, if present, fresh, and taken with the
    /// same extension filter.
    pub fn get(&self, directory: &Path, extensions: &[String]) -> Option<Vec<PathBuf>> {
        let content = fs::read_to_string(self.entry_path(directory)).ok()?;
        let listing: CachedListing = match serde_json::from_str(&content) {
            Ok(listing) => listing,
            Err(e) => {
                tracing::warn!(directory = %directory.display(), error = %e, "Ignoring unreadable scan cache");
                return None;
            }
        };

        let age = chrono::Utc::now().timestamp() - listing.scanned_at;
        if age < 0 || age as u64 > self.max_age.as_secs() {
            tracing::debug!(directory = %directory.display(), age, "Scan cache expired");
            return None;
        }
        if listing.extensions != extensions {
            return None;
        }

        Some(listing.files)
    }

    pub fn put(
        &self,
        directory: &Path,
        extensions: &[String],
        files: &[PathBuf],
        scan_time: Duration,
    ) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let listing = CachedListing {
            directory: directory.to_string_lossy().to_string(),
            extensions: extensions.to_vec(),
            files: files.to_vec(),
            scanned_at: chrono::Utc::now().timestamp(),
            scan_secs: scan_time.as_secs_f64(),
        };
        let path = self.entry_path(directory);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&listing)?)
            .with_context(|| format!("Failed to write scan cache {}", tmp.display()))?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Use the cached listing when fresh, otherwise walk and cache the result.
    pub fn discover(&self, directory: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
        if let Some(files) = self.get(directory, extensions) {
            tracing::info!(directory = %directory.display(), files = files.len(), "Using cached scan");
            return Ok(files);
        }

        let started = Instant::now();
        let files = discover_images(directory, extensions)?;
        let elapsed = started.elapsed();
        tracing::info!(
            directory = %directory.display(),
            files = files.len(),
            secs = elapsed.as_secs_f64(),
            "Scanned directory"
        );

        if let Err(e) = self.put(directory, extensions, &files, elapsed) {
            tracing::warn!(error = %e, "Failed to save scan cache");
        }
        Ok(files)
    }

    /// Drop the cached listing for `directory`. Returns whether one existed.
    pub fn invalidate(&self, directory: &Path) -> Result<bool> {
        let path = self.entry_path(directory);
        if path.exists() {
            fs::remove_file(&path)?;
            tracing::info!(directory = %directory.display(), "Scan cache invalidated");
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
