use anyhow::Result;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{IndexingPipeline, PipelineProgress, REGISTRATION_JOB};
use crate::scanner::{analyze_file, discover_images, ScanCache};

/// Files analysed in parallel before their catalog writes.
const ANALYSIS_CHUNK: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterReport {
    pub discovered: usize,
    pub registered: usize,
    /// Already catalogued or already in the failure log.
    pub skipped: usize,
    pub failed: usize,
}

impl IndexingPipeline {
    /// Find image files under `dir` and catalog every one not seen before.
    /// Files that fail to decode go to the failure log.
    pub fn scan_and_register(&self, dir: &Path) -> Result<RegisterReport> {
        let extensions = &self.config.scanner.image_extensions;
        let files = if self.config.scanner.use_cache {
            ScanCache::new(
                &self.config.scanner.cache_dir,
                Duration::from_secs(self.config.scanner.cache_max_age_secs),
            )
            .discover(dir, extensions)?
        } else {
            discover_images(dir, extensions)?
        };

        let registered = self.catalog.registered_paths()?;
        let failed = self.catalog.failed_paths()?;
        let unseen: Vec<PathBuf> = files
            .iter()
            .filter(|path| {
                let key = path.to_string_lossy();
                !registered.contains(key.as_ref()) && !failed.contains(key.as_ref())
            })
            .cloned()
            .collect();

        let mut report = RegisterReport {
            discovered: files.len(),
            skipped: files.len() - unseen.len(),
            ..Default::default()
        };
        tracing::info!(
            directory = %dir.display(),
            discovered = report.discovered,
            unseen = unseen.len(),
            "Scan complete"
        );
        self.report(PipelineProgress::Discovered {
            files: report.discovered,
            unseen: unseen.len(),
        });

        let total = unseen.len();
        for chunk in unseen.chunks(ANALYSIS_CHUNK) {
            if self.cancelled() {
                tracing::info!("Registration cancelled");
                break;
            }

            let analyses: Vec<_> = chunk
                .par_iter()
                .map(|path| (path, analyze_file(path)))
                .collect();

            for (path, analysis) in analyses {
                match analysis {
                    Ok(analysis) => {
                        let id = self.catalog.register(&analysis.to_new_image())?;
                        report.registered += 1;
                        self.attach_thumbnail(id, path);
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable image");
                        self.catalog.record_failure(path, &format!("{:#}", e))?;
                        report.failed += 1;
                    }
                }
            }

            let done = report.registered + report.failed;
            let marker = chunk.last().map(|p| p.to_string_lossy().to_string());
            self.catalog.checkpoint(
                REGISTRATION_JOB,
                total as i64,
                report.registered as i64,
                report.failed as i64,
                marker.as_deref(),
            )?;
            self.report(PipelineProgress::Registered { done, total });
        }

        if !self.cancelled() {
            self.catalog.complete_job(REGISTRATION_JOB)?;
            self.report(PipelineProgress::Completed { stage: "register" });
        }
        tracing::info!(
            registered = report.registered,
            skipped = report.skipped,
            failed = report.failed,
            "Registration complete"
        );
        Ok(report)
    }

    /// Thumbnails are cosmetic; failures are only logged.
    fn attach_thumbnail(&self, id: i64, path: &Path) {
        let Some(thumbnailer) = &self.thumbnailer else {
            return;
        };
        match thumbnailer.make_thumbnail(path) {
            Ok(thumb) => {
                if let Err(e) = self.catalog.set_thumbnail(id, &thumb) {
                    tracing::warn!(id, error = %e, "Failed to store thumbnail path");
                }
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Thumbnail generation failed"),
        }
    }

    /// Drop `path` from the failure log so the next scan tries it again.
    pub fn retry_failed(&self, path: &Path) -> Result<bool> {
        self.catalog.clear_failure(path)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::scanner::Thumbnailer;
    use std::path::{Path, PathBuf};

    #[test]
    fn test_register_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let images = write_images(root.path(), 4);
        std::fs::write(images.join("broken.jpg"), b"not really a jpeg").unwrap();
        std::fs::write(images.join("notes.txt"), b"ignored").unwrap();
        let pipeline = pipeline(root.path());

        let first = pipeline.scan_and_register(&images).unwrap();
        assert_eq!(first.discovered, 5);
        assert_eq!(first.registered, 4);
        assert_eq!(first.failed, 1);

        let second = pipeline.scan_and_register(&images).unwrap();
        assert_eq!(second.registered, 0);
        assert_eq!(second.skipped, 5);
        assert_eq!(pipeline.catalog().counts().unwrap().total, 4);

        let failures = pipeline.catalog().failures().unwrap();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].file_path.ends_with("broken.jpg"));
        // Failed files never reach the embed queue
        assert_eq!(pipeline.catalog().unprocessed_records(100).unwrap().len(), 4);
    }

    #[test]
    fn test_retry_after_fixing_file() {
        let root = tempfile::tempdir().unwrap();
        let images = write_images(root.path(), 1);
        let broken = images.join("late.png");
        std::fs::write(&broken, b"partial upload").unwrap();
        let pipeline = pipeline(root.path());
        assert_eq!(pipeline.scan_and_register(&images).unwrap().failed, 1);

        crate::scanner::test_support::write_test_image(&broken, 99);
        // Still skipped until the failure is cleared
        assert_eq!(pipeline.scan_and_register(&images).unwrap().registered, 0);
        assert!(pipeline.retry_failed(&broken).unwrap());
        assert_eq!(pipeline.scan_and_register(&images).unwrap().registered, 1);
        assert!(pipeline.catalog().failures().unwrap().is_empty());
    }

    struct FixedThumbnailer;

    impl Thumbnailer for FixedThumbnailer {
        fn make_thumbnail(&self, path: &Path) -> anyhow::Result<PathBuf> {
            if path.to_string_lossy().contains("0001") {
                anyhow::bail!("no thumbnail for you");
            }
            Ok(PathBuf::from("/thumbs/fixed.jpg"))
        }
    }

    #[test]
    fn test_thumbnail_failures_do_not_block_registration() {
        let root = tempfile::tempdir().unwrap();
        let images = write_images(root.path(), 2);
        let pipeline = pipeline(root.path()).with_thumbnailer(Box::new(FixedThumbnailer));

        assert_eq!(pipeline.scan_and_register(&images).unwrap().registered, 2);
        let records = pipeline.catalog().unprocessed_records(10).unwrap();
        let thumbs: Vec<Option<String>> = records.into_iter().map(|r| r.thumbnail_path).collect();
        assert_eq!(thumbs, vec![Some("/thumbs/fixed.jpg".to_string()), None]);
    }
}
