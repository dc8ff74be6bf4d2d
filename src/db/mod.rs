//! Catalog store: the durable registry of images, job checkpoints, the
//! failure log, ratings/tags and duplicate relations.
//!
//! A `Catalog` owns one SQLite connection. Every component receives the
//! handle explicitly; threads that need concurrent access open their own.

mod duplicates;
mod images;
mod jobs;
mod ratings;
mod schema;

use anyhow::{Context, Result};
use rusqlite::{Connection, Row};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use jobs::{FailureEntry, JobCheckpoint};
pub use ratings::Rating;
pub use schema::SCHEMA;

use crate::config::CatalogConfig;

/// A catalogued image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub id: i64,
    pub file_path: String,
    pub file_name: String,
    pub file_size: i64,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub format: Option<String>,
    pub thumbnail_path: Option<String>,
    pub embedding_index: Option<i64>,
    pub perceptual_hash: Option<String>,
    pub content_hash: Option<String>,
    pub is_duplicate: bool,
    pub duplicate_of: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

impl ImageRecord {
    /// Representative id of this record's duplicate cluster.
    pub fn canonical_id(&self) -> i64 {
        self.duplicate_of.unwrap_or(self.id)
    }
}

/// Metadata gathered at scan time for `Catalog::register`.
#[derive(Debug, Clone, Default)]
pub struct NewImage {
    pub file_path: PathBuf,
    pub file_size: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<String>,
    pub perceptual_hash: Option<String>,
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogCounts {
    pub total: usize,
    pub embedded: usize,
    pub failed: usize,
    pub duplicates: usize,
}

pub(crate) const IMAGE_COLUMNS: &str = "id, file_path, file_name, file_size, width, height, format, \
     thumbnail_path, embedding_index, perceptual_hash, content_hash, is_duplicate, duplicate_of, \
     created_at, updated_at";

pub(crate) fn image_from_row(row: &Row<'_>) -> rusqlite::Result<ImageRecord> {
    Ok(ImageRecord {
        id: row.get(0)?,
        file_path: row.get(1)?,
        file_name: row.get(2)?,
        file_size: row.get(3)?,
        width: row.get(4)?,
        height: row.get(5)?,
        format: row.get(6)?,
        thumbnail_path: row.get(7)?,
        embedding_index: row.get(8)?,
        perceptual_hash: row.get(9)?,
        content_hash: row.get(10)?,
        is_duplicate: row.get::<_, i64>(11)? != 0,
        duplicate_of: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

pub struct Catalog {
    pub(crate) conn: Connection,
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, Duration::from_secs(30))
    }

    pub fn open_with_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open catalog {}", path.display()))?;
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn })
    }

    /// Open and initialize the catalog described by `config`.
    pub fn from_config(config: &CatalogConfig) -> Result<Self> {
        let catalog =
            Self::open_with_timeout(&config.path, Duration::from_millis(config.busy_timeout_ms))?;
        catalog.initialize()?;
        Ok(catalog)
    }

    pub fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn counts(&self) -> Result<CatalogCounts> {
        let (total, embedded, duplicates) = self.conn.query_row(
            r#"
            SELECT COUNT(*),
                   COUNT(embedding_index),
                   COALESCE(SUM(is_duplicate), 0)
            FROM images
            "#,
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )?;
        let failed: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM failed_images", [], |row| row.get(0))?;

        Ok(CatalogCounts {
            total: total as usize,
            embedded: embedded as usize,
            failed: failed as usize,
            duplicates: duplicates as usize,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn open_temp() -> (tempfile::TempDir, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&dir.path().join("catalog.db")).unwrap();
        catalog.initialize().unwrap();
        (dir, catalog)
    }

    pub fn new_image(path: &str, phash: Option<&str>) -> NewImage {
        NewImage {
            file_path: PathBuf::from(path),
            file_size: 1024,
            width: Some(64),
            height: Some(48),
            format: Some("png".to_string()),
            perceptual_hash: phash.map(str::to_string),
            content_hash: Some(format!("sha-{}", path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;

    #[test]
    fn test_initialize_is_repeatable() {
        let (_dir, catalog) = open_temp();
        catalog.initialize().unwrap();
        catalog.register(&new_image("/a.png", None)).unwrap();
        catalog.initialize().unwrap();
        assert_eq!(catalog.counts().unwrap().total, 1);
    }

    #[test]
    fn test_counts() {
        let (_dir, catalog) = open_temp();
        let a = catalog.register(&new_image("/a.png", None)).unwrap();
        let b = catalog.register(&new_image("/b.png", None)).unwrap();
        catalog.assign_embedding_index(a, 0).unwrap();
        catalog.replace_duplicate_assignments(&[(b, a)]).unwrap();
        catalog
            .record_failure(std::path::Path::new("/broken.jpg"), "Invalid image")
            .unwrap();

        let counts = catalog.counts().unwrap();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.embedded, 1);
        assert_eq!(counts.duplicates, 1);
        assert_eq!(counts.failed, 1);
    }
}
