//! Image registration, lookups and embedding slot bookkeeping.

use anyhow::Result;
use rusqlite::{params, params_from_iter, OptionalExtension, Transaction, TransactionBehavior};
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::path::Path;

use super::{image_from_row, Catalog, ImageRecord, NewImage, IMAGE_COLUMNS};
use crate::error::FinderError;

// SQLite caps bound parameters per statement
const IN_CLAUSE_CHUNK: usize = 500;

impl Catalog {
    // ========================================================================
    // Registration
    // ========================================================================

    /// Insert or update the record for `image.file_path` and return its id.
    ///
    /// Re-registering a path refreshes metadata and hashes but leaves the
    /// embedding slot and duplicate relation alone. A stale failure-log
    /// entry for the path is cleared in the same transaction.
    pub fn register(&self, image: &NewImage) -> Result<i64> {
        let path_str = image.file_path.to_string_lossy();
        let file_name = image
            .file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path_str.to_string());

        let tx = self.conn.unchecked_transaction()?;
        let id: i64 = tx.query_row(
            r#"
            INSERT INTO images (file_path, file_name, file_size, width, height, format,
                                perceptual_hash, content_hash)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(file_path) DO UPDATE SET
                file_name = excluded.file_name,
                file_size = excluded.file_size,
                width = excluded.width,
                height = excluded.height,
                format = excluded.format,
                perceptual_hash = excluded.perceptual_hash,
                content_hash = excluded.content_hash,
                updated_at = CURRENT_TIMESTAMP
            RETURNING id
            "#,
            params![
                path_str,
                file_name,
                image.file_size as i64,
                image.width,
                image.height,
                image.format,
                image.perceptual_hash,
                image.content_hash,
            ],
            |row| row.get(0),
        )?;
        tx.execute(
            "DELETE FROM failed_images WHERE file_path = ?",
            params![path_str],
        )?;
        tx.commit()?;

        Ok(id)
    }

    pub fn set_thumbnail(&self, id: i64, thumbnail_path: &Path) -> Result<()> {
        self.conn.execute(
            "UPDATE images SET thumbnail_path = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
            params![thumbnail_path.to_string_lossy(), id],
        )?;
        Ok(())
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    pub fn get_record(&self, id: i64) -> Result<Option<ImageRecord>> {
        let sql = format!("SELECT {} FROM images WHERE id = ?", IMAGE_COLUMNS);
        let record = self
            .conn
            .query_row(&sql, [id], image_from_row)
            .optional()?;
        Ok(record)
    }

    pub fn record_by_path(&self, path: &Path) -> Result<Option<ImageRecord>> {
        let sql = format!("SELECT {} FROM images WHERE file_path = ?", IMAGE_COLUMNS);
        let result = self
            .conn
            .query_row(&sql, params![path.to_string_lossy()], image_from_row);
        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Records keyed by their embedding slot. Slots with no record are absent.
    pub fn records_by_embedding_indices(
        &self,
        slots: &[i64],
    ) -> Result<HashMap<i64, ImageRecord>> {
        let mut records = HashMap::with_capacity(slots.len());

        for chunk in slots.chunks(IN_CLAUSE_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT {} FROM images WHERE embedding_index IN ({})",
                IMAGE_COLUMNS, placeholders
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), image_from_row)?;
            for row in rows {
                let record = row?;
                if let Some(slot) = record.embedding_index {
                    records.insert(slot, record);
                }
            }
        }

        Ok(records)
    }

    pub fn registered_paths(&self) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare("SELECT file_path FROM images")?;
        let paths = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(paths)
    }

    /// Records still waiting for an embedding, oldest first. Paths in the
    /// failure log are excluded.
    pub fn unprocessed_records(&self, limit: usize) -> Result<Vec<ImageRecord>> {
        self.unprocessed_records_for_worker(0, 1, 0, limit)
    }

    /// The share of unprocessed records owned by `worker` when ids are
    /// partitioned `id % worker_count`, paged by `id > after_id`.
    pub fn unprocessed_records_for_worker(
        &self,
        worker: usize,
        worker_count: usize,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<ImageRecord>> {
        let sql = format!(
            r#"
            SELECT {} FROM images
            WHERE embedding_index IS NULL
              AND id > ?1
              AND id % ?2 = ?3
              AND file_path NOT IN (SELECT file_path FROM failed_images)
            ORDER BY id
            LIMIT ?4
            "#,
            IMAGE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(
                params![
                    after_id,
                    worker_count.max(1) as i64,
                    worker as i64,
                    limit as i64
                ],
                image_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn count_unprocessed(&self, worker: usize, worker_count: usize) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            r#"
            SELECT COUNT(*) FROM images
            WHERE embedding_index IS NULL
              AND id % ?1 = ?2
              AND file_path NOT IN (SELECT file_path FROM failed_images)
            "#,
            params![worker_count.max(1) as i64, worker as i64],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Records that already own a slot, paged by id.
    pub fn embedded_records(&self, after_id: i64, limit: usize) -> Result<Vec<ImageRecord>> {
        let sql = format!(
            "SELECT {} FROM images WHERE embedding_index IS NOT NULL AND id > ? ORDER BY id LIMIT ?",
            IMAGE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(params![after_id, limit as i64], image_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Every `(record id, slot)` pair.
    pub fn embedding_assignments(&self) -> Result<Vec<(i64, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, embedding_index FROM images WHERE embedding_index IS NOT NULL ORDER BY id",
        )?;
        let pairs = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pairs)
    }

    // ========================================================================
    // Embedding slots
    // ========================================================================

    pub fn assign_embedding_index(&self, id: i64, index: i64) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE images SET embedding_index = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
            params![index, id],
        )?;
        if updated == 0 {
            return Err(FinderError::RecordNotFound(id).into());
        }
        Ok(())
    }

    /// Assign several `(record id, slot)` pairs atomically.
    pub fn assign_embedding_indices(&self, assignments: &[(i64, i64)]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE images SET embedding_index = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
            )?;
            for &(id, index) in assignments {
                if stmt.execute(params![index, id])? == 0 {
                    return Err(FinderError::RecordNotFound(id).into());
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Reserve `count` fresh slots. Ranges handed to concurrent callers never
    /// overlap, and a slot is never handed out twice.
    pub fn reserve_slots(&self, count: usize) -> Result<Range<i64>> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        Self::ensure_allocator(&tx)?;
        let start: i64 =
            tx.query_row("SELECT next_slot FROM slot_allocator WHERE id = 0", [], |row| {
                row.get(0)
            })?;
        let end = start + count as i64;
        tx.execute("UPDATE slot_allocator SET next_slot = ? WHERE id = 0", [end])?;
        tx.commit()?;
        Ok(start..end)
    }

    /// Make sure future reservations start at or after `floor`.
    pub fn raise_slot_floor(&self, floor: i64) -> Result<()> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        Self::ensure_allocator(&tx)?;
        tx.execute(
            "UPDATE slot_allocator SET next_slot = MAX(next_slot, ?) WHERE id = 0",
            [floor],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn ensure_allocator(tx: &Transaction<'_>) -> Result<()> {
        tx.execute(
            r#"
            INSERT OR IGNORE INTO slot_allocator (id, next_slot)
            SELECT 0, COALESCE(MAX(embedding_index) + 1, 0) FROM images
            "#,
            [],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::error::FinderError;
    use std::path::Path;

    #[test]
    fn test_register_is_idempotent() {
        let (_dir, catalog) = open_temp();
        let first = catalog.register(&new_image("/photos/a.png", Some("00ff00ff00ff00ff"))).unwrap();

        let mut updated = new_image("/photos/a.png", Some("0000000000000001"));
        updated.width = Some(800);
        let second = catalog.register(&updated).unwrap();

        assert_eq!(first, second);
        assert_eq!(catalog.counts().unwrap().total, 1);
        let record = catalog.get_record(first).unwrap().unwrap();
        assert_eq!(record.width, Some(800));
        assert_eq!(record.file_name, "a.png");
        assert_eq!(record.perceptual_hash.as_deref(), Some("0000000000000001"));
    }

    #[test]
    fn test_reregister_keeps_embedding_index() {
        let (_dir, catalog) = open_temp();
        let id = catalog.register(&new_image("/a.png", None)).unwrap();
        catalog.assign_embedding_index(id, 7).unwrap();
        catalog.register(&new_image("/a.png", None)).unwrap();
        assert_eq!(catalog.get_record(id).unwrap().unwrap().embedding_index, Some(7));
    }

    #[test]
    fn test_register_clears_failure() {
        let (_dir, catalog) = open_temp();
        catalog.record_failure(Path::new("/a.png"), "Invalid image").unwrap();
        catalog.register(&new_image("/a.png", None)).unwrap();
        assert!(catalog.failures().unwrap().is_empty());
    }

    #[test]
    fn test_unprocessed_excludes_embedded_and_failed() {
        let (_dir, catalog) = open_temp();
        let a = catalog.register(&new_image("/a.png", None)).unwrap();
        let b = catalog.register(&new_image("/b.png", None)).unwrap();
        let c = catalog.register(&new_image("/c.png", None)).unwrap();
        catalog.assign_embedding_index(a, 0).unwrap();
        catalog.record_failure(Path::new("/c.png"), "read error").unwrap();

        let pending: Vec<i64> = catalog
            .unprocessed_records(10)
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(pending, vec![b]);

        catalog.clear_failure(Path::new("/c.png")).unwrap();
        let pending: Vec<i64> = catalog
            .unprocessed_records(10)
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(pending, vec![b, c]);
    }

    #[test]
    fn test_worker_partitions_are_disjoint() {
        let (_dir, catalog) = open_temp();
        for i in 0..10 {
            catalog.register(&new_image(&format!("/{i}.png"), None)).unwrap();
        }

        let mut seen = Vec::new();
        for worker in 0..3 {
            let records = catalog.unprocessed_records_for_worker(worker, 3, 0, 100).unwrap();
            assert_eq!(records.len(), catalog.count_unprocessed(worker, 3).unwrap());
            for record in records {
                assert_eq!(record.id % 3, worker as i64);
                seen.push(record.id);
            }
        }
        seen.sort();
        assert_eq!(seen, (1..=10).collect::<Vec<i64>>());
    }

    #[test]
    fn test_assign_unknown_record_fails() {
        let (_dir, catalog) = open_temp();
        let err = catalog.assign_embedding_index(99, 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FinderError>(),
            Some(FinderError::RecordNotFound(99))
        ));
    }

    #[test]
    fn test_embedding_index_is_unique() {
        let (_dir, catalog) = open_temp();
        let a = catalog.register(&new_image("/a.png", None)).unwrap();
        let b = catalog.register(&new_image("/b.png", None)).unwrap();
        catalog.assign_embedding_index(a, 3).unwrap();
        assert!(catalog.assign_embedding_index(b, 3).is_err());
        // The failed batch leaves nothing behind
        assert!(catalog.assign_embedding_indices(&[(b, 4), (a, 3), (b, 3)]).is_err());
        assert_eq!(catalog.get_record(b).unwrap().unwrap().embedding_index, None);
    }

    #[test]
    fn test_reserve_slots_is_monotonic() {
        let (_dir, catalog) = open_temp();
        let a = catalog.register(&new_image("/a.png", None)).unwrap();
        catalog.assign_embedding_index(a, 9).unwrap();

        assert_eq!(catalog.reserve_slots(4).unwrap(), 10..14);
        assert_eq!(catalog.reserve_slots(2).unwrap(), 14..16);
        catalog.raise_slot_floor(12).unwrap();
        assert_eq!(catalog.reserve_slots(1).unwrap(), 16..17);
        catalog.raise_slot_floor(40).unwrap();
        assert_eq!(catalog.reserve_slots(1).unwrap(), 40..41);
    }

    #[test]
    fn test_records_by_embedding_indices() {
        let (_dir, catalog) = open_temp();
        let a = catalog.register(&new_image("/a.png", None)).unwrap();
        let b = catalog.register(&new_image("/b.png", None)).unwrap();
        catalog.assign_embedding_indices(&[(a, 0), (b, 5)]).unwrap();

        let records = catalog.records_by_embedding_indices(&[5, 0, 3]).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[&5].id, b);
        assert_eq!(records[&0].id, a);
        assert_eq!(catalog.embedding_assignments().unwrap(), vec![(a, 0), (b, 5)]);
    }
}
