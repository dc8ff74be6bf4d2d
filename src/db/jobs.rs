//! Job checkpoints and the failure log.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;

use super::Catalog;

/// Progress of a named job, written at checkpoint intervals.
#[derive(Debug, Clone, PartialEq)]
pub struct JobCheckpoint {
    pub job_name: String,
    pub total: i64,
    pub processed: i64,
    pub failed: i64,
    /// Last record id the job handled.
    pub marker: Option<String>,
    pub started_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailureEntry {
    pub file_path: String,
    pub error_message: String,
    pub failed_at: String,
}

impl Catalog {
    // ========================================================================
    // Checkpoints
    // ========================================================================

    pub fn checkpoint(
        &self,
        job: &str,
        total: i64,
        processed: i64,
        failed: i64,
        marker: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO processing_status (job_name, total, processed, failed, marker)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(job_name) DO UPDATE SET
                total = excluded.total,
                processed = excluded.processed,
                failed = excluded.failed,
                marker = excluded.marker,
                updated_at = CURRENT_TIMESTAMP,
                completed_at = NULL
            "#,
            params![job, total, processed, failed, marker],
        )?;
        Ok(())
    }

    pub fn job_status(&self, job: &str) -> Result<Option<JobCheckpoint>> {
        let checkpoint = self
            .conn
            .query_row(
                r#"
                SELECT job_name, total, processed, failed, marker,
                       started_at, updated_at, completed_at
                FROM processing_status
                WHERE job_name = ?
                "#,
                [job],
                |row| {
                    Ok(JobCheckpoint {
                        job_name: row.get(0)?,
                        total: row.get(1)?,
                        processed: row.get(2)?,
                        failed: row.get(3)?,
                        marker: row.get(4)?,
                        started_at: row.get(5)?,
                        updated_at: row.get(6)?,
                        completed_at: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(checkpoint)
    }

    pub fn resume_marker(&self, job: &str) -> Result<Option<String>> {
        Ok(self.job_status(job)?.and_then(|c| c.marker))
    }

    pub fn complete_job(&self, job: &str) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE processing_status
            SET completed_at = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP
            WHERE job_name = ?
            "#,
            [job],
        )?;
        Ok(())
    }

    pub fn reset_job(&self, job: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM processing_status WHERE job_name = ?", [job])?;
        Ok(())
    }

    // ========================================================================
    // Failure log
    // ========================================================================

    pub fn record_failure(&self, path: &Path, error: &str) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO failed_images (file_path, error_message)
            VALUES (?1, ?2)
            ON CONFLICT(file_path) DO UPDATE SET
                error_message = excluded.error_message,
                failed_at = CURRENT_TIMESTAMP
            "#,
            params![path.to_string_lossy(), error],
        )?;
        Ok(())
    }

    /// Forget a failure so the file is picked up again. Returns whether an
    /// entry existed.
    pub fn clear_failure(&self, path: &Path) -> Result<bool> {
        let removed = self.conn.execute(
            "DELETE FROM failed_images WHERE file_path = ?",
            params![path.to_string_lossy()],
        )?;
        Ok(removed > 0)
    }

    pub fn failures(&self) -> Result<Vec<FailureEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT file_path, error_message, failed_at FROM failed_images ORDER BY failed_at, file_path",
        )?;
        let entries = stmt
            .query_map([], |row| {
                Ok(FailureEntry {
                    file_path: row.get(0)?,
                    error_message: row.get(1)?,
                    failed_at: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    pub fn failed_paths(&self) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare("SELECT file_path FROM failed_images")?;
        let paths = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(paths)
    }
}
