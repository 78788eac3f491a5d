use crate::integrity::IntegrityVerifier;
use crate::ledger::error::{LedgerError, LedgerResult};
use crate::ledger::types::{ChunkLocation, LedgerEntry};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::time::Duration;

/// SQLite-backed partial-upload ledger.
///
/// Completed chunks live in their own table keyed by `(checksum,
/// chunk_index)`; marking a chunk is a single `INSERT OR IGNORE`, so
/// concurrent completions for the same file never overwrite each other.
#[derive(Clone)]
pub struct PartialUploadLedger {
    pool: SqlitePool,
}

impl PartialUploadLedger {
    pub async fn new(database_url: &str) -> LedgerResult<Self> {
        let pool = crate::db::connect(database_url).await?;
        Self::with_pool(pool).await
    }

    /// Create ledger with in-memory database (for testing)
    pub async fn new_in_memory() -> LedgerResult<Self> {
        Self::new(crate::db::IN_MEMORY_URL).await
    }

    pub async fn with_pool(pool: SqlitePool) -> LedgerResult<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS partial_uploads (
                checksum TEXT PRIMARY KEY,
                file_name TEXT NOT NULL,
                total_size INTEGER NOT NULL,
                mime_type TEXT NOT NULL,
                total_chunks INTEGER NOT NULL,
                chunk_size INTEGER NOT NULL,
                owner TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS partial_upload_chunks (
                checksum TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                server_id TEXT NOT NULL,
                locator TEXT NOT NULL,
                chunk_checksum TEXT NOT NULL,
                completed_at INTEGER NOT NULL,
                PRIMARY KEY (checksum, chunk_index)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_partial_uploads_owner ON partial_uploads(owner)")
            .execute(&pool)
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_partial_uploads_updated ON partial_uploads(updated_at)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub async fn find_by_checksum(&self, checksum: &str) -> LedgerResult<Option<LedgerEntry>> {
        let checksum = IntegrityVerifier::normalize_checksum(checksum)?;
        let row = sqlx::query("SELECT * FROM partial_uploads WHERE checksum = ?")
            .bind(&checksum)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.entry_from_row(&row).await?)),
            None => Ok(None),
        }
    }

    /// Entry to resume for a file of `total_size` bytes, if any.
    ///
    /// A recorded entry with the same checksum but a different size is an
    /// integrity anomaly and is reported as an error, never resumed.
    pub async fn check_resumable(
        &self,
        checksum: &str,
        total_size: u64,
    ) -> LedgerResult<Option<LedgerEntry>> {
        let Some(entry) = self.find_by_checksum(checksum).await? else {
            return Ok(None);
        };
        if entry.total_size != total_size {
            return Err(LedgerError::SizeMismatch {
                checksum: entry.checksum,
                recorded: entry.total_size,
                actual: total_size,
            });
        }
        Ok(Some(entry))
    }

    /// Record a file, or refresh the metadata of an existing record.
    ///
    /// Completed chunks are untouched. The size and chunk layout of an
    /// existing record cannot change.
    pub async fn create_or_update(&self, entry: &LedgerEntry) -> LedgerResult<()> {
        let checksum = IntegrityVerifier::normalize_checksum(&entry.checksum)?;
        let now = Utc::now().timestamp_millis();

        let result = sqlx::query(
            r#"
            INSERT INTO partial_uploads
            (checksum, file_name, total_size, mime_type, total_chunks, chunk_size, owner, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(checksum) DO UPDATE SET
                file_name = excluded.file_name,
                mime_type = excluded.mime_type,
                owner = COALESCE(excluded.owner, partial_uploads.owner),
                updated_at = excluded.updated_at
            WHERE partial_uploads.total_size = excluded.total_size
              AND partial_uploads.chunk_size = excluded.chunk_size
              AND partial_uploads.total_chunks = excluded.total_chunks
            "#,
        )
        .bind(&checksum)
        .bind(&entry.file_name)
        .bind(to_db(entry.total_size)?)
        .bind(&entry.mime_type)
        .bind(entry.total_chunks as i64)
        .bind(to_db(entry.chunk_size)?)
        .bind(&entry.owner)
        .bind(entry.created_at.timestamp_millis())
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let existing = self.find_by_checksum(&checksum).await?;
            return match existing {
                Some(existing) if existing.total_size != entry.total_size => {
                    Err(LedgerError::SizeMismatch {
                        checksum,
                        recorded: existing.total_size,
                        actual: entry.total_size,
                    })
                }
                _ => Err(LedgerError::LayoutConflict(checksum)),
            };
        }
        Ok(())
    }

    /// Record chunk `index` of `checksum` as stored.
    ///
    /// Returns `false` when the chunk was already recorded.
    pub async fn mark_chunk_complete(
        &self,
        checksum: &str,
        index: u32,
        server_id: &str,
        locator: &str,
        chunk_checksum: &str,
    ) -> LedgerResult<bool> {
        let checksum = IntegrityVerifier::normalize_checksum(checksum)?;
        let now = Utc::now().timestamp_millis();

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO partial_upload_chunks
            (checksum, chunk_index, server_id, locator, chunk_checksum, completed_at)
            SELECT checksum, ?, ?, ?, ?, ?
            FROM partial_uploads
            WHERE checksum = ? AND ? < total_chunks
            "#,
        )
        .bind(index as i64)
        .bind(server_id)
        .bind(locator)
        .bind(chunk_checksum)
        .bind(now)
        .bind(&checksum)
        .bind(index as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            sqlx::query("UPDATE partial_uploads SET updated_at = ? WHERE checksum = ?")
                .bind(now)
                .bind(&checksum)
                .execute(&self.pool)
                .await?;
            return Ok(true);
        }

        // Nothing inserted: already recorded, unknown file, or bad index.
        let row = sqlx::query("SELECT total_chunks FROM partial_uploads WHERE checksum = ?")
            .bind(&checksum)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Err(LedgerError::NotFound(checksum));
        };
        let total_chunks = row.try_get::<i64, _>("total_chunks")? as u32;
        if index >= total_chunks {
            return Err(LedgerError::InvalidChunkIndex {
                checksum,
                index,
                total_chunks,
            });
        }
        Ok(false)
    }

    /// Remove an entry and its chunk records.
    pub async fn delete(&self, checksum: &str) -> LedgerResult<bool> {
        let checksum = IntegrityVerifier::normalize_checksum(checksum)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM partial_upload_chunks WHERE checksum = ?")
            .bind(&checksum)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM partial_uploads WHERE checksum = ?")
            .bind(&checksum)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Entries for `owner`, or all entries when `owner` is `None`, most
    /// recently updated first.
    pub async fn list(&self, owner: Option<&str>) -> LedgerResult<Vec<LedgerEntry>> {
        let rows = match owner {
            Some(owner) => {
                sqlx::query(
                    "SELECT * FROM partial_uploads WHERE owner = ? ORDER BY updated_at DESC",
                )
                .bind(owner)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM partial_uploads ORDER BY updated_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(self.entry_from_row(&row).await?);
        }
        Ok(entries)
    }

    /// Delete entries not updated within `retention`.
    pub async fn sweep_abandoned(&self, retention: Duration) -> LedgerResult<u64> {
        let retention_ms = i64::try_from(retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp_millis().saturating_sub(retention_ms);

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            DELETE FROM partial_upload_chunks
            WHERE checksum IN (SELECT checksum FROM partial_uploads WHERE updated_at <= ?)
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query("DELETE FROM partial_uploads WHERE updated_at <= ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let swept = result.rows_affected();
        if swept > 0 {
            tracing::info!(swept, "swept abandoned partial uploads");
        }
        Ok(swept)
    }

    pub async fn count(&self) -> LedgerResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM partial_uploads")
            .fetch_one(&self.pool)
            .await?;

        Ok(row.try_get("count")?)
    }

    async fn entry_from_row(&self, row: &SqliteRow) -> LedgerResult<LedgerEntry> {
        let checksum: String = row.try_get("checksum")?;
        let chunk_rows = sqlx::query(
            "SELECT * FROM partial_upload_chunks WHERE checksum = ? ORDER BY chunk_index",
        )
        .bind(&checksum)
        .fetch_all(&self.pool)
        .await?;

        let mut completed = Vec::with_capacity(chunk_rows.len());
        for chunk in &chunk_rows {
            completed.push(ChunkLocation {
                chunk_index: chunk.try_get::<i64, _>("chunk_index")? as u32,
                server_id: chunk.try_get("server_id")?,
                locator: chunk.try_get("locator")?,
                chunk_checksum: chunk.try_get("chunk_checksum")?,
                completed_at: from_millis(chunk.try_get("completed_at")?),
            });
        }

        Ok(LedgerEntry {
            checksum,
            file_name: row.try_get("file_name")?,
            total_size: row.try_get::<i64, _>("total_size")?.max(0) as u64,
            mime_type: row.try_get("mime_type")?,
            total_chunks: row.try_get::<i64, _>("total_chunks")? as u32,
            chunk_size: row.try_get::<i64, _>("chunk_size")?.max(0) as u64,
            owner: row.try_get("owner")?,
            completed,
            created_at: from_millis(row.try_get("created_at")?),
            updated_at: from_millis(row.try_get("updated_at")?),
        })
    }
}

fn to_db(value: u64) -> LedgerResult<i64> {
    i64::try_from(value).map_err(|_| LedgerError::DatabaseError(format!("{value} out of range")))
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
