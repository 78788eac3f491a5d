use crate::accounting::error::{AccountingError, AccountingResult};
use crate::accounting::types::{ReserveOutcome, UsageRecord};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::Path;

/// Best-effort per-account capacity bookkeeping.
///
/// Every mutation is one conditional `UPDATE`, so concurrent reservations
/// against the same account cannot both pass the capacity check.
#[derive(Clone)]
pub struct CapacityAccountant {
    pool: SqlitePool,
}

impl CapacityAccountant {
    pub async fn new(database_url: &str) -> AccountingResult<Self> {
        let pool = crate::db::connect(database_url).await?;
        Self::with_pool(pool).await
    }

    pub async fn new_in_memory() -> AccountingResult<Self> {
        Self::new(crate::db::IN_MEMORY_URL).await
    }

    /// Initialise the schema on an existing pool and drop reservations left
    /// over from a previous process.
    pub async fn with_pool(pool: SqlitePool) -> AccountingResult<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS account_usage (
                account_id TEXT PRIMARY KEY,
                used_bytes INTEGER NOT NULL DEFAULT 0,
                max_bytes INTEGER NOT NULL,
                reserved_bytes INTEGER NOT NULL DEFAULT 0,
                active INTEGER NOT NULL DEFAULT 1,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("UPDATE account_usage SET reserved_bytes = 0")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Read a JSON array of [`UsageRecord`]s.
    pub fn load_records(path: &Path) -> AccountingResult<Vec<UsageRecord>> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Insert or update an account. Outstanding reservations are kept.
    pub async fn upsert_account(&self, record: &UsageRecord) -> AccountingResult<()> {
        if record.account_id.is_empty() {
            return Err(AccountingError::InvalidRecord("empty account id".into()));
        }

        sqlx::query(
            r#"
            INSERT INTO account_usage (account_id, used_bytes, max_bytes, reserved_bytes, active, updated_at)
            VALUES (?, ?, ?, 0, ?, ?)
            ON CONFLICT(account_id) DO UPDATE SET
                used_bytes = excluded.used_bytes,
                max_bytes = excluded.max_bytes,
                active = excluded.active,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.account_id)
        .bind(to_db(record.used_bytes)?)
        .bind(to_db(record.max_bytes)?)
        .bind(record.active)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Reserve `bytes` on `account_id` if it is active and the write fits.
    pub async fn reserve(&self, account_id: &str, bytes: u64) -> AccountingResult<ReserveOutcome> {
        let bytes = to_db(bytes)?;
        let result = sqlx::query(
            r#"
            UPDATE account_usage
            SET reserved_bytes = reserved_bytes + ?, updated_at = ?
            WHERE account_id = ?
              AND active = 1
              AND used_bytes + reserved_bytes + ? <= max_bytes
            "#,
        )
        .bind(bytes)
        .bind(chrono::Utc::now().timestamp())
        .bind(account_id)
        .bind(bytes)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(ReserveOutcome::Reserved)
        } else {
            tracing::debug!(account_id, bytes, "capacity reservation rejected");
            crate::metrics::recorder::record_capacity_rejection(account_id);
            Ok(ReserveOutcome::Rejected)
        }
    }

    /// Turn a reservation into committed usage.
    pub async fn commit(&self, account_id: &str, bytes: u64) -> AccountingResult<()> {
        let bytes = to_db(bytes)?;
        let result = sqlx::query(
            r#"
            UPDATE account_usage
            SET used_bytes = used_bytes + ?,
                reserved_bytes = MAX(reserved_bytes - ?, 0),
                updated_at = ?
            WHERE account_id = ?
            "#,
        )
        .bind(bytes)
        .bind(bytes)
        .bind(chrono::Utc::now().timestamp())
        .bind(account_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AccountingError::UnknownAccount(account_id.to_string()));
        }
        Ok(())
    }

    /// Drop a reservation without recording usage.
    pub async fn release(&self, account_id: &str, bytes: u64) -> AccountingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE account_usage
            SET reserved_bytes = MAX(reserved_bytes - ?, 0), updated_at = ?
            WHERE account_id = ?
            "#,
        )
        .bind(to_db(bytes)?)
        .bind(chrono::Utc::now().timestamp())
        .bind(account_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AccountingError::UnknownAccount(account_id.to_string()));
        }
        Ok(())
    }

    pub async fn get(&self, account_id: &str) -> AccountingResult<Option<UsageRecord>> {
        let row = sqlx::query("SELECT * FROM account_usage WHERE account_id = ?")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| record_from_row(&row)).transpose()
    }

    pub async fn list(&self) -> AccountingResult<Vec<UsageRecord>> {
        let rows = sqlx::query("SELECT * FROM account_usage ORDER BY account_id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(record_from_row).collect()
    }
}

fn to_db(value: u64) -> AccountingResult<i64> {
    i64::try_from(value)
        .map_err(|_| AccountingError::InvalidRecord(format!("{value} bytes is out of range")))
}

fn record_from_row(row: &SqliteRow) -> AccountingResult<UsageRecord> {
    Ok(UsageRecord {
        account_id: row.try_get("account_id")?,
        used_bytes: row.try_get::<i64, _>("used_bytes")?.max(0) as u64,
        max_bytes: row.try_get::<i64, _>("max_bytes")?.max(0) as u64,
        reserved_bytes: row.try_get::<i64, _>("reserved_bytes")?.max(0) as u64,
        active: row.try_get("active")?,
    })
}
