//! All SQL against the jobs table.
//!
//! Four operations cover the whole lifecycle: [`JobStore::insert`] creates a
//! row, [`JobStore::claim`] + [`JobStore::assign`] take it inside one
//! transaction, and [`JobStore::finalize`] records the outcome. No other
//! component issues SQL.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite, SqlitePool, Transaction};

use crate::clock;
use crate::error::QueueError;
use crate::job::{JobRecord, JobStatus};

/// The shape of the jobs table, for tests, benches and first-run setups.
/// Production deployments normally create the table through their own
/// migration tooling.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    operation     TEXT NOT NULL,
    status        TEXT NOT NULL,
    payload       BLOB,
    output        BLOB,
    error_output  BLOB,
    locked_by     TEXT,
    locked_until  TIMESTAMP,
    retry_count   INTEGER NOT NULL DEFAULT 0,
    available_at  TIMESTAMP NOT NULL,
    created_at    TIMESTAMP NOT NULL,
    updated_at    TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_available_at ON jobs (available_at);
CREATE INDEX IF NOT EXISTS idx_jobs_status_available_at ON jobs (status, available_at);
"#;

#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
    table: String,
}

impl JobStore {
    pub fn new(pool: SqlitePool, db_name: Option<&str>) -> Self {
        let table = match db_name {
            Some(name) => format!("{name}.jobs"),
            None => "jobs".to_string(),
        };
        Self { pool, table }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the jobs table and its indexes in the default schema if they
    /// do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), QueueError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, QueueError> {
        Ok(self.pool.begin().await?)
    }

    /// Select the earliest claimable row as of `now`.
    ///
    /// A row is claimable when its status is PENDING or FAILED, any previous
    /// claim has expired, its retries are below `max_retries` and its
    /// `available_at` has passed. Returns `None` when nothing qualifies so
    /// the caller can commit the empty transaction cheaply.
    pub async fn claim(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        now: DateTime<Utc>,
        max_retries: u32,
    ) -> Result<Option<JobRecord>, QueueError> {
        let sql = format!(
            "SELECT id, operation, status, payload, output, error_output, \
                    locked_by, locked_until, retry_count, available_at, created_at, updated_at \
             FROM {} \
             WHERE (status = 'PENDING' OR status = 'FAILED') \
               AND (locked_until IS NULL OR locked_until < ?) \
               AND retry_count < ? \
               AND available_at <= ? \
             ORDER BY available_at ASC \
             LIMIT 1",
            self.table
        );
        let row = sqlx::query_as::<_, JobRecord>(&sql)
            .bind(now)
            .bind(max_retries)
            .bind(now)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(row)
    }

    /// Mark a claimed row IN_PROGRESS under `worker_id` until `lock_until`.
    ///
    /// Must run in the same transaction as the preceding [`claim`]. SQLite
    /// takes no row locks on SELECT, so the update re-checks the claimable
    /// predicate; `false` means another worker won the row between the two
    /// statements and this transaction must be abandoned.
    ///
    /// [`claim`]: JobStore::claim
    pub async fn assign(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        id: i64,
        worker_id: &str,
        lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let sql = format!(
            "UPDATE {} \
             SET status = ?, locked_by = ?, locked_until = ?, updated_at = ? \
             WHERE id = ? \
               AND (status = 'PENDING' OR status = 'FAILED') \
               AND (locked_until IS NULL OR locked_until < ?)",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(JobStatus::InProgress.as_str())
            .bind(worker_id)
            .bind(lock_until)
            .bind(now)
            .bind(id)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Record a job's outcome and release its claim.
    ///
    /// Serialized output and error forms that are empty or carry no value
    /// (the JSON `null` token, `"null"`, `""`) are stored as SQL NULL, so a
    /// NULL column always means "no value" rather than "the string null".
    pub async fn finalize(
        &self,
        id: i64,
        status: JobStatus,
        output: Option<&Value>,
        error_output: Option<&str>,
        increment_retry: bool,
        available_at: Option<DateTime<Utc>>,
    ) -> Result<(), QueueError> {
        let output = match output {
            Some(value) => squash_empty(serde_json::to_vec(value)?),
            None => None,
        };
        let error_output = match error_output {
            Some(error) => squash_empty(serde_json::to_vec(error)?),
            None => None,
        };
        let now = clock::utc_now();

        let mut builder = QueryBuilder::<Sqlite>::new(format!("UPDATE {} SET status = ", self.table));
        builder.push_bind(status.as_str());
        builder.push(", output = ");
        builder.push_bind(output);
        builder.push(", error_output = ");
        builder.push_bind(error_output);
        builder.push(", updated_at = ");
        builder.push_bind(now);
        builder.push(", locked_by = NULL, locked_until = NULL");
        if increment_retry {
            builder.push(", retry_count = retry_count + 1");
        }
        if let Some(available_at) = available_at {
            builder.push(", available_at = ");
            builder.push_bind(clock::truncate_micros(available_at));
        }
        builder.push(" WHERE id = ");
        builder.push_bind(id);

        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    /// Insert a new PENDING row, eligible to run at `execute_at`.
    pub async fn insert<T>(
        &self,
        operation: &str,
        payload: &T,
        execute_at: DateTime<Utc>,
    ) -> Result<i64, QueueError>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(payload)?;
        let now = clock::utc_now();
        let sql = format!(
            "INSERT INTO {} \
             (operation, status, payload, locked_by, locked_until, retry_count, available_at, created_at, updated_at) \
             VALUES (?, ?, ?, NULL, NULL, 0, ?, ?, ?)",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(operation)
            .bind(JobStatus::Pending.as_str())
            .bind(payload)
            .bind(clock::truncate_micros(execute_at))
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }
}

/// The null-squashing rule for output and error columns.
fn squash_empty(bytes: Vec<u8>) -> Option<Vec<u8>> {
    match bytes.as_slice() {
        b"" | b"null" | b"\"null\"" | b"\"\"" => None,
        _ => Some(bytes),
    }
}
