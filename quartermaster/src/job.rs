use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use thiserror::Error;

/// The lifecycle state of a job row.
///
/// `Pending → InProgress` on claim, then `Completed` on success or `Failed`
/// on failure. A failed job goes back through `InProgress` on re-claim until
/// its retries run out. `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }
}

#[derive(Error, Debug)]
#[error("unknown job status: {0}")]
pub struct ParseJobStatusError(String);

impl FromStr for JobStatus {
    type Err = ParseJobStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "IN_PROGRESS" => Ok(JobStatus::InProgress),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(ParseJobStatusError(other.to_string())),
        }
    }
}

/// One row of the jobs table.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: i64,
    pub operation: String,
    pub status: JobStatus,
    payload: Bytes,
    pub output: Option<Bytes>,
    pub error_output: Option<Bytes>,
    pub locked_by: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// The payload exactly as stored: JSON-shaped bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Decode the payload into a concrete type.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

impl<'r> FromRow<'r, SqliteRow> for JobRecord {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let status = row
            .try_get::<String, _>("status")?
            .parse::<JobStatus>()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        let payload = row
            .try_get::<Option<Vec<u8>>, _>("payload")?
            .map(Bytes::from)
            .unwrap_or_default();
        let output = row.try_get::<Option<Vec<u8>>, _>("output")?.map(Bytes::from);
        let error_output = row
            .try_get::<Option<Vec<u8>>, _>("error_output")?
            .map(Bytes::from);
        Ok(Self {
            id: row.try_get("id")?,
            operation: row.try_get("operation")?,
            status,
            payload,
            output,
            error_output,
            locked_by: row.try_get("locked_by")?,
            locked_until: row.try_get("locked_until")?,
            retry_count: row.try_get("retry_count")?,
            available_at: row.try_get("available_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            JobStatus::Pending,
            JobStatus::InProgress,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<JobStatus>().is_err());
    }
}
