use std::time::Duration;

use sqlx::SqlitePool;

use crate::events::{self, LogEvent, LogSink};

pub const DEFAULT_RETRY_COUNT: u32 = 5;
pub const DEFAULT_BACKOFF_TIME: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Settings and resources shared by every part of the queue.
///
/// Construct with [`Config::new`] and override fields as needed. Fields left
/// at their defaults are filled in by [`crate::JobQueue::new`]: absent log
/// sinks become the stdout/stderr pair, and a zero poll interval falls back
/// to [`DEFAULT_POLL_INTERVAL`].
pub struct Config {
    /// The database holding the jobs table.
    pub db: SqlitePool,

    /// Optional schema qualifier for the jobs table (`<db_name>.jobs`).
    pub db_name: Option<String>,

    /// How many retries a job is allowed before the claim query stops
    /// returning it. The first failure does not count, so a job gets
    /// `retry_count + 1` total attempts.
    pub retry_count: u32,

    /// How long a failed job waits before becoming available again.
    pub backoff_time: Duration,

    /// How frequently each worker checks for new jobs.
    pub poll_interval: Duration,

    /// How long an individual handler may run before the job is marked
    /// failed. Zero disables the deadline.
    pub job_timeout: Duration,

    /// Called for informational logs. Defaults to a stdout writer.
    pub info_log: Option<LogSink>,

    /// Called for error logs. Defaults to a stderr writer.
    pub error_log: Option<LogSink>,
}

impl Config {
    pub fn new(db: SqlitePool) -> Self {
        Self {
            db,
            db_name: None,
            retry_count: DEFAULT_RETRY_COUNT,
            backoff_time: DEFAULT_BACKOFF_TIME,
            poll_interval: DEFAULT_POLL_INTERVAL,
            job_timeout: Duration::ZERO,
            info_log: None,
            error_log: None,
        }
    }

    pub(crate) fn log_info(&self, ev: LogEvent) {
        match &self.info_log {
            Some(sink) => sink(&ev),
            None => events::default_info_log(&ev),
        }
    }

    pub(crate) fn log_error(&self, ev: LogEvent) {
        match &self.error_log {
            Some(sink) => sink(&ev),
            None => events::default_error_log(&ev),
        }
    }
}
