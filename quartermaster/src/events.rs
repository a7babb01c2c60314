//! Structured log events and the injected sink pair.
//!
//! The queue never writes to a logger directly. Every observable event is
//! packed into a [`LogEvent`] and handed to one of two callbacks from the
//! configuration: an info sink and an error sink. The defaults print a
//! single line to stdout / stderr; [`tracing_info_sink`] and
//! [`tracing_error_sink`] forward into `tracing` instead.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A logging callback accepting a structured event.
pub type LogSink = Arc<dyn Fn(&LogEvent) + Send + Sync>;

/// Everything known about one loggable moment in the queue.
#[derive(Debug, Default, Clone)]
pub struct LogEvent {
    /// A human-readable message about the event.
    pub message: String,

    /// The id of the worker that triggered the log, if any.
    pub worker_id: Option<String>,

    /// The job id, if available.
    pub job_id: Option<i64>,

    /// The operation name, if available.
    pub operation: Option<String>,

    /// Any error associated with the event, already rendered.
    pub error: Option<String>,

    /// How long the job or operation took, if relevant.
    pub duration: Option<Duration>,
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(worker_id) = &self.worker_id {
            write!(f, " | worker={worker_id}")?;
        }
        if let Some(job_id) = self.job_id {
            write!(f, " | job={job_id}")?;
        }
        if let Some(operation) = &self.operation {
            write!(f, " | operation={operation}")?;
        }
        if let Some(duration) = self.duration {
            write!(f, " | took={duration:?}")?;
        }
        if let Some(error) = &self.error {
            write!(f, " | error: {error}")?;
        }
        Ok(())
    }
}

pub(crate) fn default_info_log(ev: &LogEvent) {
    println!("[quartermaster:INFO] {ev}");
}

pub(crate) fn default_error_log(ev: &LogEvent) {
    eprintln!("[quartermaster:ERROR] {ev}");
}

/// The default info sink: one line per event on stdout.
pub fn default_info_sink() -> LogSink {
    Arc::new(default_info_log)
}

/// The default error sink: one line per event on stderr.
pub fn default_error_sink() -> LogSink {
    Arc::new(default_error_log)
}

/// An info sink that emits `tracing::info!` events with structured fields.
pub fn tracing_info_sink() -> LogSink {
    Arc::new(|ev| {
        tracing::info!(
            worker_id = ev.worker_id.as_deref(),
            job_id = ev.job_id,
            operation = ev.operation.as_deref(),
            duration = ?ev.duration,
            "{}",
            ev.message
        );
    })
}

/// An error sink that emits `tracing::error!` events with structured fields.
pub fn tracing_error_sink() -> LogSink {
    Arc::new(|ev| {
        tracing::error!(
            worker_id = ev.worker_id.as_deref(),
            job_id = ev.job_id,
            operation = ev.operation.as_deref(),
            duration = ?ev.duration,
            error = ev.error.as_deref(),
            "{}",
            ev.message
        );
    })
}
