#![doc = include_str!("../README.md")]

pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod job;
pub mod queue;
pub mod registry;
pub mod store;
pub mod worker;

mod clock;
mod executor;
mod pool;

pub use config::Config;
pub use handler::AdvancedJob;
pub use job::{JobRecord, JobStatus};
pub use queue::JobQueue;

pub use anyhow;
pub use async_trait::async_trait;
pub use chrono;
pub use serde_json;
pub use tokio_util::sync::CancellationToken;

/// An alias for `chrono::DateTime<chrono::Utc>`.
pub type DateTime = chrono::DateTime<chrono::Utc>;

pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{QueueError, RegistryError};
    pub use crate::events::{LogEvent, LogSink};
    pub use crate::handler::{AdvancedJob, HandlerResult};
    pub use crate::job::{JobRecord, JobStatus};
    pub use crate::queue::JobQueue;
    pub use crate::worker::{WorkerSnapshot, WorkerStatus};
    pub use tokio_util::sync::CancellationToken;
}
