//! Handler interfaces: the terse closure form and the policy-carrying
//! trait form.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// What a handler produces: an optional JSON value stored in the row's
/// `output` column, or an error stored in `error_output`.
pub type HandlerResult = Result<Option<Value>, anyhow::Error>;

/// A type-erased simple handler: an async function of the job row.
pub(crate) type SimpleHandler =
    Arc<dyn Fn(crate::job::JobRecord) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Produces a fresh [`AdvancedJob`] for each execution.
pub(crate) type AdvancedJobFactory = Arc<dyn Fn() -> Box<dyn AdvancedJob> + Send + Sync>;

/// A job implementation that carries its own execution policy.
///
/// A new instance is created for every execution, so implementations may
/// keep per-run state in `&mut self`. The three policy accessors override
/// the queue-wide configuration for this operation; returning `None` keeps
/// the configured value.
///
/// The cancellation token fires when the queue shuts down or when this
/// job's deadline expires. Long-running implementations should watch it:
///
/// ```rust
/// use quartermaster::prelude::*;
/// use quartermaster::async_trait;
///
/// struct Reindex;
///
/// #[async_trait]
/// impl AdvancedJob for Reindex {
///     async fn run(
///         &mut self,
///         _job: JobRecord,
///         cancellation: CancellationToken,
///     ) -> HandlerResult {
///         tokio::select! {
///             _ = tokio::time::sleep(std::time::Duration::from_secs(60)) => Ok(None),
///             _ = cancellation.cancelled() => Ok(None),
///         }
///     }
///
///     fn job_timeout(&self) -> Option<std::time::Duration> {
///         Some(std::time::Duration::from_secs(120))
///     }
/// }
/// ```
#[async_trait]
pub trait AdvancedJob: Send {
    async fn run(
        &mut self,
        job: crate::job::JobRecord,
        cancellation: CancellationToken,
    ) -> HandlerResult;

    /// Retry ceiling for this operation. May only tighten the queue-wide
    /// ceiling: the claim query filters on the configured value, so a larger
    /// number here has no effect.
    fn max_retries(&self) -> Option<u32> {
        None
    }

    /// Backoff applied to this operation's failures.
    fn backoff(&self) -> Option<Duration> {
        None
    }

    /// Deadline for this operation's executions. `Some(Duration::ZERO)`
    /// disables the deadline.
    fn job_timeout(&self) -> Option<Duration> {
        None
    }
}
