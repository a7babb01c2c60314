//! The long-lived worker agent: poll, claim, execute, finalize.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::clock;
use crate::config::Config;
use crate::error::QueueError;
use crate::events::LogEvent;
use crate::executor::{run_handler, ExecutionOutcome};
use crate::job::{JobRecord, JobStatus};
use crate::registry::{HandlerRegistry, ResolvedHandler};
use crate::store::JobStore;

/// Advisory view of what a worker is doing. Diagnostics only; no behavior
/// hangs off these values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Busy,
    /// The last claim attempt hit a store error.
    Failing,
    /// The last executed job failed.
    ExecFailed,
}

impl WorkerStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerStatus::Busy,
            2 => WorkerStatus::Failing,
            3 => WorkerStatus::ExecFailed,
            _ => WorkerStatus::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WorkerStatus::Idle => 0,
            WorkerStatus::Busy => 1,
            WorkerStatus::Failing => 2,
            WorkerStatus::ExecFailed => 3,
        }
    }
}

/// A point-in-time observation of one worker.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub id: String,
    pub status: WorkerStatus,
    pub current_job: Option<i64>,
}

/// State shared between a worker task and the pool that observes it.
pub(crate) struct WorkerState {
    id: String,
    status: AtomicU8,
    current_job: Mutex<Option<i64>>,
}

impl WorkerState {
    fn new(id: String) -> Self {
        Self {
            id,
            status: AtomicU8::new(WorkerStatus::Idle.as_u8()),
            current_job: Mutex::new(None),
        }
    }

    pub(crate) fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id.clone(),
            status: WorkerStatus::from_u8(self.status.load(Ordering::Relaxed)),
            current_job: *self
                .current_job
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }

    fn set_status(&self, status: WorkerStatus) {
        self.status.store(status.as_u8(), Ordering::Relaxed);
    }

    fn set_current_job(&self, job_id: Option<i64>) {
        *self
            .current_job
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = job_id;
    }
}

pub(crate) struct Worker {
    state: Arc<WorkerState>,
    cfg: Arc<Config>,
    store: JobStore,
    registry: Arc<HandlerRegistry>,
    wake: async_channel::Receiver<()>,
    cancel: CancellationToken,
}

impl Worker {
    pub(crate) fn new(
        index: usize,
        cfg: Arc<Config>,
        store: JobStore,
        registry: Arc<HandlerRegistry>,
        wake: async_channel::Receiver<()>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state: Arc::new(WorkerState::new(format!("worker-{index}"))),
            cfg,
            store,
            registry,
            wake,
            cancel,
        }
    }

    pub(crate) fn state(&self) -> Arc<WorkerState> {
        self.state.clone()
    }

    fn id(&self) -> &str {
        &self.state.id
    }

    /// Poll for jobs until cancelled: one claim-execute cycle per ticker
    /// tick or wake signal, idle in between.
    pub(crate) async fn run(self) {
        let mut ticker = tokio::time::interval(self.cfg.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.cfg.log_info(LogEvent {
            message: format!("Worker {} started.", self.id()),
            worker_id: Some(self.id().to_string()),
            ..Default::default()
        });

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.cfg.log_info(LogEvent {
                        message: format!("Worker {} cancelled, stopping.", self.id()),
                        worker_id: Some(self.id().to_string()),
                        ..Default::default()
                    });
                    return;
                }

                _ = ticker.tick() => {
                    tracing::trace!(worker_id = self.id(), "polling for jobs");
                    self.fetch_and_process().await;
                }

                received = self.wake.recv() => match received {
                    Ok(()) => {
                        tracing::trace!(worker_id = self.id(), "woken by enqueue");
                        self.fetch_and_process().await;
                    }
                    // The pool and its wake sender are gone; cancellation
                    // is imminent and the ticker would spin on a closed
                    // channel, so just stop.
                    Err(_) => return,
                },
            }
        }
    }

    async fn fetch_and_process(&self) {
        self.state.set_status(WorkerStatus::Idle);

        let mut tx = match self.store.begin().await {
            Ok(tx) => tx,
            Err(error) => {
                self.log_store_error("Error starting claim transaction", None, &error);
                return;
            }
        };

        let now = clock::utc_now();
        let job = match self.store.claim(&mut tx, now, self.cfg.retry_count).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                let _ = tx.commit().await;
                return;
            }
            Err(error) => {
                let _ = tx.rollback().await;
                self.state.set_status(WorkerStatus::Failing);
                self.log_store_error("Error fetching job", None, &error);
                return;
            }
        };

        let lock_until = clock::add_duration(now, self.lock_ttl());
        match self
            .store
            .assign(&mut tx, job.id, self.id(), lock_until, now)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                // Another worker took the row between our SELECT and
                // UPDATE. Nothing was written; walk away.
                let _ = tx.rollback().await;
                tracing::debug!(worker_id = self.id(), job_id = job.id, "lost claim race");
                return;
            }
            Err(error) => {
                let _ = tx.rollback().await;
                self.log_store_error(&format!("Error assigning job {}", job.id), Some(&job), &error);
                return;
            }
        }
        if let Err(error) = tx.commit().await {
            // The row keeps whatever lock state the database settled on;
            // locked_until expiry makes it claimable again either way.
            self.log_store_error(
                &format!("Error committing assignment for job {}", job.id),
                Some(&job),
                &QueueError::Database(error),
            );
            return;
        }

        self.state.set_status(WorkerStatus::Busy);
        self.state.set_current_job(Some(job.id));

        let started = Instant::now();
        self.cfg.log_info(LogEvent {
            message: format!("Processing job {} (operation {})", job.id, job.operation),
            worker_id: Some(self.id().to_string()),
            job_id: Some(job.id),
            operation: Some(job.operation.clone()),
            ..Default::default()
        });

        let (outcome, backoff_override) = self.execute(job.clone()).await;
        let elapsed = started.elapsed();

        let prior_failed = job.status == JobStatus::Failed;
        let finalize_result = match &outcome.error {
            None => {
                self.store
                    .finalize(
                        job.id,
                        JobStatus::Completed,
                        outcome.output.as_ref(),
                        None,
                        false,
                        None,
                    )
                    .await
            }
            Some(error) => {
                let backoff = backoff_override.unwrap_or(self.cfg.backoff_time);
                let next_available = clock::add_duration(clock::utc_now(), backoff);
                self.store
                    .finalize(
                        job.id,
                        JobStatus::Failed,
                        outcome.output.as_ref(),
                        Some(&error.to_string()),
                        prior_failed,
                        Some(next_available),
                    )
                    .await
            }
        };
        if let Err(error) = finalize_result {
            self.log_store_error(&format!("Error finishing job {}", job.id), Some(&job), &error);
        }

        match &outcome.error {
            None => {
                self.cfg.log_info(LogEvent {
                    message: format!("Job {} completed in {elapsed:?}", job.id),
                    worker_id: Some(self.id().to_string()),
                    job_id: Some(job.id),
                    operation: Some(job.operation.clone()),
                    duration: Some(elapsed),
                    ..Default::default()
                });
                self.state.set_status(WorkerStatus::Idle);
            }
            Some(error) => {
                self.cfg.log_error(LogEvent {
                    message: format!("Job {} failed in {elapsed:?}", job.id),
                    worker_id: Some(self.id().to_string()),
                    job_id: Some(job.id),
                    operation: Some(job.operation.clone()),
                    duration: Some(elapsed),
                    error: Some(error.to_string()),
                });
                self.state.set_status(WorkerStatus::ExecFailed);
            }
        }

        self.state.set_current_job(None);
    }

    /// Resolve the handler and run it under the effective policy. Returns
    /// the outcome plus the backoff override, if the handler carries one.
    async fn execute(&self, job: JobRecord) -> (ExecutionOutcome, Option<Duration>) {
        match self.registry.resolve(&job.operation) {
            None => (
                ExecutionOutcome::failure(anyhow!(
                    "no handler registered for operation {}",
                    job.operation
                )),
                None,
            ),
            Some(ResolvedHandler::Simple(handler)) => {
                let outcome =
                    run_handler(move |_token| handler(job), self.cfg.job_timeout, &self.cancel)
                        .await;
                (outcome, None)
            }
            Some(ResolvedHandler::Advanced(factory)) => {
                let instance = factory();
                let max_retries = instance.max_retries().unwrap_or(self.cfg.retry_count);
                let backoff = instance.backoff();
                let timeout = instance.job_timeout().unwrap_or(self.cfg.job_timeout);

                // The claim query only knows the queue-wide ceiling; a
                // tighter per-operation ceiling is enforced here, before
                // any work happens.
                if job.retry_count >= max_retries {
                    return (
                        ExecutionOutcome::failure(anyhow!(
                            "retry limit reached for operation {} ({max_retries})",
                            job.operation
                        )),
                        backoff,
                    );
                }

                let outcome = run_handler(
                    move |token| async move {
                        let mut instance = instance;
                        instance.run(job, token).await
                    },
                    timeout,
                    &self.cancel,
                )
                .await;
                (outcome, backoff)
            }
        }
    }

    /// The claim must outlive both the handler and the finalize round-trip,
    /// without making crash recovery slow.
    fn lock_ttl(&self) -> Duration {
        self.cfg.job_timeout.max(self.cfg.poll_interval * 2)
    }

    fn log_store_error(&self, message: &str, job: Option<&JobRecord>, error: &QueueError) {
        self.cfg.log_error(LogEvent {
            message: format!("{message} (worker {})", self.id()),
            worker_id: Some(self.id().to_string()),
            job_id: job.map(|j| j.id),
            operation: job.map(|j| j.operation.clone()),
            error: Some(error.to_string()),
            ..Default::default()
        });
    }
}
