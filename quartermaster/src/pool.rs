//! Worker pool lifecycle: spawn, wake, graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::events::LogEvent;
use crate::registry::HandlerRegistry;
use crate::store::JobStore;
use crate::worker::{Worker, WorkerSnapshot, WorkerState};

/// Owns the worker tasks, the shared wake channel and the cancellation
/// scope they all derive from.
pub(crate) struct WorkerPool {
    cfg: Arc<Config>,
    cancel: CancellationToken,
    wake_tx: async_channel::Sender<()>,
    handles: Vec<JoinHandle<()>>,
    states: Vec<Arc<WorkerState>>,
}

impl WorkerPool {
    /// Spawn `count` workers sharing one wake channel of capacity `count`.
    /// Must be called within a Tokio runtime.
    pub(crate) fn start(
        count: usize,
        cfg: Arc<Config>,
        store: JobStore,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (wake_tx, wake_rx) = async_channel::bounded(count.max(1));

        cfg.log_info(LogEvent {
            message: format!("Starting {count} workers..."),
            ..Default::default()
        });

        let mut handles = Vec::with_capacity(count);
        let mut states = Vec::with_capacity(count);
        for index in 0..count {
            let worker = Worker::new(
                index,
                cfg.clone(),
                store.clone(),
                registry.clone(),
                wake_rx.clone(),
                cancel.child_token(),
            );
            states.push(worker.state());
            handles.push(tokio::spawn(worker.run()));
        }

        Self {
            cfg,
            cancel,
            wake_tx,
            handles,
            states,
        }
    }

    /// Nudge one idle worker to claim immediately. Non-blocking; when the
    /// channel is full every worker already has a pending wake-up, so the
    /// signal is dropped.
    pub(crate) fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    pub(crate) fn worker_snapshots(&self) -> Vec<WorkerSnapshot> {
        self.states.iter().map(|state| state.snapshot()).collect()
    }

    /// Cancel every worker and wait up to `timeout` for them to exit.
    ///
    /// On timeout the stragglers are left running detached: their
    /// cancellation has fired, so no further work is claimed, and any
    /// in-flight handler finishes on its own schedule.
    pub(crate) async fn shutdown(self, timeout: Duration) {
        self.cfg.log_info(LogEvent {
            message: "Shutdown requested. Stopping workers...".to_string(),
            ..Default::default()
        });
        self.cancel.cancel();

        match tokio::time::timeout(timeout, join_all(self.handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(join_error) = result {
                        self.cfg.log_error(LogEvent {
                            message: "Worker task panicked.".to_string(),
                            error: Some(join_error.to_string()),
                            ..Default::default()
                        });
                    }
                }
                self.cfg.log_info(LogEvent {
                    message: "All workers exited cleanly.".to_string(),
                    ..Default::default()
                });
            }
            Err(_) => {
                self.cfg.log_error(LogEvent {
                    message: format!(
                        "Shutdown timed out after {timeout:?}. Some workers may still be running."
                    ),
                    ..Default::default()
                });
            }
        }
    }
}
