//! The execution envelope: runs one handler under a deadline.

use std::future::Future;
use std::time::Duration;

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;

use crate::handler::HandlerResult;

/// What came out of one handler invocation.
pub(crate) struct ExecutionOutcome {
    pub output: Option<serde_json::Value>,
    pub error: Option<anyhow::Error>,
    pub timed_out: bool,
}

impl ExecutionOutcome {
    pub(crate) fn failure(error: anyhow::Error) -> Self {
        Self {
            output: None,
            error: Some(error),
            timed_out: false,
        }
    }

    fn from_result(result: HandlerResult) -> Self {
        match result {
            Ok(output) => Self {
                output,
                error: None,
                timed_out: false,
            },
            Err(error) => Self::failure(error),
        }
    }
}

/// Run a handler future, bounded by `timeout` when it is non-zero.
///
/// The handler receives a token derived from `parent`, so shutdown reaches
/// it while it runs. With a deadline, the handler is raced on its own task:
/// if the deadline expires first, the derived token is cancelled and a
/// synthetic timeout error is returned immediately. The task itself is not
/// aborted; a handler that ignores its token keeps running detached, but
/// its claim has already been decided and it can no longer affect the row.
pub(crate) async fn run_handler<F, Fut>(
    make_future: F,
    timeout: Duration,
    parent: &CancellationToken,
) -> ExecutionOutcome
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    let token = parent.child_token();
    if timeout.is_zero() {
        return ExecutionOutcome::from_result(make_future(token).await);
    }

    let mut task = tokio::spawn(make_future(token.clone()));
    tokio::select! {
        result = &mut task => match result {
            Ok(result) => ExecutionOutcome::from_result(result),
            Err(join_error) => {
                ExecutionOutcome::failure(anyhow!("handler task failed: {join_error}"))
            }
        },
        _ = tokio::time::sleep(timeout) => {
            token.cancel();
            ExecutionOutcome {
                output: None,
                error: Some(anyhow!("job timed out after {timeout:?}")),
                timed_out: true,
            }
        }
    }
}
