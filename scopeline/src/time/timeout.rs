use crate::error::{Error, Result};
use crate::runtime::{SCOPED_TASK_OPTS, spawn_builder};
use crate::task::Terminated;
use crate::time::sleep;
use futures::future::poll_fn;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

/// Runs `work` as a child task and fails with [`Error::Timeout`] if it is not
/// done within `duration`.
///
/// When the time runs out the child is cancelled, and this only returns once
/// it is terminal: nothing started by `work` outlives the call. A failure of
/// `work` is returned here instead of cancelling the caller's scope.
///
/// The timeout is a failure. Left unhandled in a fail-fast scope it cancels
/// the siblings of the caller, see [`with_timeout_or_none`] for the variant
/// that treats running out of time as a normal result.
///
/// ```no_run
/// use scopeline::time::{self, with_timeout};
/// use std::time::Duration;
///
/// # scopeline::run_root(async {
/// let res = with_timeout(Duration::from_millis(10), async {
///     time::sleep(Duration::from_secs(1)).await?;
///     Ok("too late")
/// })
/// .await;
///
/// assert!(res.unwrap_err().is_timeout());
/// # Ok(())
/// # }).unwrap();
/// ```
pub async fn with_timeout<F, T>(duration: Duration, work: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    with_timeout_or_none(duration, work)
        .await?
        .ok_or(Error::Timeout(duration))
}

/// Like [`with_timeout`], but running out of time yields `Ok(None)`.
pub async fn with_timeout_or_none<F, T>(duration: Duration, work: F) -> Result<Option<T>>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let mut handle = spawn_builder()
        .name("timeout")
        .with_opts(*SCOPED_TASK_OPTS)
        .try_spawn(work)?;
    let node = Arc::clone(handle.node());
    let mut timer = sleep(duration);

    // The work is polled first: when both are ready the value wins.
    let raced = poll_fn(|cx| {
        if let Poll::Ready(res) = Pin::new(&mut handle).poll(cx) {
            return Poll::Ready(Some(res));
        }

        match Pin::new(&mut timer).poll(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(None),
            Poll::Ready(Err(err)) => Poll::Ready(Some(Err(err))),
            Poll::Pending => Poll::Pending,
        }
    })
    .await;
    drop(timer);

    match raced {
        Some(Ok(value)) => Ok(Some(value)),
        Some(Err(err)) => {
            // The caller itself was cancelled, the work goes down with it.
            if !node.is_terminal() {
                node.cancel();
                Terminated::new(node).await;
            }
            Err(err)
        }
        None => {
            tracing::debug!(
                task.id = %node.id,
                timeout = ?duration,
                "timed out, cancelling work"
            );
            node.cancel();
            Terminated::new(node).await;
            Ok(None)
        }
    }
}
