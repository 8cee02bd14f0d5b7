use crate::context::{self, TaskContext};
use crate::error::{Error, Result};
use crate::runtime::{CancellationPolicy, Schedule};
use crate::task::state::{TransitionToIdle, TransitionToRunning};
use crate::task::task::{BoxedBody, Notified, Task};
use futures::task::waker_ref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::task::{Context, Poll};

enum PollFuture {
    /// Suspended, woken later through its waker.
    Pending,
    /// The body resolved, panicked or was aborted.
    Ready(Result<()>),
    /// Nothing to poll: the task finished or was cancelled before start.
    Skipped,
}

/// Polls the body once. All state checks and transitions are performed here,
/// panics raised by the body are caught and turned into failures.
pub(super) fn poll(task: Arc<Task>) {
    if task.state.transition_to_running() == TransitionToRunning::Complete {
        return;
    }

    let res = {
        let _ctx = context::enter(TaskContext {
            handle: task.handle.clone(),
            node: Arc::clone(&task.node),
            dispatcher: task.dispatcher.clone(),
        });

        let mut body = task.body.lock();
        let res = poll_body(&task, &mut body);

        // Drop the body while its context is still installed.
        if !matches!(res, PollFuture::Pending) {
            *body = None;
        }

        res
    };

    match res {
        PollFuture::Pending => {
            if task.state.transition_to_idle() == TransitionToIdle::Notified {
                let dispatcher = task.dispatcher.clone();
                dispatcher.schedule(Notified(task));
            }
        }
        PollFuture::Ready(res) => {
            task.state.set_complete();
            task.node.body_finished(res);
        }
        PollFuture::Skipped => task.state.set_complete(),
    }
}

fn poll_body(task: &Arc<Task>, body: &mut Option<BoxedBody>) -> PollFuture {
    let Some(fut) = body.as_mut() else {
        return PollFuture::Skipped;
    };

    if !task.node.start() {
        return PollFuture::Skipped;
    }

    let waker = waker_ref(task);
    let mut cx = Context::from_waker(&waker);

    match panic::catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(&mut cx))) {
        Ok(Poll::Ready(res)) => PollFuture::Ready(res),
        Ok(Poll::Pending) => {
            let strict = task.handle.cfg().cancellation_policy == CancellationPolicy::Strict;

            if strict && task.node.swallowed_cancellation() {
                tracing::error!(
                    task.id = %task.id(),
                    task.name = ?task.node.name(),
                    "task swallowed its cancellation, dropping its body"
                );
                PollFuture::Ready(Err(Error::Cancelled))
            } else {
                PollFuture::Pending
            }
        }
        Err(payload) => PollFuture::Ready(Err(Error::from_panic(payload))),
    }
}
