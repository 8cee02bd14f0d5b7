use crate::context;
use crate::error::Result;
use crate::task::node::{CancellationStats, Outcome, TaskNode};
use crate::task::state::TaskState;
use crate::task::Id;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

/// A cloneable handle on a task, without access to its return value.
///
/// Unlike a [`JoinHandle`], a `TaskHandle` can be shared freely: it is how
/// a task observes itself through [`task::current`], and how groups and
/// timeouts observe their members. Dropping it does nothing to the task.
///
/// [`JoinHandle`]: crate::task::JoinHandle
/// [`task::current`]: crate::task::current
#[derive(Clone)]
pub struct TaskHandle {
    node: Arc<TaskNode>,
}

impl TaskHandle {
    pub(crate) fn new(node: Arc<TaskNode>) -> Self {
        TaskHandle { node }
    }

    pub fn id(&self) -> Id {
        self.node.id
    }

    pub fn name(&self) -> Option<&str> {
        self.node.name()
    }

    pub fn state(&self) -> TaskState {
        self.node.state()
    }

    /// Running, or waiting on children, and nobody asked it to stop.
    pub fn is_active(&self) -> bool {
        self.node.state().is_active() && !self.node.is_cancel_requested()
    }

    /// Cancellation was requested, directly or because a failure is tearing
    /// the enclosing scope down.
    pub fn is_cancelled(&self) -> bool {
        self.node.is_cancel_requested()
    }

    pub fn is_finished(&self) -> bool {
        self.node.is_terminal()
    }

    /// The task observed its cancellation and then suspended again instead of
    /// unwinding.
    pub fn swallowed_cancellation(&self) -> bool {
        self.node.swallowed_cancellation()
    }

    /// The terminal outcome, once there is one.
    pub fn outcome(&self) -> Option<Outcome> {
        self.node.outcome()
    }

    /// Requests cancellation of the task and its subtree.
    pub fn cancel(&self) -> CancellationStats {
        self.node.cancel()
    }

    pub fn on_completion<F>(&self, f: F)
    where
        F: FnOnce(&Outcome) + Send + 'static,
    {
        self.node.on_completion(Box::new(f));
    }

    /// Waits for the task to be terminal, whatever the outcome. Fails only
    /// when the waiting task is itself cancelled.
    pub fn join(&self) -> Join {
        Join {
            node: Arc::clone(&self.node),
        }
    }

    pub(crate) fn node(&self) -> &Arc<TaskNode> {
        &self.node
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        self.node.id == other.node.id
    }
}

impl Eq for TaskHandle {}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Future returned by [`TaskHandle::join`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Join {
    node: Arc<TaskNode>,
}

impl Future for Join {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.node.poll_outcome(cx).is_ready() {
            return Poll::Ready(Ok(()));
        }

        ready!(context::poll_cancellation())?;

        self.node.start_lazy();
        ready!(self.node.poll_outcome(cx));
        Poll::Ready(Ok(()))
    }
}
