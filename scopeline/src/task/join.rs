use crate::context;
use crate::error::{Error, Result};
use crate::task::handle::TaskHandle;
use crate::task::node::{Outcome, TaskNode};
use crate::task::state::TaskState;
use crate::task::task::Task;
use crate::task::Id;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

/// An owned permission to join on a task: await its result.
///
/// The task started running (or was queued) when it was spawned, awaiting the
/// handle only observes it. Dropping a `JoinHandle` *detaches* the task: it
/// keeps running and stays a child of its scope, its return value is lost.
///
/// Awaiting resolves once the task and all of its children are terminal:
///
/// - `Ok(value)` when the task completed,
/// - the task's error when it failed,
/// - [`Error::Cancelled`] when it was cancelled.
///
/// Awaiting is itself a cancellation point: if the *awaiting* task is
/// cancelled, the await resolves with [`Error::Cancelled`] and the awaited
/// task is left alone.
///
/// ```no_run
/// # scopeline::run_root(async {
/// let handle = scopeline::spawn(async { Ok(5 + 3) });
/// assert_eq!(handle.await?, 8);
/// # Ok(())
/// # }).unwrap();
/// ```
pub struct JoinHandle<T> {
    task: Arc<Task>,
    output: Arc<Mutex<Option<T>>>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(task: Arc<Task>, output: Arc<Mutex<Option<T>>>) -> Self {
        JoinHandle { task, output }
    }

    pub fn id(&self) -> Id {
        self.task.id()
    }

    pub fn name(&self) -> Option<&str> {
        self.task.node.name()
    }

    pub fn state(&self) -> TaskState {
        self.task.node.state()
    }

    /// True once the task and its children reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.task.node.is_terminal()
    }

    /// Requests cancellation of the task and its subtree. Returns immediately,
    /// the task stops at its next suspension point.
    pub fn cancel(&self) {
        self.task.node.cancel();
    }

    /// Starts a lazily spawned task. Returns false when the task was already
    /// started or is done.
    pub fn start(&self) -> bool {
        self.task.node.start_lazy()
    }

    /// Runs `f` once the task is terminal, right away if it already is.
    pub fn on_completion<F>(&self, f: F)
    where
        F: FnOnce(&Outcome) + Send + 'static,
    {
        self.task.node.on_completion(Box::new(f));
    }

    /// A cloneable, untyped handle on the same task.
    pub fn task_handle(&self) -> TaskHandle {
        TaskHandle::new(Arc::clone(&self.task.node))
    }

    /// Cancels the task and waits for it to be terminal.
    pub async fn cancel_and_join(self) -> Result<()> {
        self.cancel();
        self.task_handle().join().await
    }

    pub(crate) fn node(&self) -> &Arc<TaskNode> {
        &self.task.node
    }

    pub(crate) fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// The result, if the task is terminal. Used by drivers that poll the
    /// root task from outside of any runtime context.
    pub(crate) fn try_output(&self) -> Option<Result<T>> {
        self.task.node.outcome().map(|outcome| self.take(outcome))
    }

    fn take(&self, outcome: Outcome) -> Result<T> {
        match outcome {
            Outcome::Completed => self
                .output
                .lock()
                .take()
                .ok_or_else(|| Error::illegal_state("task output was already taken")),
            Outcome::Failed(err) => Err(err),
            Outcome::Cancelled => Err(Error::Cancelled),
        }
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A terminal task reports its own outcome, even to a caller that is
        // being cancelled because of it.
        if let Poll::Ready(outcome) = self.task.node.poll_outcome(cx) {
            return Poll::Ready(self.take(outcome));
        }

        ready!(context::poll_cancellation())?;

        self.start();
        let outcome = ready!(self.task.node.poll_outcome(cx));
        Poll::Ready(self.take(outcome))
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("JoinHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
