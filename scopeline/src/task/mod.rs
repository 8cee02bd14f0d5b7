//! Tasks: the unit of cancellable, suspendable work.
//!
//! Every task owns a node in the task tree. A task's children are the tasks
//! and groups spawned while it runs; it only reaches a terminal state once all
//! of them did. See [`TaskState`] for the lifecycle.
use crate::context;
use crate::error::{Error, Result};
use crate::runtime::{Dispatcher, Handle};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;

mod handle;
pub use self::handle::{Join, TaskHandle};

mod harness;

pub mod id;
pub use self::id::{Id, id, try_id};

mod join;
pub use self::join::JoinHandle;

pub(crate) mod node;
pub use self::node::{CancellationStats, FailureHandler, Outcome};
pub(crate) use self::node::{NodeConfig, TaskNode, Terminated};

mod state;
pub use self::state::TaskState;

pub(crate) mod task;
pub(crate) use self::task::{Notified, Task};

mod yield_now;
pub use self::yield_now::yield_now;

/// This is the constructor for a new task. The body's value is stored on the
/// side so the task itself stays untyped, the returned `JoinHandle` reads it.
pub(crate) fn new_task<F, T>(
    future: F,
    node: Arc<TaskNode>,
    dispatcher: Dispatcher,
    handle: Handle,
) -> (Arc<Task>, JoinHandle<T>)
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let output = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&output);

    let body = Box::pin(async move {
        let value = future.await?;
        *slot.lock() = Some(value);
        Ok::<(), Error>(())
    });

    let task = Task::new(node, body, dispatcher, handle);
    let join = JoinHandle::new(Arc::clone(&task), output);

    (task, join)
}

/// Handle on the task currently running.
///
/// # Panics
///
/// Panics when called outside of a task.
#[track_caller]
pub fn current() -> TaskHandle {
    try_current().expect("task::current() called outside of a task")
}

pub fn try_current() -> Option<TaskHandle> {
    context::current_node().map(TaskHandle::new)
}

/// False once the current task was asked to stop. Always true outside of a
/// task.
pub fn is_active() -> bool {
    context::current_node().is_none_or(|node| !node.is_cancel_requested())
}

/// Cancellation check point for code that does not otherwise suspend, such as
/// a CPU-bound loop.
pub fn ensure_active() -> Result<()> {
    if is_active() {
        Ok(())
    } else {
        Err(Error::Cancelled)
    }
}

/// Awaits every handle in order and collects the values. The first error
/// encountered is returned, the remaining handles are dropped which detaches
/// them.
pub async fn join_all<T, I>(handles: I) -> Result<Vec<T>>
where
    I: IntoIterator<Item = JoinHandle<T>>,
{
    let handles = handles.into_iter();
    let mut values = Vec::with_capacity(handles.size_hint().0);

    for handle in handles {
        values.push(handle.await?);
    }

    Ok(values)
}

#[cfg(test)]
mod tests;
