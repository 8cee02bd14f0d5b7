use crate::error::Result;
use crate::runtime::{Dispatcher, Handle};
use crate::task::Id;
use crate::task::node::TaskNode;
use std::cell::RefCell;
use std::sync::Arc;
use std::task::Poll;
use std::thread_local;

/// Everything a running task can query about where it runs. Installed for the
/// duration of every poll, whichever thread the poll happens on.
#[derive(Clone)]
pub(crate) struct TaskContext {
    pub(crate) handle: Handle,
    pub(crate) node: Arc<TaskNode>,
    pub(crate) dispatcher: Dispatcher,
}

thread_local! {
    static CURRENT_TASK: RefCell<Option<TaskContext>> = const { RefCell::new(None) };

    // The runtime built on this thread, so `spawn` works outside of tasks
    // (before `block_on`, or from the blocking caller).
    static RUNTIME: RefCell<Option<Handle>> = const { RefCell::new(None) };
}

/// Restores the previous task context on drop. Polls nest when a task runs
/// inline inside another one (unconfined dispatch, undispatched start, virtual
/// time advanced from a task).
pub(crate) struct TaskContextGuard {
    prev: Option<TaskContext>,
}

pub(crate) fn enter(ctx: TaskContext) -> TaskContextGuard {
    let prev = CURRENT_TASK.with(|cur| cur.borrow_mut().replace(ctx));
    TaskContextGuard { prev }
}

impl Drop for TaskContextGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT_TASK.with(|cur| *cur.borrow_mut() = prev);
    }
}

#[inline]
pub(crate) fn with_current<F, R>(f: F) -> R
where
    F: FnOnce(Option<&TaskContext>) -> R,
{
    CURRENT_TASK.with(|cur| f(cur.borrow().as_ref()))
}

pub(crate) fn current() -> Option<TaskContext> {
    with_current(|ctx| ctx.cloned())
}

pub(crate) fn current_node() -> Option<Arc<TaskNode>> {
    with_current(|ctx| ctx.map(|c| Arc::clone(&c.node)))
}

pub(crate) fn current_task_id() -> Option<Id> {
    with_current(|ctx| ctx.map(|c| c.node.id))
}

/// Runtime of the running task, or the runtime built on this thread.
pub(crate) fn current_handle() -> Option<Handle> {
    with_current(|ctx| ctx.map(|c| c.handle.clone()))
        .or_else(|| RUNTIME.with(|rt| rt.borrow().clone()))
}

pub(crate) fn in_task() -> bool {
    with_current(|ctx| ctx.is_some())
}

pub(crate) fn set_runtime(handle: Option<Handle>) -> Option<Handle> {
    RUNTIME.with(|rt| std::mem::replace(&mut *rt.borrow_mut(), handle))
}

pub(crate) fn is_runtime_active() -> bool {
    RUNTIME.with(|rt| rt.borrow().is_some())
}

/// Cancellation check shared by every suspension point. Outside of a task
/// there is nothing to cancel.
pub(crate) fn poll_cancellation() -> Poll<Result<()>> {
    let Some((node, policy)) =
        with_current(|ctx| ctx.map(|c| (Arc::clone(&c.node), c.handle.cfg().cancellation_policy)))
    else {
        return Poll::Ready(Ok(()));
    };

    node.poll_cancellation(policy)
}
