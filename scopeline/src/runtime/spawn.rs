//! Provides functions and types for spawning new tasks onto the runtime.
//!
//! Tasks can be spawned using the simple [`spawn()`] function for default
//! behavior, or configured using the [`SpawnBuilder`] for more control: a
//! name, a [`Dispatcher`], [`TaskOpts`] and a [`Start`] mode.
//!
//! By default a task becomes a child of the task that spawned it. Outside of
//! any task it becomes a top-level task of the runtime.
use crate::context;
use crate::error::{Error, Result};
use crate::runtime::{Dispatcher, Handle};
use crate::task::{self, JoinHandle, NodeConfig, TaskNode};
use bitflags::bitflags;
use std::future::Future;
use std::sync::{Arc, LazyLock};

/// Spawns a new task with default options.
///
/// This is a convenience function for [spawn_builder()].
///
/// The task is a child of the current task: it is cancelled with it, and
/// under the default fail-fast policy its failure cancels the parent.
///
/// # Panics
///
/// Panics when called outside of a runtime. See [`SpawnBuilder::try_spawn`]
/// for a fallible version.
#[track_caller]
pub fn spawn<F, T>(future: F) -> JoinHandle<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    spawn_builder().spawn(future)
}

/// Creates a new [SpawnBuilder] for configuring and spawning a task.
///
/// # Example
///
/// ```no_run
/// use scopeline::runtime::{Start, TaskOpts};
///
/// # scopeline::run_root(async {
/// let handle = scopeline::spawn_builder()
///     .name("audit-log")
///     .with_opts(TaskOpts::DETACHED)
///     .start(Start::Lazy)
///     .spawn(async { Ok(()) });
///
/// handle.start();
/// # Ok(())
/// # }).unwrap();
/// ```
pub fn spawn_builder() -> SpawnBuilder {
    SpawnBuilder::default()
}

/// Runs `work` as a child task on `dispatcher` and waits for its result.
///
/// The caller suspends until the child is done. Failures of the child are
/// returned here rather than propagated to the caller's scope.
pub async fn with_dispatcher<F, T>(dispatcher: &Dispatcher, work: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    spawn_builder()
        .on(dispatcher.clone())
        .with_opts(*SCOPED_TASK_OPTS)
        .try_spawn(work)?
        .await
}

/// Options of work whose outcome is handed back to a waiting caller.
pub(crate) static SCOPED_TASK_OPTS: LazyLock<TaskOpts> =
    LazyLock::new(|| TaskOptsInternal::REPORT_VIA_JOIN.into());

bitflags! {
    /// Configuration options for a new task.
    ///
    /// Passed to the runtime via [SpawnBuilder::with_opts].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    pub struct TaskOpts: u16 {
        /// The task has no parent: a root scope of its own.
        ///
        /// Cancelling the spawner does not reach it and its failure is only
        /// logged. This breaks structured concurrency, use sparingly.
        const DETACHED = 1;

        /// The task is attached to the runtime's background scope. Its timers
        /// do not keep virtual time from being idle and it is cancelled when
        /// the root task of a virtual runtime returns.
        const BACKGROUND = 1 << 1;
    }

    // == Not available publicly ==
    //
    // The bitspace is *shared* between TaskOpts and TaskOptsInternal:
    // - `TaskOpts` => defines flags starting from right-most bit.
    // - `TaskOptsInternal` => defines flags starting from left-most bit.
    #[doc(hidden)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    struct TaskOptsInternal: u16 {
        /// The failure is surfaced to whoever awaits the task instead of being
        /// propagated to its parent.
        const REPORT_VIA_JOIN = 1 << 15;
    }
}

impl From<TaskOptsInternal> for TaskOpts {
    fn from(val: TaskOptsInternal) -> Self {
        TaskOpts::from_bits_retain(val.bits())
    }
}

impl TaskOpts {
    pub(crate) fn is_detached(&self) -> bool {
        self.contains(TaskOpts::DETACHED)
    }

    pub(crate) fn is_background(&self) -> bool {
        self.contains(TaskOpts::BACKGROUND)
    }

    pub(crate) fn reports_via_join(&self) -> bool {
        self.contains_internal(TaskOptsInternal::REPORT_VIA_JOIN)
    }

    fn contains_internal(&self, other: TaskOptsInternal) -> bool {
        self.contains(other.into())
    }
}

/// When a freshly spawned task runs for the first time.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Start {
    /// Handed to its dispatcher right away.
    #[default]
    Default,

    /// Stays `Created` until [`JoinHandle::start`] is called or the task is
    /// awaited or joined. Cancelling it before that means it never runs.
    Lazy,

    /// The first poll runs inline on the spawning thread, later polls go
    /// through the dispatcher.
    Undispatched,

    /// Handed to its dispatcher right away, and the body always runs: a
    /// cancellation that arrives before the first poll is only observed at
    /// the body's first suspension point.
    Atomic,
}

/// A builder for configuring and spawning a new task.
///
/// Created by calling [spawn_builder()].
#[derive(Debug, Default)]
pub struct SpawnBuilder {
    opts: TaskOpts,

    name: Option<Arc<str>>,

    dispatcher: Option<Dispatcher>,

    start: Start,
}

impl SpawnBuilder {
    /// Sets the [TaskOpts] for the new task.
    pub fn with_opts(mut self, opts: TaskOpts) -> Self {
        self.opts = opts;
        self
    }

    /// Names the task, the name shows in logs and on its handles.
    pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Runs the task on `dispatcher` instead of the spawner's.
    pub fn on(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn start(mut self, start: Start) -> Self {
        self.start = start;
        self
    }

    /// Uses `dispatcher` unless one was picked explicitly.
    pub(crate) fn or_on(mut self, dispatcher: Option<&Dispatcher>) -> Self {
        if self.dispatcher.is_none() {
            self.dispatcher = dispatcher.cloned();
        }
        self
    }

    /// Spawns the task with the configured options.
    ///
    /// If the current scope is already cancelled or failing, the task is
    /// created cancelled and never runs.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a runtime.
    #[track_caller]
    pub fn spawn<F, T>(self, future: F) -> JoinHandle<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let Some(handle) = context::current_handle() else {
            panic!("`spawn` called outside of a runtime");
        };

        let parent = ambient_parent(&handle);
        self.spawn_with(&handle, parent, future)
    }

    /// Spawns a child of `parent`. A dead parent yields a task that is
    /// already cancelled.
    pub(crate) fn spawn_with<F, T>(
        self,
        handle: &Handle,
        parent: Option<Arc<TaskNode>>,
        future: F,
    ) -> JoinHandle<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let parent = self.resolve_parent(handle, parent);
        let (node, attached) = self.new_node(parent);

        if let Err(err) = attached {
            tracing::debug!(task.id = %node.id, error = %err, "launch rejected by a dead scope");
            node.cancel();
        }

        self.launch(handle, node, future)
    }

    /// Like [`spawn`](Self::spawn), but fails with `IllegalState` outside of a
    /// runtime or when the current scope no longer accepts children.
    pub fn try_spawn<F, T>(self, future: F) -> Result<JoinHandle<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let handle = context::current_handle()
            .ok_or_else(|| Error::illegal_state("`spawn` called outside of a runtime"))?;

        let parent = ambient_parent(&handle);
        self.spawn_under(&handle, parent, future)
    }

    /// Spawns a child of `parent`, which must still accept children.
    pub(crate) fn spawn_under<F, T>(
        self,
        handle: &Handle,
        parent: Option<Arc<TaskNode>>,
        future: F,
    ) -> Result<JoinHandle<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let parent = self.resolve_parent(handle, parent);
        let (node, attached) = self.new_node(parent);

        if let Err(err) = attached {
            tracing::debug!(task.id = %node.id, error = %err, "launch rejected by a dead scope");
            return Err(err);
        }

        Ok(self.launch(handle, node, future))
    }

    fn resolve_parent(
        &self,
        handle: &Handle,
        parent: Option<Arc<TaskNode>>,
    ) -> Option<Arc<TaskNode>> {
        if self.opts.is_detached() {
            None
        } else if self.opts.is_background() {
            Some(handle.background_node())
        } else {
            parent
        }
    }

    fn new_node(&self, parent: Option<Arc<TaskNode>>) -> (Arc<TaskNode>, Result<()>) {
        let cfg = NodeConfig {
            name: self.name.clone(),
            propagate: !self.opts.reports_via_join(),
            background: self.opts.is_background(),
            atomic: self.start == Start::Atomic,
            ..NodeConfig::task()
        };

        let node = TaskNode::new(cfg, parent.as_ref());
        let attached = match &parent {
            Some(parent) => parent.attach_child(&node),
            None => Ok(()),
        };

        (node, attached)
    }

    fn launch<F, T>(self, handle: &Handle, node: Arc<TaskNode>, future: F) -> JoinHandle<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        // Children inherit the dispatcher of the spawning task, as long as it
        // belongs to the same runtime.
        let dispatcher = self
            .dispatcher
            .or_else(|| {
                context::with_current(|ctx| {
                    ctx.filter(|c| c.handle.ptr_eq(handle))
                        .map(|c| c.dispatcher.clone())
                })
            })
            .unwrap_or_else(|| handle.default_dispatcher().clone());

        tracing::debug!(
            task.id = %node.id,
            task.name = ?node.name(),
            parent.id = ?node.parent().map(|p| p.id),
            dispatcher = dispatcher.name(),
            "spawn"
        );

        let (task, join) = task::new_task(future, node, dispatcher, handle.clone());

        if !handle.tasks().insert(&task) {
            task.shutdown();
            return join;
        }

        if task.node.is_terminal() {
            return join;
        }

        match self.start {
            Start::Default | Start::Atomic => task.schedule(),
            Start::Lazy => {}
            Start::Undispatched => task.run_inline(),
        }

        join
    }
}

fn ambient_parent(handle: &Handle) -> Option<Arc<TaskNode>> {
    context::current_node().or_else(|| Some(Arc::clone(handle.root())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_opts_internal() {
        let internal = TaskOptsInternal::REPORT_VIA_JOIN;
        let public: TaskOpts = internal.into();
        assert_eq!(internal.bits(), public.bits());
        assert!(public.reports_via_join());

        let mut combined = TaskOpts::DETACHED | TaskOpts::BACKGROUND;
        assert!(!combined.reports_via_join());

        combined.insert(internal.into());
        assert!(combined.reports_via_join());
        assert!(SCOPED_TASK_OPTS.reports_via_join());
    }

    #[test]
    fn test_task_opts_bitspace_no_overlap() {
        let all_public = TaskOpts::all();
        let all_internal = TaskOptsInternal::all().into();

        let overlap = all_public & all_internal;

        assert_eq!(
            overlap,
            TaskOpts::empty(),
            "Overlap detected between public and internal task options! Overlapping bits: {:#018b}",
            overlap.bits()
        );
    }

    #[test]
    fn test_spawn_outside_runtime() {
        let res = spawn_builder().try_spawn(async { Ok(()) });
        assert!(matches!(res, Err(Error::IllegalState(_))));
    }
}
