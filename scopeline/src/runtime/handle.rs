use crate::context;
use crate::error::Result;
use crate::runtime::{Dispatcher, OwnedTasks, RuntimeConfig, TestScheduler, spawn_builder};
use crate::scope::{Policy, TaskGroup};
use crate::task::{JoinHandle, NodeConfig, TaskNode};
use crate::time::Clock;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Handle to the runtime.
///
/// Every task keeps one, so a task can reach the resources of the runtime it
/// belongs to from any thread: its clock, its dispatchers and the top of its
/// task tree. Cheap to clone.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<Shared>,
}

struct Shared {
    cfg: RuntimeConfig,

    clock: Clock,

    tasks: Arc<OwnedTasks>,

    /// Parent of the root task of every `block_on` and of tasks spawned
    /// outside of any task. Never closed before shutdown.
    root: Arc<TaskNode>,

    dispatcher: Dispatcher,

    /// Elastic pool for blocking work, started on first use.
    io: OnceLock<Dispatcher>,

    /// Recreated when it was cancelled, see `background_node`.
    background: Mutex<Option<Arc<TaskNode>>>,

    shutdown: AtomicBool,
}

impl Handle {
    pub(crate) fn new(cfg: RuntimeConfig, clock: Clock, dispatcher: Dispatcher) -> Self {
        let mut root = NodeConfig::group(Policy::Supervisor);
        root.name = Some(Arc::from("runtime"));

        Handle {
            inner: Arc::new(Shared {
                cfg,
                clock,
                tasks: OwnedTasks::new(),
                root: TaskNode::new(root, None),
                dispatcher,
                io: OnceLock::new(),
                background: Mutex::new(None),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Returns a handle to the runtime of the current task, or to the runtime
    /// built on this thread.
    ///
    /// # Panics
    ///
    /// Panics when there is no such runtime. See [`Handle::try_current`].
    #[track_caller]
    pub fn current() -> Handle {
        match context::current_handle() {
            Some(handle) => handle,
            None => panic!("no scopeline runtime is active on this thread"),
        }
    }

    pub fn try_current() -> Option<Handle> {
        context::current_handle()
    }

    /// Spawns a top-level task: a child of the runtime rather than of the
    /// current task. Its failure is logged, not propagated.
    pub fn spawn<F, T>(&self, future: F) -> JoinHandle<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        spawn_builder().spawn_with(self, Some(Arc::clone(self.root())), future)
    }

    /// The dispatcher tasks run on unless told otherwise.
    pub fn default_dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Dispatcher for work that blocks its thread: an elastic pool capped by
    /// `Builder::max_io_threads`. On a virtual runtime everything runs on the
    /// virtual dispatcher, so this is the default dispatcher.
    pub fn io(&self) -> &Dispatcher {
        self.inner.io.get_or_init(|| {
            if self.inner.dispatcher.as_virtual().is_some() {
                return self.inner.dispatcher.clone();
            }

            match Dispatcher::elastic(self.inner.cfg.max_io_threads, "scopeline-io") {
                Ok(io) => io,
                Err(err) => {
                    tracing::error!(error = %err, "failed to start the I/O dispatcher");
                    self.inner.dispatcher.clone()
                }
            }
        })
    }

    /// Group of work that must not keep virtual time busy, such as periodic
    /// loops. It is a supervisor: failures are logged and isolated. On a
    /// virtual runtime it is cancelled when the root task of `block_on`
    /// returns.
    pub fn background_scope(&self) -> TaskGroup {
        TaskGroup::from_node(self.background_node(), self.clone(), None)
    }

    /// The virtual time controls, on a runtime built with
    /// [`Builder::new_virtual`](crate::runtime::Builder::new_virtual).
    pub fn test_scheduler(&self) -> Option<TestScheduler> {
        self.inner
            .dispatcher
            .as_virtual()
            .and_then(|virt| TestScheduler::new(self.clone(), virt.clone()))
    }

    /// Time elapsed since the runtime started, on the runtime's clock.
    pub fn now(&self) -> Duration {
        self.inner.clock.now()
    }

    pub(crate) fn cfg(&self) -> &RuntimeConfig {
        &self.inner.cfg
    }

    pub(crate) fn clock(&self) -> &Clock {
        &self.inner.clock
    }

    pub(crate) fn root(&self) -> &Arc<TaskNode> {
        &self.inner.root
    }

    pub(crate) fn tasks(&self) -> &Arc<OwnedTasks> {
        &self.inner.tasks
    }

    pub(crate) fn io_if_started(&self) -> Option<&Dispatcher> {
        self.inner.io.get()
    }

    pub(crate) fn background_node(&self) -> Arc<TaskNode> {
        let mut background = self.inner.background.lock();

        if let Some(node) = background.as_ref() {
            if !node.is_cancel_requested() {
                return Arc::clone(node);
            }
        }

        let cfg = NodeConfig {
            name: Some(Arc::from("background")),
            background: true,
            ..NodeConfig::group(Policy::Supervisor)
        };

        let node = TaskNode::new(cfg, Some(self.root()));
        if let Err(err) = self.root().attach_child(&node) {
            // Shutting down: the group is born cancelled and rejects children.
            tracing::debug!(error = %err, "background scope created after shutdown");
            node.cancel();
        }

        *background = Some(Arc::clone(&node));
        node
    }

    /// Cancels the background scope, if one was ever created. The next call
    /// to `background_node` starts a fresh one.
    pub(crate) fn cancel_background(&self) {
        let node = self.inner.background.lock().clone();

        if let Some(node) = node {
            node.cancel();
        }
    }

    /// Returns true the first time only.
    pub(crate) fn begin_shutdown(&self) -> bool {
        !self.inner.shutdown.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn ptr_eq(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("kind", &self.inner.cfg.kind)
            .field("dispatcher", &self.inner.dispatcher)
            .field("clock", &self.inner.clock)
            .field("tasks", &self.inner.tasks.len())
            .finish()
    }
}
