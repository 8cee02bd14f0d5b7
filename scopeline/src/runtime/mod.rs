//! Runtimes, dispatchers and the spawn API.
//!
//! A [`Runtime`] owns everything tasks share: the clock, the registry of live
//! tasks, the root of the task tree and the default [`Dispatcher`]. A
//! dispatcher decides *where* the polls of a task run:
//!
//! - the runtime's own event loop (`Builder::new_local`),
//! - a pool of worker threads with work stealing (`Builder::new_pool`,
//!   [`Dispatcher::fixed`], [`Dispatcher::single_thread`],
//!   [`Dispatcher::elastic`]),
//! - inline on whatever thread wakes the task ([`Dispatcher::unconfined`]),
//! - a single cooperative thread driven by virtual time
//!   (`Builder::new_virtual`).
use crate::context;
use crate::task::Notified;
use anyhow::Result;
use std::fmt;

// Public API
pub mod runtime;
pub use runtime::{Builder, Runtime, run_root};

mod handle;
pub use handle::Handle;

mod spawn;
pub use spawn::{SpawnBuilder, Start, TaskOpts, spawn, spawn_builder, with_dispatcher};
pub(crate) use spawn::SCOPED_TASK_OPTS;

pub mod virtual_time;
pub use virtual_time::TestScheduler;

// Exports
pub(crate) mod local;

pub(crate) mod pool;

mod registry;
pub(crate) use registry::OwnedTasks;

pub(crate) use runtime::RuntimeConfig;

mod ticker;

mod unconfined;

// Used wherever we rely on SmallVec to store entries on stack first.
pub(crate) const SPILL_TO_HEAP_THRESHOLD: usize = 16;

/// What happens to a task that observed its cancellation and then suspended
/// again instead of unwinding.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationPolicy {
    /// The body is dropped at that suspension point and the task ends
    /// `Cancelled`. An error is logged.
    #[default]
    Strict,

    /// Every later suspension point keeps failing with `Error::Cancelled`, the
    /// task stays `Cancelling` until its body gives up.
    Lenient,
}

/// Scheduler trait
pub(crate) trait Schedule: Send + Sync + 'static {
    /// Hand a task that is ready to be polled to the scheduler.
    fn schedule(&self, task: Notified);
}

/// Abstraction of the queue every event loop pulls its work from.
pub(crate) trait EventLoop {
    type Task;

    fn add_task(&self, task: Self::Task);

    fn find_task(&self) -> Option<Self::Task>;
}

/// Where the polls of a task run.
///
/// Cheap to clone: every variant is a handle on a shared scheduler. A pool
/// stops its threads once the last handle on it is dropped.
#[derive(Clone)]
pub struct Dispatcher {
    kind: Kind,
}

#[derive(Clone)]
enum Kind {
    Local(local::Handle),
    Pool(pool::Handle),
    Unconfined,
    Virtual(virtual_time::Handle),
}

impl Dispatcher {
    /// A pool of `threads` workers with work stealing.
    pub fn fixed(threads: usize, name: impl Into<String>) -> Result<Self> {
        let cfg = pool::Config::fixed(threads, name.into())?;
        Ok(Self::from(pool::Handle::try_new(cfg)?))
    }

    /// A pool with exactly one worker: every task dispatched on it runs on the
    /// same thread, so state only ever touched from it needs no lock.
    pub fn single_thread(name: impl Into<String>) -> Result<Self> {
        Self::fixed(1, name)
    }

    /// A pool that starts threads on demand, up to `max_threads`. Meant for
    /// work that blocks its thread.
    pub fn elastic(max_threads: usize, name: impl Into<String>) -> Result<Self> {
        let cfg = pool::Config::elastic(max_threads, name.into())?;
        Ok(Self::from(pool::Handle::try_new(cfg)?))
    }

    /// Runs tasks inline, on the thread that spawns or wakes them.
    pub fn unconfined() -> Self {
        Dispatcher {
            kind: Kind::Unconfined,
        }
    }

    /// Dispatcher of the running task, or the default dispatcher of the
    /// runtime active on this thread.
    pub fn current() -> Option<Self> {
        context::with_current(|ctx| ctx.map(|c| c.dispatcher.clone()))
            .or_else(|| context::current_handle().map(|h| h.default_dispatcher().clone()))
    }

    pub fn name(&self) -> &str {
        match &self.kind {
            Kind::Local(_) => "local",
            Kind::Pool(pool) => pool.name(),
            Kind::Unconfined => "unconfined",
            Kind::Virtual(_) => "virtual",
        }
    }

    pub fn is_unconfined(&self) -> bool {
        matches!(self.kind, Kind::Unconfined)
    }

    /// Polled by the threads of a pool, fixed or elastic.
    pub(crate) fn is_pooled(&self) -> bool {
        matches!(self.kind, Kind::Pool(_))
    }

    pub(crate) fn as_local(&self) -> Option<&local::Handle> {
        match &self.kind {
            Kind::Local(local) => Some(local),
            _ => None,
        }
    }

    pub(crate) fn as_virtual(&self) -> Option<&virtual_time::Handle> {
        match &self.kind {
            Kind::Virtual(virt) => Some(virt),
            _ => None,
        }
    }

    pub(crate) fn local(handle: local::Handle) -> Self {
        Dispatcher {
            kind: Kind::Local(handle),
        }
    }

    pub(crate) fn virtual_time(handle: virtual_time::Handle) -> Self {
        Dispatcher {
            kind: Kind::Virtual(handle),
        }
    }

    /// Stops the threads of a pool and drops whatever is still queued. Queued
    /// tasks hold their dispatcher, clearing the queues breaks that cycle.
    pub(crate) fn shutdown(&self) {
        let dropped = match &self.kind {
            Kind::Local(local) => local.clear(),
            Kind::Pool(pool) => {
                pool.shutdown();
                0
            }
            Kind::Unconfined => 0,
            Kind::Virtual(virt) => virt.clear(),
        };

        if dropped > 0 {
            tracing::debug!(dispatcher = self.name(), tasks = dropped, "dropped queued tasks");
        }
    }
}

impl From<pool::Handle> for Dispatcher {
    fn from(handle: pool::Handle) -> Self {
        Dispatcher {
            kind: Kind::Pool(handle),
        }
    }
}

impl Schedule for Dispatcher {
    fn schedule(&self, task: Notified) {
        tracing::trace!(task.id = %task.id(), dispatcher = self.name(), "dispatch");

        match &self.kind {
            Kind::Local(local) => local.schedule(task),
            Kind::Pool(pool) => pool.schedule(task),
            Kind::Unconfined => unconfined::schedule(task),
            Kind::Virtual(virt) => virt.schedule(task),
        }
    }
}

impl PartialEq for Dispatcher {
    fn eq(&self, other: &Self) -> bool {
        match (&self.kind, &other.kind) {
            (Kind::Local(a), Kind::Local(b)) => a.ptr_eq(b),
            (Kind::Pool(a), Kind::Pool(b)) => a.ptr_eq(b),
            (Kind::Unconfined, Kind::Unconfined) => true,
            (Kind::Virtual(a), Kind::Virtual(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Dispatcher").field(&self.name()).finish()
    }
}
