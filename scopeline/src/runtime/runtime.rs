use crate::context;
use crate::error::{Error, Result};
use crate::runtime::spawn::SCOPED_TASK_OPTS;
use crate::runtime::{CancellationPolicy, Dispatcher, Handle, local, pool, spawn_builder, virtual_time};
use crate::task::JoinHandle;
use crate::time::Clock;
use anyhow::anyhow;
use std::convert::TryFrom;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

/// Global queue interval default value.
pub(crate) const GLOBAL_QUEUE_INTERVAL: u32 = 31;

/// Cap of the elastic pool behind `Handle::io`.
const MAX_IO_THREADS: usize = 64;

/// Timers a virtual runtime may fire before it gives up on ever going idle.
const MAX_VIRTUAL_STEPS: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Local,
    Pool,
    Virtual,
}

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

impl ThreadNameFn {
    /// Names threads "{prefix}-{n}" with monotonically increasing n.
    pub(crate) fn counter(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let worker_count = Arc::new(AtomicUsize::new(0));

        ThreadNameFn(Arc::new(move || {
            let id = worker_count.fetch_add(1, Ordering::Relaxed);
            format!("{prefix}-{id}")
        }))
    }

    pub(crate) fn next_name(&self) -> String {
        (self.0)()
    }
}

fn default_thread_name_fn() -> ThreadNameFn {
    ThreadNameFn::counter("scopeline")
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // We print a placeholder since the closure itself isn't printable.
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Builds a [`Runtime`] with custom configuration values.
///
/// Methods can be chained in order to set the configuration values. The
/// Runtime is constructed by calling [`try_build`](Builder::try_build).
///
/// ```no_run
/// use scopeline::runtime::Builder;
///
/// # fn main() -> anyhow::Result<()> {
/// let runtime = Builder::new_pool()
///     .worker_threads(4)
///     .thread_name("my-pool")
///     .try_build()?;
///
/// let answer = runtime.block_on(async { Ok(42) })?;
/// assert_eq!(answer, 42);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Builder {
    /// Runtime type
    kind: Kind,

    /// The number of worker threads of the default pool. Only relevant when
    /// using the pool runtime. Defaults to 1 worker per CPU core.
    worker_threads: Option<usize>,

    /// Name fn used for threads spawned by the runtime.
    thread_name: ThreadNameFn,

    /// Stack size used for threads spawned by the runtime.
    thread_stack_size: Option<usize>,

    /// How many ticks before pulling a task from the global injector queue.
    global_queue_interval: u32,

    /// Maximum number of threads of the elastic I/O pool.
    max_io_threads: usize,

    /// What happens to tasks that keep running after observing cancellation.
    cancellation_policy: CancellationPolicy,

    /// Watchdog of virtual time.
    max_virtual_steps: usize,
}

impl Builder {
    fn new(kind: Kind) -> Self {
        Self {
            kind,
            worker_threads: None,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            global_queue_interval: GLOBAL_QUEUE_INTERVAL,
            max_io_threads: MAX_IO_THREADS,
            cancellation_policy: CancellationPolicy::default(),
            max_virtual_steps: MAX_VIRTUAL_STEPS,
        }
    }

    /// Returns a new builder with the local scheduler selected: tasks are
    /// polled by the thread calling `block_on`, in the order they are woken.
    ///
    /// Configuration methods can be chained on the return value.
    pub fn new_local() -> Builder {
        Builder::new(Kind::Local)
    }

    /// Returns a new builder with the work stealing pool selected.
    pub fn new_pool() -> Builder {
        Builder::new(Kind::Pool)
    }

    /// Returns a new builder for a single threaded runtime driven by virtual
    /// time. Sleeps and timeouts never wait on the wall clock: time jumps to
    /// the next deadline whenever no task can make progress.
    ///
    /// Use [`TestScheduler`](crate::runtime::TestScheduler) to move time
    /// explicitly.
    pub fn new_virtual() -> Builder {
        Builder::new(Kind::Virtual)
    }

    /// The number of worker threads, used by the Runtime. Only relevant when
    /// using the pool runtime.
    ///
    /// Defaults to 1 worker per CPU core.
    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker_threads must be greater than 0");
        self.worker_threads = Some(val);
        self
    }

    /// Sets name of threads spawned by the `Runtime`'s thread pool.
    ///
    /// The default name is "scopeline-{id}", where id is monotonically
    /// increasing.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function used to generate the name of threads spawned by the
    /// `Runtime`'s thread pool.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    ///
    /// The actual stack size may be greater than this value if the platform
    /// specifies minimal stack size.
    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    /// Sets the number of scheduler ticks after which a pool worker pulls
    /// from the global queue before its own queue.
    ///
    /// A scheduler "tick" roughly corresponds to one `poll` invocation on a
    /// task. A smaller value gets newly spawned work started sooner, a higher
    /// one favors tasks that were already claimed by a worker.
    #[track_caller]
    pub fn global_queue_interval(mut self, val: u32) -> Self {
        assert!(val > 0, "global_queue_interval must be greater than 0");
        self.global_queue_interval = val;
        self
    }

    /// Caps the number of threads the I/O dispatcher starts. Defaults to 64.
    #[track_caller]
    pub fn max_io_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "max_io_threads must be greater than 0");
        self.max_io_threads = val;
        self
    }

    pub fn cancellation_policy(mut self, policy: CancellationPolicy) -> Self {
        self.cancellation_policy = policy;
        self
    }

    /// Number of timers a virtual runtime fires while waiting for work to go
    /// idle before reporting `Error::DeadlockOrDivergence`.
    #[track_caller]
    pub fn max_virtual_steps(mut self, val: usize) -> Self {
        assert!(val > 0, "max_virtual_steps must be greater than 0");
        self.max_virtual_steps = val;
        self
    }

    /// Creates the configured `Runtime`.
    ///
    /// The returned `Runtime` instance is ready to spawn tasks. Fails if
    /// another runtime is already active on this thread.
    pub fn try_build(self) -> anyhow::Result<Runtime> {
        if context::is_runtime_active() {
            return Err(anyhow!(
                "Cannot create a new Runtime: a runtime is already active on this thread."
            ));
        }

        let cfg = RuntimeConfig::try_from(self)?;

        let (clock, dispatcher) = match cfg.kind {
            Kind::Local => (
                Clock::real(),
                Dispatcher::local(local::Scheduler::new().into_handle()),
            ),
            Kind::Pool => {
                let pool = pool::Handle::try_new(pool::Config::from(&cfg))?;
                (Clock::real(), Dispatcher::from(pool))
            }
            Kind::Virtual => (
                Clock::virtual_time(),
                Dispatcher::virtual_time(virtual_time::Scheduler::new().into_handle()),
            ),
        };

        let handle = Handle::new(cfg, clock, dispatcher);
        context::set_runtime(Some(handle.clone()));

        tracing::debug!(kind = ?handle.cfg().kind, "runtime started");

        Ok(Runtime {
            handle,
            owner: thread::current().id(),
        })
    }
}

/// The scopeline runtime.
///
/// Owns the clock, the registry of live tasks, the root of the task tree and
/// the default [`Dispatcher`]. Dropping the runtime cancels every task that is
/// still running, drops their bodies and stops the runtime's threads.
#[derive(Debug)]
pub struct Runtime {
    handle: Handle,

    /// Thread that built the runtime and owns its thread-local registration.
    owner: ThreadId,
}

impl Runtime {
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Runs `future` as the root task and blocks the calling thread until the
    /// root task and all of its children are terminal.
    ///
    /// Returns the value of the root task, or re-raises its failure. Fails
    /// with `IllegalState` when called from inside a task or after shutdown.
    pub fn block_on<F, T>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if context::in_task() {
            return Err(Error::illegal_state(
                "`block_on` called from inside a task, await the work instead",
            ));
        }

        let mut root = spawn_builder()
            .name("root")
            .with_opts(*SCOPED_TASK_OPTS)
            .spawn_under(&self.handle, Some(Arc::clone(self.handle.root())), future)?;

        let dispatcher = self.handle.default_dispatcher();

        if let Some(local) = dispatcher.as_local() {
            local.block_on(&mut root)
        } else if let Some(virt) = dispatcher.as_virtual() {
            virt.block_on(&self.handle, &mut root)
        } else {
            futures::executor::block_on(root)
        }
    }

    /// Spawn a future onto the runtime, as a top-level task.
    ///
    /// On a local runtime the task only makes progress while `block_on` runs.
    pub fn spawn<F, T>(&self, future: F) -> JoinHandle<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Shutdown the runtime.
    ///
    /// Every live task is cancelled and its body dropped without being polled
    /// again. The thread initiating the shutdown blocks until the runtime's
    /// threads exit, which waits for the polls in flight.
    pub fn shutdown(self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&self) {
        if !self.handle.begin_shutdown() {
            return;
        }

        tracing::debug!(tasks = self.handle.tasks().len(), "runtime shutdown");

        self.handle.root().cancel();
        self.handle.tasks().shutdown_all();
        self.handle.clock().shutdown();

        self.handle.default_dispatcher().shutdown();
        if let Some(io) = self.handle.io_if_started() {
            io.shutdown();
        }

        // Bodies that were being polled during the first pass are idle now.
        self.handle.tasks().shutdown_all();

        if thread::current().id() == self.owner {
            context::set_runtime(None);
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

/// Runs `future` on a fresh local runtime and blocks until it is done.
///
/// This is the bridge from blocking code into the task tree: the future is
/// the root task, everything it spawns is its child and `run_root` only
/// returns once all of them are terminal.
///
/// ```no_run
/// let value = scopeline::run_root(async {
///     let a = scopeline::spawn(async { Ok(1) });
///     let b = scopeline::spawn(async { Ok(2) });
///     Ok(a.await? + b.await?)
/// })?;
/// assert_eq!(value, 3);
/// # Ok::<(), scopeline::Error>(())
/// ```
pub fn run_root<F, T>(future: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let runtime = Builder::new_local()
        .try_build()
        .map_err(|err| Error::illegal_state(err.to_string()))?;

    runtime.block_on(future)
}

// Export runtime builder as a RuntimeConfig object to be consumed by each
// scheduler.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) kind: Kind,
    pub(crate) worker_threads: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) global_queue_interval: u32,
    pub(crate) max_io_threads: usize,
    pub(crate) cancellation_policy: CancellationPolicy,
    pub(crate) max_virtual_steps: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            kind: Kind::Local,
            worker_threads: 1,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            global_queue_interval: GLOBAL_QUEUE_INTERVAL,
            max_io_threads: MAX_IO_THREADS,
            cancellation_policy: CancellationPolicy::default(),
            max_virtual_steps: MAX_VIRTUAL_STEPS,
        }
    }
}

impl RuntimeConfig {
    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.worker_threads > 0, "worker_threads must be greater than 0");
        anyhow::ensure!(self.max_io_threads > 0, "max_io_threads must be greater than 0");
        anyhow::ensure!(
            self.global_queue_interval > 0,
            "global_queue_interval must be greater than 0"
        );
        anyhow::ensure!(
            self.max_virtual_steps > 0,
            "max_virtual_steps must be greater than 0"
        );

        Ok(())
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> anyhow::Result<Self> {
        let worker_threads = match (builder.kind, builder.worker_threads) {
            (Kind::Pool, None) => thread::available_parallelism()?.get(),
            (Kind::Pool, Some(n)) => n,
            (Kind::Local | Kind::Virtual, _) => 1,
        };

        let cfg = RuntimeConfig {
            kind: builder.kind,
            worker_threads,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            global_queue_interval: builder.global_queue_interval,
            max_io_threads: builder.max_io_threads,
            cancellation_policy: builder.cancellation_policy,
            max_virtual_steps: builder.max_virtual_steps,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}
