use crate::runtime::pool::worker::{self, Worker};
use crate::runtime::runtime::GLOBAL_QUEUE_INTERVAL;
use crate::runtime::{RuntimeConfig, Schedule, runtime::ThreadNameFn};
use crate::task::Notified;
use anyhow::{Result, ensure};
use crossbeam_deque::{Injector, Steal, Stealer, Worker as CbWorker};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, Thread};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Threads {
    /// Exactly this many workers, started with the pool.
    Fixed(usize),
    /// Up to this many workers, started when work shows up.
    Elastic(usize),
}

#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) name: String,
    pub(crate) threads: Threads,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) global_queue_interval: u32,
}

impl Config {
    pub(crate) fn fixed(threads: usize, name: String) -> Result<Self> {
        ensure!(threads > 0, "a fixed pool needs at least one thread");
        Ok(Self::named(Threads::Fixed(threads), name))
    }

    pub(crate) fn elastic(max_threads: usize, name: String) -> Result<Self> {
        ensure!(max_threads > 0, "an elastic pool needs at least one thread");
        Ok(Self::named(Threads::Elastic(max_threads), name))
    }

    fn named(threads: Threads, name: String) -> Self {
        Config {
            thread_name: ThreadNameFn::counter(name.clone()),
            name,
            threads,
            thread_stack_size: None,
            global_queue_interval: GLOBAL_QUEUE_INTERVAL,
        }
    }
}

impl From<&RuntimeConfig> for Config {
    fn from(cfg: &RuntimeConfig) -> Self {
        Config {
            name: "scopeline".to_owned(),
            threads: Threads::Fixed(cfg.worker_threads),
            thread_name: cfg.thread_name.clone(),
            thread_stack_size: cfg.thread_stack_size,
            global_queue_interval: cfg.global_queue_interval,
        }
    }
}

/// Handle on a pool. The pool shuts down when the last handle is dropped.
#[derive(Debug, Clone)]
pub(crate) struct Handle {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    shared: Arc<Shared>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

/// State shared by the handles and the workers of one pool.
pub(crate) struct Shared {
    /// Tells workers of this pool apart from workers of other pools.
    pub(super) id: usize,

    pub(super) cfg: Config,

    /// Tasks scheduled from outside of the pool's workers.
    pub(super) injector: Injector<Notified>,

    /// One per fixed worker, empty for elastic pools.
    pub(super) stealers: Vec<Stealer<Notified>>,

    idle: Mutex<Idle>,

    pub(super) shutdown: AtomicBool,

    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

#[derive(Debug, Default)]
struct Idle {
    /// LIFO: the last thread to park has the hottest cache.
    parked: VecDeque<Thread>,

    /// Live worker threads.
    spawned: usize,
}

/// What a parked worker does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Unparked {
    Resume,
    /// Idle elastic worker past its keep-alive.
    Retire,
}

impl Handle {
    pub(crate) fn try_new(cfg: Config) -> Result<Self> {
        static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(0);

        let num_workers = match cfg.threads {
            Threads::Fixed(n) => n,
            Threads::Elastic(_) => 0,
        };

        let mut local_queues = Vec::with_capacity(num_workers);
        let mut stealers = Vec::with_capacity(num_workers);

        for _ in 0..num_workers {
            let w = CbWorker::new_fifo();
            stealers.push(w.stealer());
            local_queues.push(w);
        }

        let shared = Arc::new(Shared {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            cfg,
            injector: Injector::new(),
            stealers: stealers.clone(),
            idle: Mutex::new(Idle::default()),
            shutdown: AtomicBool::new(false),
            handles: Mutex::new(Vec::with_capacity(num_workers)),
        });

        // Built before the first worker starts, so a failed spawn below stops
        // the ones already running.
        let handle = Handle {
            inner: Arc::new(Inner {
                shared: Arc::clone(&shared),
            }),
        };

        for (i, local_queue) in local_queues.into_iter().enumerate() {
            // Give each worker a list of all *other* workers' stealers.
            let other_stealers = stealers
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, s)| s.clone())
                .collect::<Vec<_>>();

            shared.idle.lock().spawned += 1;
            shared.spawn_worker(Some(local_queue), other_stealers)?;
        }

        tracing::debug!(pool = %shared.cfg.name, threads = ?shared.cfg.threads, "pool started");
        Ok(handle)
    }

    pub(crate) fn name(&self) -> &str {
        &self.inner.shared.cfg.name
    }

    pub(crate) fn ptr_eq(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Stops the workers and waits for them to exit. Tasks still queued are
    /// shut down, tasks scheduled afterwards are shut down on arrival.
    pub(crate) fn shutdown(&self) {
        self.inner.shared.shutdown();
    }

    #[cfg(test)]
    pub(crate) fn num_threads(&self) -> usize {
        self.inner.shared.idle.lock().spawned
    }
}

impl Schedule for Handle {
    fn schedule(&self, task: Notified) {
        self.inner.shared.schedule(task);
    }
}

impl Shared {
    fn schedule(self: &Arc<Self>, task: Notified) {
        if self.shutdown.load(Ordering::Acquire) {
            task.0.shutdown();
            return;
        }

        // Tasks woken by a worker of this pool stay on that worker.
        match worker::current_local_queue(self.id) {
            Some(local) => local.push(task),
            None => self.injector.push(task),
        }

        self.notify_one();
    }

    fn notify_one(self: &Arc<Self>) {
        let mut idle = self.idle.lock();

        if let Some(thread) = idle.parked.pop_back() {
            drop(idle);
            thread.unpark();
            return;
        }

        let Threads::Elastic(max_threads) = self.cfg.threads else {
            return;
        };

        if idle.spawned >= max_threads || self.shutdown.load(Ordering::Acquire) {
            return;
        }

        idle.spawned += 1;
        drop(idle);

        if let Err(err) = self.spawn_worker(None, Vec::new()) {
            tracing::error!(pool = %self.cfg.name, error = %err, "failed to grow elastic pool");
            self.idle.lock().spawned -= 1;
        }
    }

    fn spawn_worker(
        self: &Arc<Self>,
        local: Option<CbWorker<Notified>>,
        stealers: Vec<Stealer<Notified>>,
    ) -> Result<()> {
        let mut builder = thread::Builder::new().name(self.cfg.thread_name.next_name());

        if let Some(stack_size) = self.cfg.thread_stack_size {
            builder = builder.stack_size(stack_size);
        }

        let shared = Arc::clone(self);
        let handle = builder.spawn(move || Worker::new(shared, local, stealers).run())?;

        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);

        Ok(())
    }

    pub(super) fn has_work(&self) -> bool {
        !self.injector.is_empty() || self.stealers.iter().any(|s| !s.is_empty())
    }

    /// Parks the calling worker until there is work, shutdown, or, for elastic
    /// pools, the keep-alive expires.
    pub(super) fn park(&self) -> Unparked {
        let me = thread::current();

        {
            let mut idle = self.idle.lock();

            // Checked under the lock `notify_one` takes, so a task pushed
            // concurrently either shows up here or finds us in `parked`.
            if self.shutdown.load(Ordering::Acquire) || self.has_work() {
                return Unparked::Resume;
            }

            idle.parked.push_back(me.clone());
        }

        match self.cfg.threads {
            Threads::Fixed(_) => thread::park(),
            Threads::Elastic(_) => thread::park_timeout(worker::KEEP_ALIVE),
        }

        let mut idle = self.idle.lock();

        // Still listed: nobody unparked us.
        let Some(pos) = idle.parked.iter().position(|t| t.id() == me.id()) else {
            return Unparked::Resume;
        };
        idle.parked.remove(pos);

        let retire = matches!(self.cfg.threads, Threads::Elastic(_))
            && !self.has_work()
            && !self.shutdown.load(Ordering::Acquire);

        if retire {
            idle.spawned -= 1;
            Unparked::Retire
        } else {
            Unparked::Resume
        }
    }

    fn shutdown(&self) {
        let parked = {
            let mut idle = self.idle.lock();
            if self.shutdown.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut idle.parked)
        };

        tracing::debug!(pool = %self.cfg.name, "pool shutdown");

        for thread in parked {
            thread.unpark();
        }

        let handles = std::mem::take(&mut *self.handles.lock());
        let current = thread::current().id();

        for handle in handles {
            // The last handle can be dropped by one of our own workers.
            if handle.thread().id() == current {
                continue;
            }

            if handle.join().is_err() {
                tracing::error!(pool = %self.cfg.name, "worker thread panicked");
            }
        }

        loop {
            match self.injector.steal() {
                Steal::Success(task) => task.0.shutdown(),
                Steal::Empty => break,
                Steal::Retry => {}
            }
        }
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("id", &self.id)
            .field("name", &self.cfg.name)
            .field("threads", &self.cfg.threads)
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish()
    }
}
