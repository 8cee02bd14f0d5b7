use crate::runtime::EventLoop;
use crate::runtime::pool::scheduler::{Shared, Unparked};
use crate::runtime::ticker::{Ticker, TickerData, TickerEvents};
use crate::task::Notified;
use crossbeam_deque::{Steal, Stealer, Worker as CbWorker};
use std::cell::{Cell, RefCell};
use std::iter;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// How long an elastic worker waits for work before it exits.
pub(super) const KEEP_ALIVE: Duration = Duration::from_secs(10);

/// Steal attempts before a worker gives up and parks.
const MAX_STEAL_RETRIES: usize = 3;

thread_local! {
    static CURRENT: RefCell<Option<Current>> = const { RefCell::new(None) };
}

struct Current {
    pool: usize,
    local: Rc<CbWorker<Notified>>,
}

/// Local queue of the calling thread, if it is a fixed worker of `pool`.
pub(super) fn current_local_queue(pool: usize) -> Option<Rc<CbWorker<Notified>>> {
    CURRENT
        .try_with(|cur| {
            cur.borrow()
                .as_ref()
                .filter(|w| w.pool == pool)
                .map(|w| Rc::clone(&w.local))
        })
        .ok()
        .flatten()
}

pub(super) struct Worker {
    shared: Arc<Shared>,

    /// `None` for elastic workers, they only pull from the injector.
    local: Option<Rc<CbWorker<Notified>>>,

    /// Handle to all of the other workers' queues.
    stealers: Vec<Stealer<Notified>>,

    ticker: RefCell<Ticker>,

    cfg: RefCell<EventLoopConfig>,

    /// Whether we should try to find our next task in the global queue.
    pop_global_queue: Cell<bool>,
}

impl Worker {
    pub(super) fn new(
        shared: Arc<Shared>,
        local: Option<CbWorker<Notified>>,
        mut stealers: Vec<Stealer<Notified>>,
    ) -> Self {
        // Each worker visits the others in a different order to spread
        // contention.
        fastrand::shuffle(&mut stealers);

        let cfg = EventLoopConfig {
            global_queue_interval: shared.cfg.global_queue_interval,
        };

        Self {
            shared,
            local: local.map(Rc::new),
            stealers,
            ticker: RefCell::new(Ticker::new()),
            cfg: RefCell::new(cfg),
            pop_global_queue: Cell::new(false),
        }
    }

    pub(super) fn run(self) {
        if let Some(local) = &self.local {
            CURRENT.with(|cur| {
                *cur.borrow_mut() = Some(Current {
                    pool: self.shared.id,
                    local: Rc::clone(local),
                })
            });
        }

        tracing::trace!(pool = %self.shared.cfg.name, "worker started");

        loop {
            let events = self.tick();
            if events.contains(TickerEvents::SHUTDOWN) {
                break;
            }

            if events.contains(TickerEvents::POP_GLOBAL_QUEUE) {
                self.pop_global_queue.set(true);
            }

            match self.find_task() {
                Some(task) => task.run(),
                None => {
                    if self.shared.park() == Unparked::Retire {
                        break;
                    }
                }
            }
        }

        self.shutdown();
    }

    fn tick(&self) -> TickerEvents {
        self.ticker
            .borrow_mut()
            .tick(&self.shared, &mut *self.cfg.borrow_mut())
    }

    fn steal_global(&self) -> Steal<Notified> {
        match &self.local {
            Some(local) => self.shared.injector.steal_batch_and_pop(local),
            None => self.shared.injector.steal(),
        }
    }

    fn shutdown(&self) {
        CURRENT.with(|cur| cur.borrow_mut().take());

        if let Some(local) = &self.local {
            while let Some(task) = local.pop() {
                task.0.shutdown();
            }
        }

        tracing::trace!(pool = %self.shared.cfg.name, "worker exited");
    }
}

impl EventLoop for Worker {
    type Task = Notified;

    fn add_task(&self, task: Self::Task) {
        match &self.local {
            Some(local) => local.push(task),
            None => self.shared.injector.push(task),
        }
    }

    fn find_task(&self) -> Option<Self::Task> {
        // Enforce fairness by force-checking the global queue every
        // `global_queue_interval` ticks.
        if self.pop_global_queue.replace(false) {
            if let Some(task) = self.steal_global().success() {
                return Some(task);
            }
        }

        self.local.as_ref().and_then(|local| local.pop()).or_else(|| {
            iter::repeat_with(|| {
                // The behavior of collect here is to return the first
                // Success(T), we are not visiting every stealer every time.
                self.steal_global()
                    .or_else(|| self.stealers.iter().map(|s| s.steal()).collect())
            })
            .take(MAX_STEAL_RETRIES)
            .find(|s| !s.is_retry())
            .and_then(|s| s.success())
        })
    }
}

#[derive(Debug, Clone)]
struct EventLoopConfig {
    global_queue_interval: u32,
}

impl TickerData for EventLoopConfig {
    type Context = Arc<Shared>;

    #[inline(always)]
    fn update_and_check(&mut self, shared: &Self::Context, tick: u32) -> TickerEvents {
        if shared.shutdown.load(Ordering::Acquire) {
            return TickerEvents::SHUTDOWN;
        }

        if tick.is_multiple_of(self.global_queue_interval) {
            TickerEvents::POP_GLOBAL_QUEUE
        } else {
            TickerEvents::empty()
        }
    }
}
