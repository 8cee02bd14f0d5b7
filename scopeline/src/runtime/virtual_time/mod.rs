//! Deterministic scheduling on virtual time.
//!
//! A virtual runtime runs every task on the thread calling `block_on`, and its
//! clock only moves when there is nothing left to run: the next timer is then
//! fired immediately, however far in the future it is. A test that sleeps for
//! an hour completes in microseconds, and always interleaves its tasks the
//! same way.
//!
//! [`TestScheduler`] gives a test manual control over the clock.
use crate::error::{Error, Result};
use crate::runtime::{self, EventLoop, Schedule};
use crate::scope::TaskGroup;
use crate::task::{JoinHandle, Notified};
use crate::time::VirtualClock;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

/// How long `block_on` waits for pool threads to hand work back before it
/// looks at the clock again.
const POOLED_WORK_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
pub(crate) struct Scheduler {
    queue: Mutex<VecDeque<Notified>>,

    /// Signaled when a task is queued, from any thread.
    condvar: Condvar,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn into_handle(self) -> Handle {
        Handle(Arc::new(self))
    }
}

impl EventLoop for Scheduler {
    type Task = Notified;

    fn add_task(&self, task: Self::Task) {
        self.queue.lock().push_back(task);
        self.condvar.notify_one();
    }

    fn find_task(&self) -> Option<Self::Task> {
        self.queue.lock().pop_front()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Handle(Arc<Scheduler>);

impl Schedule for Handle {
    fn schedule(&self, task: Notified) {
        self.add_task(task);
    }
}

impl Handle {
    pub(crate) fn ptr_eq(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn clear(&self) -> usize {
        let tasks = std::mem::take(&mut *self.queue.lock());
        tasks.len()
    }

    /// Runs tasks until the queue is empty, including the ones woken along
    /// the way. Returns how many polls ran.
    pub(crate) fn run_ready(&self) -> usize {
        let mut polls = 0;

        while let Some(task) = self.find_task() {
            task.run();
            polls += 1;
        }

        polls
    }

    fn wait_for_task(&self, timeout: Duration) {
        let mut queue = self.queue.lock();

        if queue.is_empty() {
            self.condvar.wait_for(&mut queue, timeout);
        }
    }

    /// Drives `root` to completion, advancing the clock whenever every task is
    /// suspended. Fails with `DeadlockOrDivergence` when nothing can make
    /// progress anymore, or when timers keep firing past the step limit.
    pub(crate) fn block_on<T>(
        &self,
        rt: &runtime::Handle,
        root: &mut JoinHandle<T>,
    ) -> Result<T> {
        let Some(clock) = rt.clock().as_virtual() else {
            return Err(Error::illegal_state(
                "the virtual dispatcher needs a virtual clock",
            ));
        };

        let max_steps = rt.cfg().max_virtual_steps;
        let mut steps = 0;

        loop {
            self.run_ready();

            if let Some(res) = root.try_output() {
                // Periodic background work would otherwise run forever.
                rt.cancel_background();
                self.run_ready();
                return res;
            }

            if clock.fire_next(Duration::MAX).is_some() {
                steps += 1;

                if steps > max_steps {
                    return Err(divergence(steps, clock));
                }

                continue;
            }

            // Work running on a pool can still wake our tasks.
            if rt.tasks().has_live_pooled_tasks() {
                self.wait_for_task(POOLED_WORK_POLL);
                continue;
            }

            tracing::error!(
                task.id = %root.id(),
                now = ?clock.now(),
                "virtual time is idle but the root task is still pending"
            );
            return Err(divergence(steps, clock));
        }
    }
}

impl Deref for Handle {
    type Target = Arc<Scheduler>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

fn divergence(steps: usize, clock: &VirtualClock) -> Error {
    Error::DeadlockOrDivergence {
        steps,
        now_ms: clock.now().as_millis() as u64,
    }
}

/// Manual control over the clock of a virtual runtime.
///
/// Obtained with [`TestScheduler::current`] from inside a test, or from
/// [`Handle::test_scheduler`](crate::runtime::Handle::test_scheduler). Every
/// method runs the tasks it makes ready before returning, on the calling
/// thread.
///
/// ```no_run
/// # use std::time::Duration;
/// # use scopeline::runtime::TestScheduler;
/// #[scopeline::test(flavor = "virtual")]
/// async fn test_reminder_fires() {
///     let sched = TestScheduler::current().unwrap();
///     let reminder = scopeline::spawn(async {
///         scopeline::time::sleep(Duration::from_secs(60)).await
///     });
///
///     sched.advance_by(Duration::from_secs(59));
///     assert!(!reminder.is_finished());
///
///     sched.advance_by(Duration::from_secs(1));
///     assert!(reminder.is_finished());
/// }
/// ```
#[derive(Clone)]
pub struct TestScheduler {
    handle: runtime::Handle,
    sched: Handle,
    clock: Arc<VirtualClock>,
}

impl TestScheduler {
    pub(crate) fn new(handle: runtime::Handle, sched: Handle) -> Option<Self> {
        let clock = Arc::clone(handle.clock().as_virtual()?);

        Some(TestScheduler {
            handle,
            sched,
            clock,
        })
    }

    /// The test scheduler of the current runtime, if it is a virtual one.
    pub fn current() -> Option<Self> {
        runtime::Handle::try_current()?.test_scheduler()
    }

    /// Virtual time elapsed since the runtime started, in milliseconds.
    pub fn current_time(&self) -> u64 {
        self.clock.now().as_millis() as u64
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Runs every task that is ready, without moving the clock. Returns how
    /// many polls ran.
    pub fn run_current(&self) -> usize {
        self.sched.run_ready()
    }

    /// Moves the clock forward by `duration`, firing the timers on the way in
    /// deadline order and running the tasks each of them wakes before the
    /// next one fires.
    pub fn advance_by(&self, duration: Duration) {
        let target = self.clock.now().saturating_add(duration);

        self.run_current();

        while self.clock.fire_next(target).is_some() {
            self.run_current();
        }

        self.clock.advance_to(target);
        self.run_current();
    }

    /// Advances the clock until no foreground timer is pending. Background
    /// timers due on the way fire too, but never keep the clock moving by
    /// themselves.
    pub fn advance_until_idle(&self) -> Result<()> {
        let max_steps = self.handle.cfg().max_virtual_steps;
        let mut steps = 0;

        loop {
            self.run_current();

            let Some(deadline) = self.clock.next_foreground_deadline() else {
                return Ok(());
            };

            while self.clock.fire_next(deadline).is_some() {
                steps += 1;

                if steps > max_steps {
                    return Err(divergence(steps, &self.clock));
                }

                self.run_current();
            }
        }
    }

    /// See [`Handle::background_scope`](crate::runtime::Handle::background_scope).
    pub fn background_scope(&self) -> TaskGroup {
        self.handle.background_scope()
    }
}

impl fmt::Debug for TestScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestScheduler")
            .field("now", &self.clock.now())
            .finish()
    }
}
