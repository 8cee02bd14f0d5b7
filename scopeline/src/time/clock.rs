use futures::task::AtomicWaker;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicBool};
use std::thread;
use std::time::{Duration, Instant};

/// The time source of a runtime. Times are offsets from the moment the clock
/// was created.
#[derive(Clone)]
pub(crate) enum Clock {
    /// Wall-clock time, timers are fired by a driver thread.
    Real(Arc<RealClock>),
    /// Time only moves when the test scheduler advances it.
    Virtual(Arc<VirtualClock>),
}

impl Clock {
    pub(crate) fn real() -> Self {
        Clock::Real(Arc::new(RealClock::new()))
    }

    pub(crate) fn virtual_time() -> Self {
        Clock::Virtual(Arc::new(VirtualClock::new()))
    }

    pub(crate) fn now(&self) -> Duration {
        match self {
            Clock::Real(clock) => clock.origin.elapsed(),
            Clock::Virtual(clock) => clock.queue.lock().now,
        }
    }

    /// Registers a timer firing at `deadline`. Background timers do not keep
    /// virtual time from being idle.
    pub(crate) fn register(&self, deadline: Duration, foreground: bool) -> Arc<TimerState> {
        match self {
            Clock::Real(clock) => clock.register(deadline, foreground),
            Clock::Virtual(clock) => clock.queue.lock().push(deadline, foreground),
        }
    }

    pub(crate) fn as_virtual(&self) -> Option<&Arc<VirtualClock>> {
        match self {
            Clock::Virtual(clock) => Some(clock),
            Clock::Real(_) => None,
        }
    }

    /// Stops the driver thread and drops every pending timer.
    pub(crate) fn shutdown(&self) {
        match self {
            Clock::Real(clock) => clock.shutdown(),
            Clock::Virtual(clock) => clock.queue.lock().clear(),
        }
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Clock::Real(_) => f.write_str("Clock::Real"),
            Clock::Virtual(_) => f.write_str("Clock::Virtual"),
        }
    }
}

/// Shared between a pending timer and the future waiting on it.
#[derive(Debug, Default)]
pub(crate) struct TimerState {
    fired: AtomicBool,
    cancelled: AtomicBool,
    waker: AtomicWaker,
}

impl TimerState {
    pub(crate) fn is_fired(&self) -> bool {
        self.fired.load(atomic::Ordering::Acquire)
    }

    pub(crate) fn register_waker(&self, waker: &std::task::Waker) {
        self.waker.register(waker);
    }

    /// The waiting future is gone, the entry is skipped when it expires.
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, atomic::Ordering::Release);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(atomic::Ordering::Acquire)
    }

    fn fire(&self) {
        self.fired.store(true, atomic::Ordering::Release);
        self.waker.wake();
    }
}

#[derive(Debug)]
struct TimerEntry {
    deadline: Duration,
    // Registration order breaks deadline ties.
    seq: u64,
    foreground: bool,
    timer: Arc<TimerState>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// Below this many entries cancelled timers are only dropped once they reach
/// the top of the heap.
const MIN_COMPACT_LEN: usize = 64;

#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    next_seq: u64,
    /// Heap length that triggers the next sweep of cancelled entries.
    compact_at: usize,
    /// Only meaningful for virtual clocks.
    now: Duration,
}

impl TimerQueue {
    fn push(&mut self, deadline: Duration, foreground: bool) -> Arc<TimerState> {
        if self.heap.len() >= self.compact_at.max(MIN_COMPACT_LEN) {
            self.compact();
        }

        let timer = Arc::new(TimerState::default());
        let seq = self.next_seq;
        self.next_seq += 1;

        self.heap.push(Reverse(TimerEntry {
            deadline,
            seq,
            foreground,
            timer: Arc::clone(&timer),
        }));

        timer
    }

    /// Drops every cancelled entry, wherever it sits in the heap. Long
    /// deadlines that are cancelled early would otherwise stay until they
    /// expire.
    fn compact(&mut self) {
        self.heap.retain(|Reverse(entry)| !entry.timer.is_cancelled());
        self.compact_at = self.heap.len() * 2;
    }

    fn prune_cancelled(&mut self) {
        while self
            .heap
            .peek()
            .is_some_and(|Reverse(entry)| entry.timer.is_cancelled())
        {
            self.heap.pop();
        }
    }

    fn next_deadline(&mut self) -> Option<Duration> {
        self.prune_cancelled();
        self.heap.peek().map(|Reverse(entry)| entry.deadline)
    }

    /// Pops the earliest live timer if it expires at or before `limit`.
    fn pop_expired(&mut self, limit: Duration) -> Option<(Duration, Arc<TimerState>)> {
        self.prune_cancelled();

        if self.heap.peek()?.0.deadline > limit {
            return None;
        }

        self.heap
            .pop()
            .map(|Reverse(entry)| (entry.deadline, entry.timer))
    }

    fn next_foreground_deadline(&self) -> Option<Duration> {
        self.heap
            .iter()
            .filter(|Reverse(entry)| entry.foreground && !entry.timer.is_cancelled())
            .map(|Reverse(entry)| entry.deadline)
            .min()
    }

    fn clear(&mut self) {
        self.heap.clear();
    }
}

pub(crate) struct RealClock {
    origin: Instant,

    queue: Mutex<TimerQueue>,

    condvar: Condvar,

    shutdown: AtomicBool,

    /// Started on the first registration.
    driver: Mutex<Option<thread::JoinHandle<()>>>,
}

impl RealClock {
    fn new() -> Self {
        RealClock {
            origin: Instant::now(),
            queue: Mutex::new(TimerQueue::default()),
            condvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
            driver: Mutex::new(None),
        }
    }

    fn register(self: &Arc<Self>, deadline: Duration, foreground: bool) -> Arc<TimerState> {
        self.ensure_driver();

        let mut queue = self.queue.lock();
        let earliest = queue.next_deadline().is_none_or(|next| deadline < next);
        let timer = queue.push(deadline, foreground);
        drop(queue);

        if earliest {
            self.condvar.notify_one();
        }

        timer
    }

    fn ensure_driver(self: &Arc<Self>) {
        let mut driver = self.driver.lock();
        if driver.is_some() || self.shutdown.load(atomic::Ordering::Acquire) {
            return;
        }

        // Runs until `shutdown`, which the runtime calls when it is dropped.
        let clock = Arc::downgrade(self);
        let res = thread::Builder::new()
            .name("scopeline-timer".to_owned())
            .spawn(move || {
                if let Some(clock) = clock.upgrade() {
                    clock.run();
                }
            });

        match res {
            Ok(handle) => *driver = Some(handle),
            Err(err) => tracing::error!(error = %err, "failed to spawn timer driver thread"),
        }
    }

    fn run(&self) {
        let mut queue = self.queue.lock();

        loop {
            if self.shutdown.load(atomic::Ordering::Acquire) {
                break;
            }

            let now = self.origin.elapsed();
            if let Some((_, timer)) = queue.pop_expired(now) {
                // Wakers may run arbitrary code (unconfined tasks), never hold
                // the queue lock while firing.
                MutexGuard::unlocked(&mut queue, || timer.fire());
                continue;
            }

            match queue.next_deadline() {
                Some(deadline) => {
                    self.condvar
                        .wait_for(&mut queue, deadline.saturating_sub(now));
                }
                None => self.condvar.wait(&mut queue),
            }
        }

        queue.clear();
    }

    fn shutdown(&self) {
        {
            let _queue = self.queue.lock();
            self.shutdown.store(true, atomic::Ordering::Release);
        }
        self.condvar.notify_all();

        let handle = self.driver.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::error!("timer driver thread panicked");
            }
        }

        self.queue.lock().clear();
    }
}

impl Drop for RealClock {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A clock whose time only moves when told to.
#[derive(Debug, Default)]
pub(crate) struct VirtualClock {
    queue: Mutex<TimerQueue>,
}

impl VirtualClock {
    fn new() -> Self {
        Self::default()
    }

    pub(crate) fn now(&self) -> Duration {
        self.queue.lock().now
    }

    /// Fires the earliest timer expiring at or before `limit`, moving time to
    /// its deadline. Returns the deadline, or `None` if nothing expired.
    pub(crate) fn fire_next(&self, limit: Duration) -> Option<Duration> {
        let (deadline, timer) = {
            let mut queue = self.queue.lock();
            let (deadline, timer) = queue.pop_expired(limit)?;
            queue.now = queue.now.max(deadline);
            (deadline, timer)
        };

        timer.fire();
        Some(deadline)
    }

    /// Moves time forward to `to`. Never moves it back.
    pub(crate) fn advance_to(&self, to: Duration) {
        let mut queue = self.queue.lock();
        queue.now = queue.now.max(to);
    }

    pub(crate) fn next_deadline(&self) -> Option<Duration> {
        self.queue.lock().next_deadline()
    }

    pub(crate) fn next_foreground_deadline(&self) -> Option<Duration> {
        self.queue.lock().next_foreground_deadline()
    }
}
