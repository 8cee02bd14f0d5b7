use crate::error::{Error, Result};
use crate::runtime::{EventLoop, Schedule};
use crate::task::{JoinHandle, Notified};
use crate::utils::ScopeGuard;
#[allow(unused)]
use crate::utils::tracker::{Call, Method, Tracker};
use futures::task::{ArcWake, waker_ref};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

#[derive(Debug)]
pub(crate) struct Scheduler {
    /// Tasks ready to be polled, in the order they were woken.
    queue: Mutex<VecDeque<Notified>>,

    /// Signaled when a task is queued or the root is woken.
    condvar: Condvar,

    /// The root task changed state and `block_on` must poll its handle again.
    root_woken: AtomicBool,

    /// A `block_on` call is driving this scheduler.
    running: AtomicBool,

    #[cfg(test)]
    pub(crate) tracker: Tracker,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            root_woken: AtomicBool::new(false),
            running: AtomicBool::new(false),

            #[cfg(test)]
            tracker: Tracker::new(),
        }
    }

    pub(crate) fn into_handle(self) -> Handle {
        Handle(Arc::new(self))
    }

    fn set_root_woken(&self) {
        self.root_woken.store(true, Ordering::Release);

        // Taking the lock orders this store before a parker's emptiness check.
        let _queue = self.queue.lock();
        self.condvar.notify_one();
    }

    fn reset_root_woken(&self) -> bool {
        self.root_woken.swap(false, Ordering::AcqRel)
    }

    fn park(&self) {
        let mut queue = self.queue.lock();

        while queue.is_empty() && !self.root_woken.load(Ordering::Acquire) {
            self.condvar.wait(&mut queue);
        }
    }

    /// Drops every queued task, returns how many there were.
    pub(crate) fn clear(&self) -> usize {
        let tasks = std::mem::take(&mut *self.queue.lock());
        tasks.len()
    }

    // Small price to pay to get introspection on all scheduler calls during
    // testing. No op in release builds.
    #[allow(unused)]
    #[inline(always)]
    fn track(&self, method: Method, call: Call) {
        #[cfg(test)]
        self.tracker.record(method, call);
    }
}

// Wakes the root future polled by `block_on`. Tasks have their own wakers.
impl ArcWake for Scheduler {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.set_root_woken();
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
        self.track(Method::Schedule, Call::Schedule { id: task.id() });
        self.add_task(task);
    }
}

impl Handle {
    pub(crate) fn ptr_eq(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Runs queued tasks on the calling thread until `root` resolves.
    pub(crate) fn block_on<T>(&self, root: &mut JoinHandle<T>) -> Result<T> {
        if self.running.swap(true, Ordering::AcqRel) {
            // Never ran, it must not run on the other caller's loop either.
            root.cancel();
            return Err(Error::illegal_state(
                "the local scheduler is already driven by another `block_on`",
            ));
        }
        let _running = ScopeGuard::new(|| self.running.store(false, Ordering::Release));

        let waker = waker_ref(&self.0);
        let mut cx = Context::from_waker(&waker);

        // Poll the root once to register our waker on it.
        self.root_woken.store(true, Ordering::Release);

        loop {
            if self.reset_root_woken() {
                if let Poll::Ready(res) = Pin::new(&mut *root).poll(&mut cx) {
                    return res;
                }
            }

            match self.find_task() {
                Some(task) => {
                    self.track(Method::Poll, Call::Poll { id: task.id() });
                    task.run();
                }
                None => self.park(),
            }
        }
    }
}

impl Deref for Handle {
    type Target = Arc<Scheduler>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
