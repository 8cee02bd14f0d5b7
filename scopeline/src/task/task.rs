use crate::error::{Error, Result};
use crate::runtime::{Dispatcher, Handle, Schedule};
use crate::task::harness;
use crate::task::node::TaskNode;
use crate::task::state::{RunState, TransitionToNotified};
use crate::task::Id;
use futures::task::ArcWake;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub(crate) type BoxedBody = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// A spawned body plus everything needed to poll it: its node in the task
/// tree, the dispatcher its polls run on and the runtime it belongs to.
///
/// The task is its own waker. Waking it hands it to its dispatcher, at most
/// once until the next poll.
pub(crate) struct Task {
    pub(crate) node: Arc<TaskNode>,

    pub(super) state: RunState,

    /// `None` once the body resolved or was dropped.
    pub(super) body: Mutex<Option<BoxedBody>>,

    pub(crate) dispatcher: Dispatcher,

    pub(crate) handle: Handle,
}

impl Task {
    pub(crate) fn new(
        node: Arc<TaskNode>,
        body: BoxedBody,
        dispatcher: Dispatcher,
        handle: Handle,
    ) -> Arc<Task> {
        let task = Arc::new(Task {
            node,
            state: RunState::new(),
            body: Mutex::new(Some(body)),
            dispatcher,
            handle,
        });

        task.node.set_body(Arc::downgrade(&task));
        task
    }

    pub(crate) fn id(&self) -> Id {
        self.node.id
    }

    pub(crate) fn schedule(self: &Arc<Self>) {
        if self.state.transition_to_notified() == TransitionToNotified::Submit {
            self.dispatcher.schedule(Notified(Arc::clone(self)));
        }
    }

    /// Polls the task right here, on the calling thread.
    pub(crate) fn run_inline(self: &Arc<Self>) {
        harness::poll(Arc::clone(self));
    }

    /// Drops the body without polling it and drives the node to a terminal
    /// state. Bodies currently being polled elsewhere are left alone.
    pub(crate) fn shutdown(&self) {
        let Some(mut body) = self.body.try_lock() else {
            return;
        };

        if body.take().is_some() {
            drop(body);
            self.state.set_complete();
            self.node.body_finished(Err(Error::Cancelled));
        }
    }
}

impl ArcWake for Task {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.schedule();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("node", &self.node)
            .field("state", &self.state)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

/// A task that was handed to a dispatcher and is ready to be polled.
#[derive(Debug)]
pub(crate) struct Notified(pub(crate) Arc<Task>);

impl Notified {
    pub(crate) fn run(self) {
        harness::poll(self.0);
    }

    pub(crate) fn id(&self) -> Id {
        self.0.id()
    }
}
