use crate::error::{Error, Result};
use crate::runtime::{CancellationPolicy, SPILL_TO_HEAP_THRESHOLD};
use crate::scope::Policy;
use crate::task::state::TaskState;
use crate::task::{Id, Task};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};

pub(crate) type Callback = Box<dyn FnOnce(&Outcome) + Send + 'static>;

/// Receives failures nobody else is going to observe: isolated children of a
/// supervisor, and failures of scopes that have no parent.
pub type FailureHandler = Arc<dyn Fn(Id, &Error) + Send + Sync + 'static>;

/// Terminal result of a task or group, as seen by completion callbacks.
#[derive(Debug, Clone)]
pub enum Outcome {
    Completed,
    Failed(Error),
    Cancelled,
}

impl Outcome {
    pub fn state(&self) -> TaskState {
        match self {
            Outcome::Completed => TaskState::Completed,
            Outcome::Failed(_) => TaskState::Failed,
            Outcome::Cancelled => TaskState::Cancelled,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Outcome::Failed(err) => Some(err),
            _ => None,
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            Outcome::Completed => Ok(()),
            Outcome::Failed(err) => Err(err),
            Outcome::Cancelled => Err(Error::Cancelled),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    /// Backed by a body future.
    Task,
    /// No body of its own, closed by `complete`, `cancel` or a failure.
    Group,
}

pub(crate) struct NodeConfig {
    pub(crate) kind: NodeKind,
    pub(crate) name: Option<Arc<str>>,
    pub(crate) policy: Policy,
    /// Report our own failure to the parent. Off for work whose failure is
    /// surfaced synchronously to a caller instead.
    pub(crate) propagate: bool,
    pub(crate) background: bool,
    /// Cancellation before the first poll does not skip the body, it is
    /// delivered at its first suspension point instead.
    pub(crate) atomic: bool,
    pub(crate) on_failure: Option<FailureHandler>,
}

impl NodeConfig {
    pub(crate) fn task() -> Self {
        NodeConfig {
            kind: NodeKind::Task,
            name: None,
            policy: Policy::FailFast,
            propagate: true,
            background: false,
            atomic: false,
            on_failure: None,
        }
    }

    pub(crate) fn group(policy: Policy) -> Self {
        NodeConfig {
            kind: NodeKind::Group,
            policy,
            ..NodeConfig::task()
        }
    }
}

struct Inner {
    state: TaskState,

    /// The body returned (tasks) or the group was closed.
    body_done: bool,

    /// Ids are monotonic so this iterates in registration order.
    children: BTreeMap<Id, Arc<TaskNode>>,

    /// First failure wins.
    failure: Option<Error>,

    outcome: Option<Outcome>,

    callbacks: SmallVec<[Callback; 2]>,

    waiters: SmallVec<[Waker; 2]>,
}

// Structured concurrency lives here. Every task and every group owns one node;
// children are owned by their parent until they reach a terminal state, the
// parent is only referenced weakly. Outcomes flow upwards through
// `child_terminated`, cancellation flows downwards through `cancel`.
//
// Locking: a node never holds its own lock while calling into another node,
// a callback, or a waker.
pub(crate) struct TaskNode {
    pub(crate) id: Id,

    kind: NodeKind,

    name: Option<Arc<str>>,

    /// What happens to us when one of our children fails.
    policy: Policy,

    propagate: bool,

    background: bool,

    atomic: bool,

    on_failure: Option<FailureHandler>,

    parent: Option<Weak<TaskNode>>,

    cancel_requested: AtomicBool,

    /// The body already got `Error::Cancelled` from a suspension point.
    signal_delivered: AtomicBool,

    /// The body suspended again after the signal was delivered.
    swallowed: AtomicBool,

    /// Used to re-poll the body when cancellation is requested.
    body: Mutex<Option<Weak<Task>>>,

    inner: Mutex<Inner>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CancellationStats {
    /// Total number of nodes visited during the traversal.
    pub visited: usize,
    /// Number of nodes that had not been cancelled before.
    pub cancelled: usize,
}

impl std::ops::AddAssign for CancellationStats {
    fn add_assign(&mut self, rhs: Self) {
        self.visited += rhs.visited;
        self.cancelled += rhs.cancelled;
    }
}

impl TaskNode {
    pub(crate) fn new(cfg: NodeConfig, parent: Option<&Arc<TaskNode>>) -> Arc<Self> {
        let state = match cfg.kind {
            NodeKind::Task => TaskState::Created,
            NodeKind::Group => TaskState::Active,
        };

        Arc::new(TaskNode {
            id: Id::next(),
            kind: cfg.kind,
            name: cfg.name,
            policy: cfg.policy,
            propagate: cfg.propagate,
            background: cfg.background || parent.is_some_and(|p| p.background),
            atomic: cfg.atomic,
            on_failure: cfg.on_failure,
            parent: parent.map(Arc::downgrade),
            cancel_requested: AtomicBool::new(false),
            signal_delivered: AtomicBool::new(false),
            swallowed: AtomicBool::new(false),
            body: Mutex::new(None),
            inner: Mutex::new(Inner {
                state,
                body_done: false,
                children: BTreeMap::new(),
                failure: None,
                outcome: None,
                callbacks: SmallVec::new(),
                waiters: SmallVec::new(),
            }),
        })
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn policy(&self) -> Policy {
        self.policy
    }

    pub(crate) fn is_background(&self) -> bool {
        self.background
    }

    pub(crate) fn parent(&self) -> Option<Arc<TaskNode>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn state(&self) -> TaskState {
        self.inner.lock().state
    }

    pub(crate) fn outcome(&self) -> Option<Outcome> {
        self.inner.lock().outcome.clone()
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.inner.lock().outcome.is_some()
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    pub(crate) fn swallowed_cancellation(&self) -> bool {
        self.swallowed.load(Ordering::Acquire)
    }

    pub(crate) fn num_children(&self) -> usize {
        self.inner.lock().children.len()
    }

    pub(crate) fn children_ids(&self) -> Vec<Id> {
        self.inner.lock().children.keys().copied().collect()
    }

    pub(crate) fn set_body(&self, task: Weak<Task>) {
        *self.body.lock() = Some(task);
    }

    /// Registers `child` under `self`. Dead scopes reject new children.
    pub(crate) fn attach_child(&self, child: &Arc<TaskNode>) -> Result<()> {
        let mut inner = self.inner.lock();

        if inner.state.is_terminal() {
            return Err(Error::illegal_state(format!(
                "cannot launch into scope {} in state {}",
                self.id, inner.state
            )));
        }

        if self.is_cancel_requested() {
            return Err(Error::illegal_state(format!(
                "cannot launch into scope {}: it is cancelled or failing",
                self.id
            )));
        }

        inner.children.insert(child.id, Arc::clone(child));
        Ok(())
    }

    /// Moves a task from `Created` to `Active` on its first poll. Returns false
    /// when the body must not run anymore.
    pub(crate) fn start(&self) -> bool {
        let mut inner = self.inner.lock();

        match inner.state {
            TaskState::Created if inner.body_done => false,
            TaskState::Created => {
                inner.state = TaskState::Active;

                // An atomic task cancelled before it ran.
                if self.is_cancel_requested() {
                    inner.transition(self.id, TaskState::Cancelling);
                }
                true
            }
            state => !state.is_terminal(),
        }
    }

    /// Schedules the body of a lazily started task. Returns false when there is
    /// nothing left to start.
    pub(crate) fn start_lazy(&self) -> bool {
        {
            let inner = self.inner.lock();
            if inner.state != TaskState::Created || inner.body_done {
                return false;
            }
        }

        self.wake_body();
        true
    }

    /// Cooperative cancellation check, run by every suspension point.
    pub(crate) fn poll_cancellation(&self, policy: CancellationPolicy) -> Poll<Result<()>> {
        if !self.is_cancel_requested() {
            return Poll::Ready(Ok(()));
        }

        if !self.signal_delivered.swap(true, Ordering::AcqRel) {
            return Poll::Ready(Err(Error::Cancelled));
        }

        if !self.swallowed.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                task.id = %self.id,
                task.name = ?self.name,
                "task suspended again after observing cancellation"
            );
        }

        match policy {
            // Never resolves, the harness drops the body after this poll.
            CancellationPolicy::Strict => Poll::Pending,
            CancellationPolicy::Lenient => Poll::Ready(Err(Error::Cancelled)),
        }
    }

    /// Requests cancellation of this node and its whole subtree. Idempotent,
    /// never blocks.
    pub(crate) fn cancel(self: &Arc<Self>) -> CancellationStats {
        let mut stats = CancellationStats {
            visited: 1,
            cancelled: 0,
        };

        if self.cancel_requested.swap(true, Ordering::AcqRel) {
            return stats;
        }
        stats.cancelled = 1;

        tracing::debug!(task.id = %self.id, task.name = ?self.name, "cancellation requested");

        let children = {
            let mut inner = self.inner.lock();

            match inner.state {
                TaskState::Created if self.atomic => {}
                TaskState::Created => inner.body_done = true,
                TaskState::Active | TaskState::Completing if inner.failure.is_none() => {
                    inner.transition(self.id, TaskState::Cancelling);
                }
                _ => {}
            }

            if self.kind == NodeKind::Group {
                inner.body_done = true;
            }

            inner.snapshot_children()
        };

        self.wake_body();

        for child in children {
            stats += child.cancel();
        }

        self.try_finalize();
        stats
    }

    /// Records `err` as the outcome of this node and tears the subtree down.
    /// The node ends `Failed` once the body and every child are terminal.
    pub(crate) fn fail(self: &Arc<Self>, err: Error) {
        let children = {
            let mut inner = self.inner.lock();

            if inner.state.is_terminal() || inner.failure.is_some() {
                return;
            }

            if inner.state == TaskState::Cancelling {
                tracing::debug!(
                    task.id = %self.id,
                    error = %err,
                    "failure ignored, node is already cancelling"
                );
                return;
            }

            inner.failure = Some(err);
            if inner.state == TaskState::Active {
                inner.transition(self.id, TaskState::Completing);
            }

            if self.kind == NodeKind::Group {
                inner.body_done = true;
            }

            // Set under the lock so no child can attach past this point.
            self.cancel_requested.store(true, Ordering::Release);
            inner.snapshot_children()
        };

        self.wake_body();

        for child in children {
            child.cancel();
        }

        self.try_finalize();
    }

    /// Closes a group: no body to wait for anymore, only children.
    pub(crate) fn complete(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            inner.body_done = true;

            if inner.state == TaskState::Active && !inner.children.is_empty() {
                inner.transition(self.id, TaskState::Completing);
            }
        }

        self.try_finalize();
    }

    /// The body future resolved (or was dropped) with `res`.
    pub(crate) fn body_finished(self: &Arc<Self>, res: Result<()>) {
        match res {
            Ok(()) => {}
            Err(Error::Cancelled) => {
                self.cancel();
            }
            Err(err) => self.fail(err),
        }

        {
            let mut inner = self.inner.lock();
            inner.body_done = true;

            if inner.state == TaskState::Active && !inner.children.is_empty() {
                inner.transition(self.id, TaskState::Completing);
            }
        }

        *self.body.lock() = None;
        self.try_finalize();
    }

    /// Registers a callback for the terminal transition. Runs it right away
    /// when the node is already terminal.
    pub(crate) fn on_completion(&self, cb: Callback) {
        let mut inner = self.inner.lock();

        match inner.outcome.clone() {
            Some(outcome) => {
                drop(inner);
                run_callback(self.id, cb, &outcome);
            }
            None => inner.callbacks.push(cb),
        }
    }

    pub(crate) fn poll_outcome(&self, cx: &mut Context<'_>) -> Poll<Outcome> {
        let mut inner = self.inner.lock();

        if let Some(outcome) = &inner.outcome {
            return Poll::Ready(outcome.clone());
        }

        if !inner.waiters.iter().any(|w| w.will_wake(cx.waker())) {
            inner.waiters.push(cx.waker().clone());
        }

        Poll::Pending
    }

    fn wake_body(&self) {
        let task = self.body.lock().as_ref().and_then(Weak::upgrade);

        if let Some(task) = task {
            task.schedule();
        }
    }

    fn try_finalize(self: &Arc<Self>) {
        let (outcome, callbacks, waiters) = {
            let mut inner = self.inner.lock();

            if inner.state.is_terminal() || !inner.body_done || !inner.children.is_empty() {
                return;
            }

            let outcome = match &inner.failure {
                Some(err) => Outcome::Failed(err.clone()),
                None if matches!(inner.state, TaskState::Created | TaskState::Cancelling) => {
                    Outcome::Cancelled
                }
                None => Outcome::Completed,
            };

            if !inner.transition(self.id, outcome.state()) {
                return;
            }

            inner.outcome = Some(outcome.clone());
            (
                outcome,
                mem::take(&mut inner.callbacks),
                mem::take(&mut inner.waiters),
            )
        };

        tracing::trace!(
            task.id = %self.id,
            task.name = ?self.name,
            state = %outcome.state(),
            "reached terminal state"
        );

        for cb in callbacks {
            run_callback(self.id, cb, &outcome);
        }

        for waker in waiters {
            waker.wake();
        }

        match self.parent() {
            Some(parent) => parent.child_terminated(self, &outcome),
            None => {
                if let Outcome::Failed(err) = &outcome {
                    if self.propagate {
                        self.report_failure(self.id, err, false);
                    }
                }
            }
        }
    }

    fn child_terminated(self: &Arc<Self>, child: &TaskNode, outcome: &Outcome) {
        self.inner.lock().children.remove(&child.id);

        if let Outcome::Failed(err) = outcome {
            if child.propagate {
                match self.policy {
                    Policy::FailFast => self.fail(err.clone()),
                    Policy::Supervisor => self.report_failure(child.id, err, true),
                }
            }
        }

        self.try_finalize();
    }

    // `isolated` failures were contained by a supervisor, the others escaped
    // the whole tree.
    fn report_failure(&self, failed: Id, err: &Error, isolated: bool) {
        if let Some(handler) = &self.on_failure {
            return handler(failed, err);
        }

        if isolated {
            tracing::warn!(
                task.id = %failed,
                scope.id = %self.id,
                error = %err,
                "supervised task failed"
            );
        } else {
            tracing::error!(
                task.id = %failed,
                scope.id = %self.id,
                error = %err,
                "unhandled task failure"
            );
        }
    }
}

impl Inner {
    // Returns false on an invalid transition, which is a bug in this module.
    fn transition(&mut self, id: Id, to: TaskState) -> bool {
        match self.state.transition(to) {
            Ok(state) => {
                self.state = state;
                true
            }
            Err(err) => {
                tracing::error!(task.id = %id, error = %err, "task state machine violated");
                debug_assert!(false, "{err}");
                false
            }
        }
    }

    fn snapshot_children(&self) -> SmallVec<[Arc<TaskNode>; SPILL_TO_HEAP_THRESHOLD]> {
        self.children.values().cloned().collect()
    }
}

fn run_callback(id: Id, cb: Callback, outcome: &Outcome) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| cb(outcome))) {
        let err = Error::from_panic(payload);
        tracing::error!(task.id = %id, error = %err, "completion callback panicked");
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TaskNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("state", &inner.state)
            .field("children", &inner.children.len())
            .field("cancel_requested", &self.is_cancel_requested())
            .finish()
    }
}

/// Resolves once the node is terminal. Unlike awaiting a handle, this is not
/// a cancellation point: it is used to drain work after cancelling it.
pub(crate) struct Terminated {
    node: Arc<TaskNode>,
}

impl Terminated {
    pub(crate) fn new(node: Arc<TaskNode>) -> Self {
        Terminated { node }
    }
}

impl Future for Terminated {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.node.poll_outcome(cx)
    }
}
