//! Task groups: structured join and cancellation over a set of tasks.
//!
//! A [`TaskGroup`] owns the tasks launched into it. It only becomes terminal
//! once every one of them is, and its [`Policy`] decides what a failing child
//! does to the others:
//!
//! - [`Policy::FailFast`]: the first failure cancels every sibling, the group
//!   ends `Failed` with that cause and hands it to its own parent.
//! - [`Policy::Supervisor`]: a failure stays with the child that raised it.
//!
//! [`scope`] and [`supervisor_scope`] wrap the common pattern of running a
//! body inside a fresh group and waiting for everything it launched.
use crate::context;
use crate::error::{Error, Result};
use crate::runtime::{Dispatcher, Handle, SCOPED_TASK_OPTS, SpawnBuilder, spawn_builder};
use crate::task::{
    CancellationStats, FailureHandler, Id, JoinHandle, NodeConfig, Outcome, TaskNode, TaskState,
};
use futures::future::poll_fn;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::task::{Poll, ready};

/// What a group does when one of its children fails.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Cancel every sibling and fail the group with the first failure.
    #[default]
    FailFast,

    /// Isolate the failure: siblings keep running and the group completes
    /// normally. The failure is visible on the child's handle and is passed
    /// to the group's failure handler.
    Supervisor,
}

/// A set of child tasks joined and cancelled together.
///
/// A group is a node of the task tree like any task. Created from inside a
/// task it is a child of that task: cancelling the task cancels the group,
/// and under fail-fast the group's failure fails the task. The task cannot
/// finish before the group is terminal.
///
/// Clones share the same group. Once the last clone is dropped the group is
/// closed, exactly as by [`join`](Self::join) but without waiting.
///
/// ```no_run
/// use scopeline::scope::{Policy, TaskGroup};
///
/// # scopeline::run_root(async {
/// let group = TaskGroup::new(Policy::Supervisor)?;
/// for n in 0..3 {
///     group.launch(async move {
///         println!("worker {n}");
///         Ok(())
///     })?;
/// }
///
/// group.join().await?;
/// # Ok(())
/// # }).unwrap();
/// ```
#[derive(Clone)]
pub struct TaskGroup {
    shared: Arc<Shared>,
}

struct Shared {
    node: Arc<TaskNode>,

    handle: Handle,

    /// Dispatcher of the children, unless they pick one.
    dispatcher: Option<Dispatcher>,

    close_on_drop: bool,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if !self.close_on_drop {
            return;
        }

        // Nothing else owns a root scope, it lives on until its children are
        // done.
        if self.node.parent().is_none() && !self.node.is_terminal() {
            let node = Arc::clone(&self.node);
            self.node.on_completion(Box::new(move |_| drop(node)));
        }

        self.node.complete();
    }
}

impl TaskGroup {
    /// A group under the current task, or at the top of the runtime outside
    /// of any task.
    pub fn new(policy: Policy) -> Result<TaskGroup> {
        Self::builder().policy(policy).build()
    }

    /// A root scope: a group with no parent.
    ///
    /// Cancelling the task that created it does not reach it, and its failure
    /// never reaches that task either: it goes to the failure handler, or to
    /// the log. This breaks the guarantees of structured concurrency, the
    /// group's tasks can outlive their creator. Use sparingly.
    pub fn root(policy: Policy) -> Result<TaskGroup> {
        Self::builder().policy(policy).root().build()
    }

    pub fn builder() -> GroupBuilder {
        GroupBuilder::default()
    }

    /// Wraps an existing node, left open when the handle is dropped.
    pub(crate) fn from_node(
        node: Arc<TaskNode>,
        handle: Handle,
        dispatcher: Option<Dispatcher>,
    ) -> TaskGroup {
        TaskGroup {
            shared: Arc::new(Shared {
                node,
                handle,
                dispatcher,
                close_on_drop: false,
            }),
        }
    }

    /// Launches `work` as a child of the group.
    ///
    /// Fails with `IllegalState` when the group is cancelled, failing or
    /// terminal.
    pub fn launch<F>(&self, work: F) -> Result<JoinHandle<()>>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.spawn(work)
    }

    /// Like [`launch`](Self::launch), the handle yields the value of `work`.
    pub fn spawn<F, T>(&self, work: F) -> Result<JoinHandle<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_with(spawn_builder(), work)
    }

    /// Launches `work` as a child of the group, configured by `builder`.
    pub fn spawn_with<F, T>(&self, builder: SpawnBuilder, work: F) -> Result<JoinHandle<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        builder.or_on(self.shared.dispatcher.as_ref()).spawn_under(
            &self.shared.handle,
            Some(Arc::clone(&self.shared.node)),
            work,
        )
    }

    /// Requests cancellation of every child, transitively. Idempotent, returns
    /// immediately. The group rejects new children from now on.
    pub fn cancel(&self) -> CancellationStats {
        self.shared.node.cancel()
    }

    /// Closes the group and waits until every child is terminal.
    ///
    /// Returns the group's failure if it ended `Failed`, `Ok` when it
    /// completed or was cancelled. A cancellation point for the caller.
    pub async fn join(&self) -> Result<()> {
        let node = &self.shared.node;
        node.complete();

        let outcome = poll_fn(|cx| {
            if let Poll::Ready(outcome) = node.poll_outcome(cx) {
                return Poll::Ready(Ok::<_, Error>(outcome));
            }

            ready!(context::poll_cancellation())?;
            Poll::Pending
        })
        .await?;

        match outcome {
            Outcome::Failed(err) => Err(err),
            Outcome::Completed | Outcome::Cancelled => Ok(()),
        }
    }

    /// Cancels the group, then waits for it like [`join`](Self::join).
    pub async fn cancel_and_join(&self) -> Result<()> {
        self.cancel();
        self.join().await
    }

    /// Accepts children and nobody asked it to stop.
    pub fn is_active(&self) -> bool {
        let node = &self.shared.node;
        node.state().is_active() && !node.is_cancel_requested()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.node.is_cancel_requested()
    }

    pub fn is_finished(&self) -> bool {
        self.shared.node.is_terminal()
    }

    pub fn state(&self) -> TaskState {
        self.shared.node.state()
    }

    pub fn id(&self) -> Id {
        self.shared.node.id
    }

    pub fn name(&self) -> Option<&str> {
        self.shared.node.name()
    }

    pub fn policy(&self) -> Policy {
        self.shared.node.policy()
    }

    /// Children that are not terminal yet.
    pub fn num_children(&self) -> usize {
        self.shared.node.num_children()
    }

    /// Runs `f` once the group is terminal, right away if it already is.
    pub fn on_completion<F>(&self, f: F)
    where
        F: FnOnce(&Outcome) + Send + 'static,
    {
        self.shared.node.on_completion(Box::new(f));
    }
}

impl fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGroup")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("policy", &self.policy())
            .field("state", &self.state())
            .field("children", &self.num_children())
            .finish()
    }
}

#[derive(Default)]
enum Parent {
    /// The current task, or the top of the runtime.
    #[default]
    Current,
    Root,
    Node(Arc<TaskNode>),
}

/// Configures a [`TaskGroup`] before creating it.
///
/// ```no_run
/// use scopeline::scope::{Policy, TaskGroup};
///
/// # scopeline::run_root(async {
/// let group = TaskGroup::builder()
///     .name("uploads")
///     .policy(Policy::Supervisor)
///     .on_failure(|id, err| eprintln!("upload {id} failed: {err}"))
///     .build()?;
/// # Ok(())
/// # }).unwrap();
/// ```
pub struct GroupBuilder {
    name: Option<Arc<str>>,

    policy: Policy,

    dispatcher: Option<Dispatcher>,

    on_failure: Option<FailureHandler>,

    parent: Parent,

    propagate: bool,
}

impl Default for GroupBuilder {
    fn default() -> Self {
        GroupBuilder {
            name: None,
            policy: Policy::default(),
            dispatcher: None,
            on_failure: None,
            parent: Parent::default(),
            propagate: true,
        }
    }
}

impl GroupBuilder {
    pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Children run on `dispatcher` unless they pick one themselves.
    pub fn on(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Receives the failures of isolated children under a supervisor, and the
    /// group's own failure when it has no parent. Without a handler they are
    /// logged.
    pub fn on_failure<F>(mut self, f: F) -> Self
    where
        F: Fn(Id, &Error) + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(f));
        self
    }

    /// Makes the group a root scope, see [`TaskGroup::root`].
    pub fn root(mut self) -> Self {
        self.parent = Parent::Root;
        self
    }

    /// Nests the group under `parent` instead of the current task.
    pub fn child_of(mut self, parent: &TaskGroup) -> Self {
        self.parent = Parent::Node(Arc::clone(&parent.shared.node));
        self
    }

    pub(crate) fn propagate(mut self, propagate: bool) -> Self {
        self.propagate = propagate;
        self
    }

    /// Creates the group. Fails with `IllegalState` outside of a runtime or
    /// when the parent no longer accepts children.
    pub fn build(self) -> Result<TaskGroup> {
        let handle = context::current_handle()
            .ok_or_else(|| Error::illegal_state("task group created outside of a runtime"))?;

        let parent = match self.parent {
            Parent::Current => {
                Some(context::current_node().unwrap_or_else(|| Arc::clone(handle.root())))
            }
            Parent::Root => None,
            Parent::Node(node) => Some(node),
        };

        let cfg = NodeConfig {
            name: self.name,
            propagate: self.propagate,
            on_failure: self.on_failure,
            ..NodeConfig::group(self.policy)
        };

        let node = TaskNode::new(cfg, parent.as_ref());
        if let Some(parent) = &parent {
            if let Err(err) = parent.attach_child(&node) {
                tracing::debug!(scope.id = %node.id, error = %err, "launch rejected by a dead scope");
                return Err(err);
            }
        }

        tracing::debug!(
            scope.id = %node.id,
            scope.name = ?node.name(),
            parent.id = ?parent.as_ref().map(|p| p.id),
            policy = ?self.policy,
            "group created"
        );

        Ok(TaskGroup {
            shared: Arc::new(Shared {
                node,
                handle,
                dispatcher: self.dispatcher,
                close_on_drop: true,
            }),
        })
    }
}

impl fmt::Debug for GroupBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupBuilder")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("dispatcher", &self.dispatcher)
            .field("on_failure", &self.on_failure.is_some())
            .finish()
    }
}

/// Runs `body` as the first child of a fresh fail-fast group and waits for
/// the whole group.
///
/// Returns the body's value once every task it launched into the group is
/// done. If any of them fails, the others are cancelled and the failure is
/// returned here: it does not cancel the caller's own scope.
///
/// ```no_run
/// # scopeline::run_root(async {
/// let total = scopeline::scope::scope(|group| async move {
///     let a = group.spawn(async { Ok(1) })?;
///     let b = group.spawn(async { Ok(2) })?;
///     Ok(a.await? + b.await?)
/// })
/// .await?;
///
/// assert_eq!(total, 3);
/// # Ok(())
/// # }).unwrap();
/// ```
pub async fn scope<F, Fut, T>(body: F) -> Result<T>
where
    F: FnOnce(TaskGroup) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    run_scope(Policy::FailFast, body).await
}

/// Like [`scope`], but the group is a supervisor: failures of the tasks the
/// body launches stay isolated. A failure of the body itself cancels the
/// group and is returned.
pub async fn supervisor_scope<F, Fut, T>(body: F) -> Result<T>
where
    F: FnOnce(TaskGroup) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    run_scope(Policy::Supervisor, body).await
}

async fn run_scope<F, Fut, T>(policy: Policy, body: F) -> Result<T>
where
    F: FnOnce(TaskGroup) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let group = TaskGroup::builder()
        .policy(policy)
        .propagate(false)
        .build()?;

    let work = body(group.clone());
    let body = match policy {
        Policy::FailFast => group.spawn(work)?,
        Policy::Supervisor => {
            let body = group.spawn_with(spawn_builder().with_opts(*SCOPED_TASK_OPTS), work)?;

            let owner = group.clone();
            body.on_completion(move |outcome| {
                if let Outcome::Failed(_) = outcome {
                    owner.cancel();
                }
            });
            body
        }
    };

    group.join().await?;
    body.try_output().unwrap_or(Err(Error::Cancelled))
}

#[cfg(test)]
mod tests;
