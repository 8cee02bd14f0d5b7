use crate::task::{Id, Task};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

// A collection of all live tasks owned by the runtime. A task is inserted on
// spawn and removed when its node reaches a terminal state.
//
// Keeping a reference to every task is what lets shutdown drop the bodies of
// tasks that would otherwise never be woken again. The container is shared by
// every thread polling tasks, so it must stay cheap under contention.
#[derive(Debug)]
pub(crate) struct OwnedTasks {
    tasks: DashMap<Id, Arc<Task>>,

    // Keep track of size separately because DashMap impl for len iterates over
    // all shards.
    size: AtomicUsize,

    // Close the OwnedTasks when we are shutting down. This is to prevent adding
    // new tasks and guarantee shutdown is only called once.
    closed: AtomicBool,
}

impl OwnedTasks {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            tasks: DashMap::new(),
            size: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Inserts a new task. Returns false once the registry is closed, the
    /// caller must then shut the task down.
    pub(crate) fn insert(self: &Arc<Self>, task: &Arc<Task>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        self.size.fetch_add(1, Ordering::Relaxed);
        self.tasks.insert(task.id(), Arc::clone(task));

        let registry = Arc::downgrade(self);
        let id = task.id();
        task.node.on_completion(Box::new(move |_| {
            if let Some(registry) = Weak::upgrade(&registry) {
                registry.remove(&id);
            }
        }));

        true
    }

    /// Removes a task by its ID, returning it.
    pub(crate) fn remove(&self, id: &Id) -> Option<Arc<Task>> {
        self.tasks.remove(id).map(|(_id, task)| {
            self.size.fetch_sub(1, Ordering::Relaxed);
            task
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when a live task is polled by the threads of a pool. Those can
    /// wake work on any other dispatcher at any time.
    pub(crate) fn has_live_pooled_tasks(&self) -> bool {
        self.tasks.iter().any(|entry| {
            let task = entry.value();
            task.dispatcher.is_pooled() && !task.node.is_terminal()
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the registry, then drops the body of every task that is not
    /// being polled right now and drives it to a terminal state. Tasks polled
    /// elsewhere stay registered, call again once their threads are stopped.
    pub(crate) fn shutdown_all(&self) {
        self.closed.store(true, Ordering::Release);

        // Collect first: shutting a task down runs its completion callbacks,
        // which remove it from this map.
        let tasks = self
            .tasks
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect::<Vec<_>>();

        if tasks.is_empty() {
            return;
        }

        tracing::debug!(tasks = tasks.len(), "shutting down live tasks");

        for task in tasks {
            task.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Builder;
    use crate::task::TaskState;
    use static_assertions::assert_impl_all;

    assert_impl_all!(OwnedTasks: Send, Sync);

    #[test]
    fn test_tasks_leave_registry_when_terminal() -> anyhow::Result<()> {
        let runtime = Builder::new_local().try_build()?;
        let tasks = Arc::clone(runtime.handle().tasks());

        let handle = runtime.spawn(async { Ok(()) });
        assert_eq!(tasks.len(), 1);

        runtime.block_on(handle)?;
        assert!(tasks.is_empty());
        Ok(())
    }

    #[test]
    fn test_closed_registry_rejects_tasks() -> anyhow::Result<()> {
        let runtime = Builder::new_local().try_build()?;
        let tasks = Arc::clone(runtime.handle().tasks());

        tasks.shutdown_all();
        assert!(tasks.is_closed());

        let handle = runtime.spawn(async { Ok(()) });
        assert_eq!(handle.state(), TaskState::Cancelled);
        assert!(tasks.is_empty());
        Ok(())
    }
}
