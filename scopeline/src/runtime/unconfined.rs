use crate::task::Notified;
use crate::utils::ScopeGuard;
use std::cell::RefCell;
use std::collections::VecDeque;

thread_local! {
    // Tasks woken while an unconfined task is already running on this thread.
    // `Some` while the outermost call drains it.
    static TRAMPOLINE: RefCell<Option<VecDeque<Notified>>> = const { RefCell::new(None) };
}

/// Runs `task` on the calling thread.
///
/// Nested dispatches, a task waking another one while it is polled, are
/// queued and run by the outermost call once the current poll returns. The
/// stack stays flat however long the chain of wakes is.
pub(super) fn schedule(task: Notified) {
    let nested = TRAMPOLINE.with(|t| {
        let mut trampoline = t.borrow_mut();
        match trampoline.as_mut() {
            Some(queue) => {
                queue.push_back(task);
                None
            }
            None => {
                *trampoline = Some(VecDeque::new());
                Some(task)
            }
        }
    });

    let Some(task) = nested else {
        return;
    };

    // Tear the trampoline down even if a poll unwinds.
    let _guard = ScopeGuard::new(|| {
        let _ = TRAMPOLINE.try_with(|t| t.borrow_mut().take());
    });

    task.run();

    while let Some(task) = TRAMPOLINE.with(|t| t.borrow_mut().as_mut().and_then(VecDeque::pop_front)) {
        task.run();
    }
}
