use crate::error::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a task or task group.
///
/// ```text
/// Created ──► Active ──► Completing ──► Completed | Failed
///    │          │  │          │
///    │          │  └──► Completed | Failed
///    │          ▼             ▼
///    │       Cancelling ◄─────┘
///    │          │
///    └──────────┴──► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Spawned but never polled.
    Created,

    /// The body is running.
    Active,

    /// The outcome is decided but children are still live.
    Completing,

    /// Cancellation was requested. The only way out is `Cancelled`.
    Cancelling,

    Cancelled,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Cancelled | TaskState::Completed | TaskState::Failed
        )
    }

    /// Running or waiting on children, and not on its way to cancellation.
    pub fn is_active(self) -> bool {
        matches!(self, TaskState::Active | TaskState::Completing)
    }

    /// Validates `self -> to`.
    pub fn transition(self, to: TaskState) -> Result<TaskState> {
        use TaskState::*;

        let allowed = matches!(
            (self, to),
            (Created, Active)
                | (Created, Cancelled)
                | (Active, Completing)
                | (Active, Completed)
                | (Active, Failed)
                | (Active, Cancelling)
                | (Completing, Completed)
                | (Completing, Failed)
                | (Completing, Cancelling)
                | (Cancelling, Cancelled)
        );

        if allowed {
            Ok(to)
        } else {
            Err(Error::InvalidStateTransition { from: self, to })
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// Scheduling bits, independent from the lifecycle above. A task is queued at
// most once: wakes that land while the task is being polled only set SCHEDULED
// and the poller re-dispatches it when it goes idle.
const SCHEDULED: u8 = 1;
const RUNNING: u8 = 1 << 1;
const COMPLETE: u8 = 1 << 2;

#[derive(Debug)]
pub(crate) struct RunState(AtomicU8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransitionToNotified {
    /// Caller must hand the task to its dispatcher.
    Submit,
    /// Already queued, running, or done.
    DoNothing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransitionToRunning {
    Success,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransitionToIdle {
    Ok,
    /// Woken while running, caller must re-dispatch.
    Notified,
}

impl RunState {
    pub(crate) fn new() -> Self {
        RunState(AtomicU8::new(0))
    }

    pub(crate) fn transition_to_notified(&self) -> TransitionToNotified {
        let mut curr = self.0.load(Ordering::Acquire);
        loop {
            if curr & (COMPLETE | SCHEDULED) != 0 {
                return TransitionToNotified::DoNothing;
            }

            match self.0.compare_exchange_weak(
                curr,
                curr | SCHEDULED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) if curr & RUNNING != 0 => return TransitionToNotified::DoNothing,
                Ok(_) => return TransitionToNotified::Submit,
                Err(actual) => curr = actual,
            }
        }
    }

    pub(crate) fn transition_to_running(&self) -> TransitionToRunning {
        let mut curr = self.0.load(Ordering::Acquire);
        loop {
            if curr & COMPLETE != 0 {
                return TransitionToRunning::Complete;
            }

            debug_assert!(curr & RUNNING == 0, "task polled concurrently");
            let next = (curr & !SCHEDULED) | RUNNING;

            match self
                .0
                .compare_exchange_weak(curr, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return TransitionToRunning::Success,
                Err(actual) => curr = actual,
            }
        }
    }

    pub(crate) fn transition_to_idle(&self) -> TransitionToIdle {
        let prev = self.0.fetch_and(!RUNNING, Ordering::AcqRel);

        if prev & SCHEDULED != 0 {
            TransitionToIdle::Notified
        } else {
            TransitionToIdle::Ok
        }
    }

    pub(crate) fn set_complete(&self) {
        self.0.store(COMPLETE, Ordering::Release);
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.0.load(Ordering::Acquire) & COMPLETE != 0
    }
}

#[cfg(test)]
mod tests {
    use super::TaskState::*;
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Created, Active)]
    #[case(Created, Cancelled)]
    #[case(Active, Completed)]
    #[case(Active, Failed)]
    #[case(Active, Completing)]
    #[case(Active, Cancelling)]
    #[case(Completing, Completed)]
    #[case(Completing, Failed)]
    #[case(Completing, Cancelling)]
    #[case(Cancelling, Cancelled)]
    fn test_valid_transitions(#[case] from: TaskState, #[case] to: TaskState) {
        assert_eq!(from.transition(to).unwrap(), to);
    }

    #[rstest]
    #[case::leave_cancelling_to_active(Cancelling, Active)]
    #[case::leave_cancelling_to_completed(Cancelling, Completed)]
    #[case::leave_cancelling_to_failed(Cancelling, Failed)]
    #[case::reenter_completed(Completed, Completed)]
    #[case::reenter_cancelled(Cancelled, Cancelled)]
    #[case::terminal_to_active(Failed, Active)]
    #[case::skip_start(Created, Completed)]
    #[case::back_to_created(Active, Created)]
    fn test_invalid_transitions(#[case] from: TaskState, #[case] to: TaskState) {
        let err = from.transition(to).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidStateTransition { from: f, to: t } if f == from && t == to
        ));
    }

    #[test]
    fn test_state_predicates() {
        assert!(Completing.is_active());
        assert!(!Cancelling.is_active());
        assert!(!Created.is_terminal());
        assert!([Completed, Failed, Cancelled].iter().all(|s| s.is_terminal()));
    }

    #[test]
    fn test_run_state_wake_while_running() {
        let state = RunState::new();

        assert_eq!(state.transition_to_notified(), TransitionToNotified::Submit);
        assert_eq!(state.transition_to_notified(), TransitionToNotified::DoNothing);

        assert_eq!(state.transition_to_running(), TransitionToRunning::Success);
        assert_eq!(state.transition_to_notified(), TransitionToNotified::DoNothing);
        assert_eq!(state.transition_to_idle(), TransitionToIdle::Notified);

        // The poller re-dispatches, the bit is still set.
        assert_eq!(state.transition_to_running(), TransitionToRunning::Success);
        assert_eq!(state.transition_to_idle(), TransitionToIdle::Ok);

        state.set_complete();
        assert_eq!(state.transition_to_notified(), TransitionToNotified::DoNothing);
        assert_eq!(state.transition_to_running(), TransitionToRunning::Complete);
    }
}
