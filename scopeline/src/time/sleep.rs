use crate::context;
use crate::error::{Error, Result};
use crate::time::clock::TimerState;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Duration;

/// Waits until `duration` has elapsed on the runtime clock.
///
/// A cancellation point: resolves with [`Error::Cancelled`] as soon as the
/// current task is cancelled. A zero duration completes without suspending.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        when: When::After(duration),
        timer: None,
    }
}

/// Waits until the runtime clock reads `deadline`, see [`now`](super::now).
pub fn sleep_until(deadline: Duration) -> Sleep {
    Sleep {
        when: When::At(deadline),
        timer: None,
    }
}

#[derive(Debug, Clone, Copy)]
enum When {
    /// Relative to the first poll.
    After(Duration),
    At(Duration),
}

/// Future returned by [`sleep`] and [`sleep_until`].
#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Sleep {
    when: When,
    timer: Option<Arc<TimerState>>,
}

impl Sleep {
    fn register(&mut self, cx: &mut Context<'_>) -> Result<Poll<()>> {
        let handle = context::current_handle()
            .ok_or_else(|| Error::illegal_state("sleep polled outside of a runtime"))?;
        let clock = handle.clock();
        let now = clock.now();

        let deadline = match self.when {
            When::After(duration) => now.saturating_add(duration),
            When::At(deadline) => deadline,
        };

        if deadline <= now {
            return Ok(Poll::Ready(()));
        }

        let foreground = context::current_node().is_none_or(|node| !node.is_background());
        let timer = clock.register(deadline, foreground);
        timer.register_waker(cx.waker());

        let fired = timer.is_fired();
        self.timer = Some(timer);

        Ok(if fired { Poll::Ready(()) } else { Poll::Pending })
    }
}

impl Future for Sleep {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        ready!(context::poll_cancellation())?;

        let Some(timer) = &self.timer else {
            return match self.register(cx) {
                Ok(poll) => poll.map(Ok),
                Err(err) => Poll::Ready(Err(err)),
            };
        };

        if timer.is_fired() {
            return Poll::Ready(Ok(()));
        }

        timer.register_waker(cx.waker());

        // Fired between the check and the registration.
        if timer.is_fired() {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(timer) = &self.timer {
            timer.cancel();
        }
    }
}
