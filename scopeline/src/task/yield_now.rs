use crate::context;
use crate::error::Result;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

/// Suspends the current task once, letting the dispatcher run whatever else
/// is ready. Also a cancellation point.
pub async fn yield_now() -> Result<()> {
    YieldNow {
        awaiting_first_poll: true,
    }
    .await
}

#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
struct YieldNow {
    awaiting_first_poll: bool,
}

impl Future for YieldNow {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        ready!(context::poll_cancellation())?;

        // Only yield on first poll. Next time the task is scheduled we return.
        if self.awaiting_first_poll {
            self.awaiting_first_poll = false;
            cx.waker().wake_by_ref();
            Poll::Pending
        } else {
            Poll::Ready(Ok(()))
        }
    }
}
