use crate::context;
use crate::error::Result;
use futures::lock::MutexLockFuture;
use pin_project::pin_project;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

pub use futures::lock::MutexGuard;

/// An async mutual exclusion lock whose acquisition is a cancellation point.
///
/// The guard can be held across `.await`. A task cancelled while it waits for
/// the lock stops waiting and gets [`Error::Cancelled`] instead of the guard.
///
/// [`Error::Cancelled`]: crate::Error::Cancelled
///
/// ```no_run
/// use scopeline::sync::Mutex;
/// use std::sync::Arc;
///
/// # scopeline::run_root(async {
/// let balance = Arc::new(Mutex::new(0));
///
/// let deposits = (0..10)
///     .map(|_| {
///         let balance = Arc::clone(&balance);
///         scopeline::spawn(async move {
///             let mut guard = balance.lock().await?;
///             scopeline::task::yield_now().await?;
///             *guard += 10;
///             Ok(())
///         })
///     })
///     .collect::<Vec<_>>();
///
/// scopeline::task::join_all(deposits).await?;
/// assert_eq!(*balance.lock().await?, 100);
/// # Ok(())
/// # }).unwrap();
/// ```
pub struct Mutex<T: ?Sized> {
    inner: futures::lock::Mutex<T>,
}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Mutex {
            inner: futures::lock::Mutex::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Waits for the lock.
    pub fn lock(&self) -> Lock<'_, T> {
        Lock {
            inner: self.inner.lock(),
        }
    }

    /// Takes the lock if nobody holds it, without waiting.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.inner.try_lock()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Mutex::new(T::default())
    }
}

impl<T> From<T> for Mutex<T> {
    fn from(value: T) -> Self {
        Mutex::new(value)
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex").field("inner", &&self.inner).finish()
    }
}

/// Future returned by [`Mutex::lock`].
#[pin_project]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Lock<'a, T: ?Sized> {
    #[pin]
    inner: MutexLockFuture<'a, T>,
}

impl<'a, T: ?Sized> Future for Lock<'a, T> {
    type Output = Result<MutexGuard<'a, T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        ready!(context::poll_cancellation())?;

        self.project().inner.poll(cx).map(Ok)
    }
}

impl<T: ?Sized> fmt::Debug for Lock<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as scopeline;
    use crate::error::Error;
    use crate::runtime::{Builder, Dispatcher, with_dispatcher};
    use crate::task::{self, TaskState};
    use crate::test_utils::init_tracing;
    use crate::time;
    use rstest::rstest;
    use static_assertions::assert_impl_all;
    use std::cell::Cell;
    use std::sync::Arc;
    use std::time::Duration;

    assert_impl_all!(Mutex<Vec<u8>>: Send, Sync, Default);
    assert_impl_all!(Lock<'static, Vec<u8>>: Send);
    assert_impl_all!(Mutex<str>: fmt::Debug);

    const TASKS: u64 = 10;
    const ROUNDS: u64 = 100;

    #[test]
    fn test_lost_update_without_lock() -> anyhow::Result<()> {
        init_tracing();
        let runtime = Builder::new_local().try_build()?;
        let counter = Arc::new(parking_lot::Mutex::new(0));

        let total = Arc::clone(&counter);
        runtime.block_on(async move {
            let handles = (0..TASKS)
                .map(|_| {
                    let counter = Arc::clone(&counter);
                    scopeline::spawn(async move {
                        for _ in 0..ROUNDS {
                            let seen = *counter.lock();
                            task::yield_now().await?;
                            *counter.lock() = seen + 1;
                        }
                        Ok(())
                    })
                })
                .collect::<Vec<_>>();

            task::join_all(handles).await?;
            Ok(())
        })?;

        // Every task read the same value before any of them wrote it back.
        assert_eq!(*total.lock(), ROUNDS);
        Ok(())
    }

    #[rstest]
    #[case::local(Builder::new_local())]
    #[case::pool(Builder::new_pool().worker_threads(4))]
    fn test_no_lost_update_with_lock(#[case] builder: Builder) -> anyhow::Result<()> {
        init_tracing();
        let runtime = builder.try_build()?;
        let counter = Arc::new(Mutex::new(0));

        let total = runtime.block_on(async move {
            let handles = (0..TASKS)
                .map(|_| {
                    let counter = Arc::clone(&counter);
                    scopeline::spawn(async move {
                        for _ in 0..ROUNDS {
                            let mut guard = counter.lock().await?;
                            let seen = *guard;
                            task::yield_now().await?;
                            *guard = seen + 1;
                        }
                        Ok(())
                    })
                })
                .collect::<Vec<_>>();

            task::join_all(handles).await?;
            let total = *counter.lock().await?;
            Ok(total)
        })?;

        assert_eq!(total, TASKS * ROUNDS);
        Ok(())
    }

    #[test]
    fn test_single_thread_confinement() -> anyhow::Result<()> {
        thread_local! {
            static COUNT: Cell<u64> = const { Cell::new(0) };
        }

        let runtime = Builder::new_pool().worker_threads(4).try_build()?;
        let solo = Dispatcher::single_thread("counter")?;

        let total = runtime.block_on(async move {
            let handles = (0..TASKS)
                .map(|_| {
                    let solo = solo.clone();
                    scopeline::spawn(async move {
                        for _ in 0..ROUNDS {
                            with_dispatcher(&solo, async {
                                COUNT.with(|c| c.set(c.get() + 1));
                                Ok(())
                            })
                            .await?;
                        }
                        Ok(())
                    })
                })
                .collect::<Vec<_>>();

            task::join_all(handles).await?;
            with_dispatcher(&solo, async { Ok(COUNT.with(Cell::get)) }).await
        })?;

        assert_eq!(total, TASKS * ROUNDS);
        Ok(())
    }

    #[scopeline::test(flavor = "virtual")]
    async fn test_waiting_for_lock_is_cancellable() {
        let shared = Arc::new(Mutex::new(0));

        let holder = {
            let shared = Arc::clone(&shared);
            scopeline::spawn(async move {
                let mut guard = shared.lock().await?;
                time::sleep(Duration::from_millis(100)).await?;
                *guard += 1;
                Ok(())
            })
        };

        let waiter = {
            let shared = Arc::clone(&shared);
            scopeline::spawn(async move {
                let mut guard = shared.lock().await?;
                *guard += 10;
                Ok(())
            })
        };

        time::sleep(Duration::from_millis(10)).await.unwrap();
        assert!(shared.try_lock().is_none());

        waiter.cancel();
        let waiter_state = waiter.task_handle();
        assert!(matches!(waiter.await, Err(Error::Cancelled)));
        assert_eq!(waiter_state.state(), TaskState::Cancelled);

        holder.await.unwrap();
        assert_eq!(*shared.lock().await.unwrap(), 1);
        assert_eq!(time::now(), Duration::from_millis(100));
    }

    #[test]
    fn test_into_inner_and_get_mut() {
        let mut mutex = Mutex::from(vec![1, 2]);
        mutex.get_mut().push(3);
        assert_eq!(mutex.try_lock().map(|g| g.len()), Some(3));
        assert!(format!("{mutex:?}").starts_with("Mutex"));
        assert_eq!(mutex.into_inner(), vec![1, 2, 3]);
    }
}
