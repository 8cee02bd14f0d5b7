use super::*;
use super::scheduler::Threads;
use crate as scopeline;
use crate::error::Error;
use crate::runtime::{Builder, Dispatcher, Schedule};
use crate::task::{self, TaskState};
use crate::test_utils::init_tracing;
use static_assertions::assert_impl_all;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

assert_impl_all!(Handle: Send, Sync, Schedule);
assert_impl_all!(Config: Send, Sync, Clone);

fn thread_name() -> String {
    thread::current().name().unwrap_or_default().to_owned()
}

#[test]
fn test_config_rejects_empty_pools() {
    assert!(Config::fixed(0, "empty".into()).is_err());
    assert!(Config::elastic(0, "empty".into()).is_err());

    let cfg = Config::elastic(8, "io".into()).unwrap();
    assert_eq!(cfg.threads, Threads::Elastic(8));
    assert_eq!(cfg.thread_name.next_name(), "io-0");
}

#[test]
fn test_single_thread_runs_everything_on_one_thread() -> anyhow::Result<()> {
    let runtime = Builder::new_local().try_build()?;
    let pool = Handle::try_new(Config::fixed(1, "solo".into())?)?;
    assert_eq!(pool.num_threads(), 1);

    let solo = Dispatcher::from(pool.clone());
    let names = runtime.block_on(async move {
        let handles = (0..10)
            .map(|_| {
                scopeline::spawn_builder().on(solo.clone()).spawn(async {
                    task::yield_now().await?;
                    Ok(thread_name())
                })
            })
            .collect::<Vec<_>>();

        task::join_all(handles).await
    })?;

    assert_eq!(names, vec!["solo-0".to_string(); 10]);
    Ok(())
}

#[scopeline::test(flavor = "pool", worker_threads = 4)]
async fn test_fixed_pool_runs_every_task() -> anyhow::Result<()> {
    let counter = Arc::new(AtomicUsize::new(0));

    let handles = (0..100)
        .map(|_| {
            let counter = Arc::clone(&counter);
            scopeline::spawn(async move {
                task::yield_now().await?;
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(thread_name())
            })
        })
        .collect::<Vec<_>>();

    let names = task::join_all(handles).await?;

    assert_eq!(counter.load(Ordering::Relaxed), 100);
    assert!(names.iter().all(|name| name.starts_with("scopeline-")));
    Ok(())
}

#[scopeline::test(flavor = "pool", worker_threads = 2)]
async fn test_idle_worker_steals() -> anyhow::Result<()> {
    let handles = (0..16)
        .map(|_| {
            scopeline::spawn(async {
                // Keep the worker busy so its queue backs up.
                thread::sleep(Duration::from_millis(5));
                Ok(thread_name())
            })
        })
        .collect::<Vec<_>>();

    let names = task::join_all(handles).await?;
    let distinct = names.into_iter().collect::<HashSet<_>>();

    assert_eq!(distinct.len(), 2);
    Ok(())
}

#[test]
fn test_elastic_pool_grows_on_demand() -> anyhow::Result<()> {
    init_tracing();
    let runtime = Builder::new_local().try_build()?;
    let pool = Handle::try_new(Config::elastic(3, "blocking".into())?)?;
    assert_eq!(pool.num_threads(), 0);

    // Every task blocks until all three run at once.
    let barrier = Arc::new(Barrier::new(3));
    let blocking = Dispatcher::from(pool.clone());

    runtime.block_on(async move {
        let handles = (0..3)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                scopeline::spawn_builder()
                    .on(blocking.clone())
                    .spawn(async move {
                        barrier.wait();
                        Ok(())
                    })
            })
            .collect::<Vec<_>>();

        task::join_all(handles).await?;
        Ok(())
    })?;

    assert_eq!(pool.num_threads(), 3);
    Ok(())
}

#[test]
fn test_schedule_after_shutdown_cancels() -> anyhow::Result<()> {
    let runtime = Builder::new_local().try_build()?;
    let pool = Handle::try_new(Config::fixed(2, "closed".into())?)?;
    pool.shutdown();

    let closed = Dispatcher::from(pool);
    let res = runtime.block_on(async move {
        let handle = scopeline::spawn_builder()
            .on(closed)
            .spawn(async { Ok("never runs") });

        assert_eq!(handle.state(), TaskState::Cancelled);
        Ok(handle.await)
    })?;

    assert!(matches!(res, Err(Error::Cancelled)));
    Ok(())
}

#[test]
fn test_pool_runtime_block_on() -> anyhow::Result<()> {
    let runtime = Builder::new_pool()
        .worker_threads(2)
        .thread_name("api")
        .try_build()?;

    let name = runtime.block_on(async { Ok(thread_name()) })?;
    assert!(name.starts_with("api"));
    Ok(())
}
