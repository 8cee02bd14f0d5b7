use super::*;
use crate as scopeline;
use crate::runtime::{Builder, CancellationPolicy, Dispatcher, Start, TaskOpts, with_dispatcher};
use crate::scope::scope;
use crate::test_utils::init_tracing;
use crate::time;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

assert_impl_all!(JoinHandle<()>: Send, Sync);
assert_impl_all!(TaskHandle: Send, Sync, Clone);
assert_impl_all!(Task: Send, Sync);

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[scopeline::test(flavor = "virtual")]
async fn test_lazy_start() -> anyhow::Result<()> {
    let ran = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&ran);
    let lazy = scopeline::spawn_builder()
        .start(Start::Lazy)
        .spawn(async move {
            flag.store(true, Ordering::Release);
            Ok(1)
        });

    yield_now().await?;
    assert_eq!(lazy.state(), TaskState::Created);
    assert!(!ran.load(Ordering::Acquire));

    // Awaiting starts it.
    assert_eq!(lazy.await?, 1);
    assert!(ran.load(Ordering::Acquire));

    // Cancelled before it ever started: the body never runs.
    let flag = Arc::clone(&ran);
    ran.store(false, Ordering::Release);
    let never = scopeline::spawn_builder()
        .start(Start::Lazy)
        .spawn(async move {
            flag.store(true, Ordering::Release);
            Ok(())
        });

    never.cancel();
    assert_eq!(never.state(), TaskState::Cancelled);
    assert!(!never.start());
    assert!(matches!(never.await, Err(Error::Cancelled)));
    assert!(!ran.load(Ordering::Acquire));
    Ok(())
}

#[scopeline::test(flavor = "local")]
async fn test_undispatched_start_runs_inline() -> anyhow::Result<()> {
    let steps = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&steps);
    let handle = scopeline::spawn_builder()
        .start(Start::Undispatched)
        .spawn(async move {
            counter.fetch_add(1, Ordering::Relaxed);
            yield_now().await?;
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });

    // The first poll already happened, up to the yield.
    assert_eq!(steps.load(Ordering::Relaxed), 1);
    assert_eq!(handle.state(), TaskState::Active);

    handle.await?;
    assert_eq!(steps.load(Ordering::Relaxed), 2);
    Ok(())
}

#[scopeline::test(flavor = "virtual")]
async fn test_atomic_start_runs_until_first_suspension() -> anyhow::Result<()> {
    let steps = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&steps);
    let handle: JoinHandle<()> = scopeline::spawn_builder()
        .start(Start::Atomic)
        .spawn(async move {
            counter.fetch_add(1, Ordering::Relaxed);
            time::sleep(ms(10)).await?;
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });

    // Cancelled before its first poll, yet not skipped.
    handle.cancel();
    assert_eq!(handle.state(), TaskState::Created);

    let task = handle.task_handle();
    assert!(matches!(handle.await, Err(Error::Cancelled)));
    assert_eq!(task.state(), TaskState::Cancelled);
    assert_eq!(steps.load(Ordering::Relaxed), 1);
    assert_eq!(time::now(), Duration::ZERO);
    Ok(())
}

#[scopeline::test(flavor = "virtual")]
async fn test_join_all_keeps_creation_order() -> anyhow::Result<()> {
    let handles = [30, 10, 20]
        .into_iter()
        .map(|delay| {
            scopeline::spawn(async move {
                time::sleep(ms(delay)).await?;
                Ok(delay)
            })
        })
        .collect::<Vec<_>>();

    assert_eq!(join_all(handles).await?, vec![30, 10, 20]);
    assert_eq!(time::now(), ms(30));
    Ok(())
}

#[scopeline::test(flavor = "virtual")]
async fn test_join_all_returns_first_error() {
    let handles = vec![
        scopeline::spawn_builder()
            .with_opts(TaskOpts::DETACHED)
            .spawn(async { Ok(1) }),
        scopeline::spawn_builder()
            .with_opts(TaskOpts::DETACHED)
            .spawn(async { Err(Error::msg("second failed")) }),
    ];

    let err = join_all(handles).await.unwrap_err();
    assert_eq!(err.to_string(), "task failed: second failed");
}

#[test]
fn test_outside_of_a_task() {
    assert!(try_current().is_none());
    assert!(try_id().is_none());
    assert!(is_active());
    assert!(ensure_active().is_ok());
}

#[scopeline::test(flavor = "virtual")]
async fn test_current_task_and_names() -> anyhow::Result<()> {
    let handle = scopeline::spawn_builder()
        .name("fetcher")
        .spawn(async {
            let me = current();
            Ok((me.id(), id(), me.name().map(str::to_owned)))
        });

    assert_eq!(handle.name(), Some("fetcher"));
    let expected = handle.id();

    let (seen, via_id, name) = handle.await?;
    assert_eq!(seen, expected);
    assert_eq!(via_id, expected);
    assert_eq!(name.as_deref(), Some("fetcher"));
    Ok(())
}

#[scopeline::test(flavor = "virtual")]
async fn test_ensure_active_after_cancel() {
    assert!(ensure_active().is_ok());

    let handle = scopeline::spawn(async {
        let me = current();
        assert!(me.is_active());

        let stats = me.cancel();
        assert_eq!(stats.cancelled, 1);
        assert!(!is_active());
        assert!(me.is_cancelled());

        ensure_active()?;
        Ok("unreachable")
    });

    let task = handle.task_handle();
    assert!(matches!(handle.await, Err(Error::Cancelled)));
    assert_eq!(task.state(), TaskState::Cancelled);
    assert!(is_active());
}

#[scopeline::test(flavor = "pool", worker_threads = 2)]
async fn test_ensure_active_stops_busy_loop() -> anyhow::Result<()> {
    let spins = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&spins);
    let busy: JoinHandle<()> = scopeline::spawn(async move {
        loop {
            ensure_active()?;
            counter.fetch_add(1, Ordering::Relaxed);
            std::hint::spin_loop();
        }
    });

    while spins.load(Ordering::Relaxed) == 0 {
        yield_now().await?;
    }

    let busy_task = busy.task_handle();
    busy.cancel_and_join().await?;
    assert_eq!(busy_task.state(), TaskState::Cancelled);
    Ok(())
}

#[rstest]
#[case::strict(CancellationPolicy::Strict, 1)]
#[case::lenient(CancellationPolicy::Lenient, 4)]
fn test_swallowed_cancellation(
    #[case] policy: CancellationPolicy,
    #[case] observed: usize,
) -> anyhow::Result<()> {
    init_tracing();
    let runtime = Builder::new_virtual()
        .cancellation_policy(policy)
        .try_build()?;

    let errors = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&errors);

    let stubborn = runtime.block_on(async move {
        let handle = scopeline::spawn(async move {
            for _ in 0..5 {
                if let Err(err) = time::sleep(ms(10)).await {
                    assert!(err.is_cancelled());
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok(())
        });

        time::sleep(ms(15)).await?;
        let stubborn = handle.task_handle();
        stubborn.cancel();
        stubborn.join().await?;
        Ok(stubborn)
    })?;

    assert_eq!(stubborn.state(), TaskState::Cancelled);
    assert!(stubborn.swallowed_cancellation());
    assert_eq!(errors.load(Ordering::Relaxed), observed);
    Ok(())
}

#[rstest]
#[case::immediate(0)]
#[case::delayed(10)]
fn test_awaited_failure_reaches_the_caller(#[case] delay: u64) -> anyhow::Result<()> {
    init_tracing();
    let runtime = Builder::new_virtual().try_build()?;
    let awaited = Arc::new(Mutex::new(None::<String>));

    let seen = Arc::clone(&awaited);
    let res: Result<()> = runtime.block_on(async move {
        let child: JoinHandle<()> = scopeline::spawn(async move {
            time::sleep(ms(delay)).await?;
            Err(Error::msg("boom"))
        });

        // The child's failure, not the cancellation it cascaded into us.
        let err = child.await.unwrap_err();
        *seen.lock() = Some(err.to_string());
        Ok(())
    });

    assert_eq!(awaited.lock().as_deref(), Some("task failed: boom"));
    assert!(matches!(res, Err(Error::Failed(err)) if err.to_string() == "boom"));
    Ok(())
}

#[scopeline::test(flavor = "virtual")]
async fn test_panic_is_a_failure() {
    let explode = true;

    let res: Result<()> = scope(|group| async move {
        group.launch(async move {
            if explode {
                panic!("boom");
            }
            Ok(())
        })?;
        Ok(())
    })
    .await;

    let err = res.unwrap_err();
    assert!(err.is_panic());
    assert!(err.is_failure());
    assert_eq!(err.to_string(), "task panicked: boom");
}

#[scopeline::test(flavor = "local")]
async fn test_with_dispatcher_hops_threads() -> anyhow::Result<()> {
    let hop = Dispatcher::single_thread("hop")?;
    let caller = thread::current().id();

    let name = with_dispatcher(&hop, async {
        Ok(thread::current().name().map(str::to_owned))
    })
    .await?;

    assert_eq!(name.as_deref(), Some("hop-0"));
    assert_eq!(thread::current().id(), caller);

    // A failure comes back to the caller instead of cancelling its scope.
    let res: Result<()> = with_dispatcher(&hop, async { Err(Error::msg("remote failed")) }).await;
    assert_eq!(res.unwrap_err().to_string(), "task failed: remote failed");
    assert!(is_active());
    Ok(())
}

#[scopeline::test(flavor = "virtual")]
async fn test_completion_callback_runs_once() -> anyhow::Result<()> {
    let calls = Arc::new(Mutex::new(Vec::new()));

    let handle = scopeline::spawn(time::sleep(ms(10)));
    let log = Arc::clone(&calls);
    handle.on_completion(move |outcome| log.lock().push(outcome.state()));

    let task = handle.task_handle();
    handle.await?;
    assert_eq!(*calls.lock(), vec![TaskState::Completed]);

    // Registered after the fact: runs right away.
    let log = Arc::clone(&calls);
    task.on_completion(move |outcome| log.lock().push(outcome.state()));
    assert_eq!(calls.lock().len(), 2);
    assert!(matches!(task.outcome(), Some(Outcome::Completed)));
    Ok(())
}

#[scopeline::test(flavor = "virtual")]
async fn test_cancel_and_join() -> anyhow::Result<()> {
    let handle = scopeline::spawn(time::sleep(Duration::from_secs(60)));
    let task = handle.task_handle();

    yield_now().await?;
    assert_eq!(task.state(), TaskState::Active);

    handle.cancel_and_join().await?;
    assert_eq!(task.state(), TaskState::Cancelled);
    assert_eq!(time::now(), Duration::ZERO);
    Ok(())
}

#[scopeline::test(flavor = "virtual")]
async fn test_detached_task_survives_its_spawner() -> anyhow::Result<()> {
    let slot = Arc::new(Mutex::new(None::<TaskHandle>));
    let record = Arc::clone(&slot);

    let owner = scopeline::spawn(async move {
        let detached = scopeline::spawn_builder()
            .with_opts(TaskOpts::DETACHED)
            .spawn(time::sleep(ms(100)));
        *record.lock() = Some(detached.task_handle());
        time::sleep(ms(1000)).await
    });

    time::sleep(ms(10)).await?;
    owner.cancel();
    assert!(matches!(owner.await, Err(Error::Cancelled)));

    let detached = slot.lock().clone().unwrap();
    assert!(detached.is_active());
    detached.join().await?;
    assert_eq!(detached.state(), TaskState::Completed);
    Ok(())
}
