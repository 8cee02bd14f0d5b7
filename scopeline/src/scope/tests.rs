use super::*;
use crate as scopeline;
use crate::runtime::Builder;
use crate::task::{self, TaskHandle};
use crate::time;
use parking_lot::Mutex;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::time::Duration;

assert_impl_all!(TaskGroup: Send, Sync, Clone);
assert_impl_all!(GroupBuilder: Send);

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

async fn sleeper(delay: u64) -> Result<()> {
    time::sleep(ms(delay)).await
}

async fn failing(delay: u64, msg: &'static str) -> Result<()> {
    time::sleep(ms(delay)).await?;
    Err(Error::msg(msg))
}

fn recorder() -> (Arc<Mutex<Vec<(Id, String)>>>, impl Fn(Id, &Error) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    (seen, move |id, err: &Error| log.lock().push((id, err.to_string())))
}

#[scopeline::test(flavor = "virtual")]
async fn test_fail_fast_cancels_siblings() {
    let (failures, handler) = recorder();
    let group = TaskGroup::builder()
        .root()
        .on_failure(handler)
        .build()
        .unwrap();

    let a = group.launch(sleeper(1000)).unwrap().task_handle();
    let b = group.launch(failing(10, "b exploded")).unwrap().task_handle();
    let c = group.launch(sleeper(1000)).unwrap().task_handle();

    let err = group.join().await.unwrap_err();
    assert_eq!(err.to_string(), "task failed: b exploded");

    assert_eq!(a.state(), TaskState::Cancelled);
    assert_eq!(b.state(), TaskState::Failed);
    assert_eq!(c.state(), TaskState::Cancelled);
    assert_eq!(group.state(), TaskState::Failed);
    assert_eq!(time::now(), ms(10));

    // A root scope has nobody to hand its failure to but the handler.
    assert_eq!(
        *failures.lock(),
        vec![(group.id(), "task failed: b exploded".to_string())]
    );
}

#[scopeline::test(flavor = "virtual")]
async fn test_supervisor_isolates_failures() {
    let (failures, handler) = recorder();
    let group = TaskGroup::builder()
        .policy(Policy::Supervisor)
        .on_failure(handler)
        .build()
        .unwrap();

    let a = group.launch(sleeper(100)).unwrap().task_handle();
    let b = group.launch(failing(10, "b exploded")).unwrap();
    let c = group.launch(sleeper(100)).unwrap().task_handle();
    let b_id = b.id();

    group.join().await.unwrap();

    assert_eq!(a.state(), TaskState::Completed);
    assert_eq!(c.state(), TaskState::Completed);
    assert_eq!(group.state(), TaskState::Completed);
    assert_eq!(time::now(), ms(100));

    // Only observable through B itself.
    assert_eq!(b.state(), TaskState::Failed);
    assert!(matches!(b.await, Err(Error::Failed(_))));
    assert_eq!(
        *failures.lock(),
        vec![(b_id, "task failed: b exploded".to_string())]
    );
    assert!(task::is_active());
}

#[test]
fn test_nested_failure_propagates_to_parent() -> anyhow::Result<()> {
    let runtime = Builder::new_local().try_build()?;

    let res = runtime.block_on(async {
        let group = TaskGroup::new(Policy::FailFast)?;
        group.launch(async { Err(Error::msg("disk full")) })?;

        let joined = group.join().await;
        assert!(matches!(&joined, Err(err) if err.to_string() == "task failed: disk full"));

        // The enclosing task is failing as well and unwinds at its next
        // suspension point.
        assert!(!task::is_active());
        Ok(())
    });

    assert!(matches!(res, Err(Error::Failed(err)) if err.to_string() == "disk full"));
    Ok(())
}

#[scopeline::test(flavor = "virtual")]
async fn test_launch_into_dead_group_is_rejected() {
    let cancelled = TaskGroup::new(Policy::FailFast).unwrap();
    cancelled.cancel();
    assert!(!cancelled.is_active());
    assert!(matches!(
        cancelled.launch(async { Ok(()) }),
        Err(Error::IllegalState(_))
    ));

    let finished = TaskGroup::new(Policy::Supervisor).unwrap();
    finished.join().await.unwrap();
    assert_eq!(finished.state(), TaskState::Completed);
    assert!(matches!(
        finished.launch(async { Ok(()) }),
        Err(Error::IllegalState(_))
    ));
}

#[rstest]
#[case::fail_fast(Policy::FailFast)]
#[case::supervisor(Policy::Supervisor)]
fn test_cancel_and_join(#[case] policy: Policy) -> anyhow::Result<()> {
    let runtime = Builder::new_virtual().try_build()?;

    runtime.block_on(async move {
        let group = TaskGroup::new(policy)?;
        let children = (0..3)
            .map(|_| group.launch(sleeper(1000)).map(|h| h.task_handle()))
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(group.num_children(), 3);

        group.cancel_and_join().await?;

        assert!(children.iter().all(|c| c.state() == TaskState::Cancelled));
        assert_eq!(group.state(), TaskState::Cancelled);
        assert_eq!(group.num_children(), 0);
        assert_eq!(time::now(), Duration::ZERO);
        Ok(())
    })?;
    Ok(())
}

#[scopeline::test(flavor = "virtual")]
async fn test_group_cancelled_with_its_parent() {
    let slot = Arc::new(Mutex::new(None::<TaskHandle>));
    let record = Arc::clone(&slot);

    let owner = scopeline::spawn(async move {
        let group = TaskGroup::new(Policy::Supervisor)?;
        let worker = group.launch(sleeper(1000))?;
        *record.lock() = Some(worker.task_handle());
        group.join().await
    });

    time::sleep(ms(10)).await.unwrap();
    owner.cancel();

    assert!(matches!(owner.await, Err(Error::Cancelled)));
    let worker = slot.lock().clone().unwrap();
    assert_eq!(worker.state(), TaskState::Cancelled);
}

#[scopeline::test(flavor = "virtual")]
async fn test_root_scope_outlives_its_creator() {
    let slot = Arc::new(Mutex::new(None::<TaskHandle>));
    let record = Arc::clone(&slot);

    let owner = scopeline::spawn(async move {
        let group = TaskGroup::root(Policy::FailFast)?;
        let worker = group.launch(sleeper(100))?;
        *record.lock() = Some(worker.task_handle());
        time::sleep(ms(1000)).await
    });

    time::sleep(ms(10)).await.unwrap();
    owner.cancel();
    assert!(matches!(owner.await, Err(Error::Cancelled)));

    let worker = slot.lock().clone().unwrap();
    assert!(worker.is_active());

    worker.join().await.unwrap();
    assert_eq!(worker.state(), TaskState::Completed);
    assert_eq!(time::now(), ms(100));
}

#[scopeline::test(flavor = "virtual")]
async fn test_dropped_group_is_closed() {
    let slot = Arc::new(Mutex::new(None::<TaskHandle>));
    let record = Arc::clone(&slot);

    // The owner cannot finish before the group it created, nor can the group
    // before its child.
    let owner = scopeline::spawn(async move {
        let group = TaskGroup::new(Policy::FailFast)?;
        let worker = group.launch(sleeper(300))?;
        *record.lock() = Some(worker.task_handle());
        Ok(())
    });

    owner.await.unwrap();
    assert_eq!(time::now(), ms(300));

    let worker = slot.lock().clone().unwrap();
    assert_eq!(worker.state(), TaskState::Completed);
}

#[scopeline::test(flavor = "virtual")]
async fn test_group_on_completion_fires_after_children() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let group = TaskGroup::new(Policy::FailFast).unwrap();

    for delay in [30, 10, 20] {
        let log = Arc::clone(&log);
        let child = group.launch(sleeper(delay)).unwrap();
        child.on_completion(move |_| log.lock().push(format!("child-{delay}")));
    }

    let group_log = Arc::clone(&log);
    group.on_completion(move |outcome| {
        group_log.lock().push(format!("group-{}", outcome.state()));
    });

    group.join().await.unwrap();

    assert_eq!(
        *log.lock(),
        vec!["child-10", "child-20", "child-30", "group-Completed"]
    );
}

#[test]
fn test_group_dispatcher() -> anyhow::Result<()> {
    let runtime = Builder::new_local().try_build()?;
    let solo = Dispatcher::single_thread("solo")?;

    let names = runtime.block_on(async move {
        let group = TaskGroup::builder().name("pinned").on(solo).build()?;
        assert_eq!(group.name(), Some("pinned"));

        let handles = (0..4)
            .map(|_| {
                group.spawn(async {
                    task::yield_now().await?;
                    Ok(std::thread::current().name().map(str::to_owned))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        task::join_all(handles).await
    })?;

    assert_eq!(names, vec![Some("solo-0".to_string()); 4]);
    Ok(())
}

#[scopeline::test(flavor = "virtual")]
async fn test_scope_returns_body_value() {
    let total = scope(|group| async move {
        let a = group.spawn(async {
            time::sleep(ms(20)).await?;
            Ok(1)
        })?;
        let b = group.spawn(async { Ok(2) })?;
        Ok(a.await? + b.await?)
    })
    .await
    .unwrap();

    assert_eq!(total, 3);
    assert_eq!(time::now(), ms(20));
}

#[scopeline::test(flavor = "virtual")]
async fn test_scope_waits_for_every_child() {
    let value = scope(|group| async move {
        group.launch(sleeper(500))?;
        Ok("body done")
    })
    .await
    .unwrap();

    assert_eq!(value, "body done");
    assert_eq!(time::now(), ms(500));
}

#[scopeline::test(flavor = "virtual")]
async fn test_scope_failure_is_returned_not_cascaded() {
    let sibling = scopeline::spawn(sleeper(100));

    let res: Result<()> = scope(|group| async move {
        group.launch(failing(10, "bad chunk"))?;
        time::sleep(ms(1000)).await
    })
    .await;

    let err = res.unwrap_err();
    assert_eq!(err.to_string(), "task failed: bad chunk");
    assert_eq!(time::now(), ms(10));

    assert!(task::is_active());
    sibling.await.unwrap();
}

#[scopeline::test(flavor = "virtual")]
async fn test_supervisor_scope_isolates_children() {
    let (value, failed) = supervisor_scope(|group| async move {
        let bad = group.launch(failing(10, "flaky"))?.task_handle();
        let good = group.spawn(async {
            time::sleep(ms(50)).await?;
            Ok(42)
        })?;
        Ok((good.await?, bad))
    })
    .await
    .unwrap();

    assert_eq!(value, 42);
    assert_eq!(failed.state(), TaskState::Failed);
}

#[scopeline::test(flavor = "virtual")]
async fn test_supervisor_scope_body_failure_cancels_children() {
    let slot = Arc::new(Mutex::new(None::<TaskHandle>));
    let record = Arc::clone(&slot);

    let res: Result<()> = supervisor_scope(|group| async move {
        let worker = group.launch(sleeper(1000))?;
        *record.lock() = Some(worker.task_handle());

        time::sleep(ms(10)).await?;
        Err(Error::msg("body gave up"))
    })
    .await;

    assert_eq!(res.unwrap_err().to_string(), "task failed: body gave up");
    assert_eq!(time::now(), ms(10));

    let worker = slot.lock().clone().unwrap();
    assert_eq!(worker.state(), TaskState::Cancelled);
}

#[test]
fn test_group_outside_runtime() {
    assert!(matches!(
        TaskGroup::new(Policy::FailFast),
        Err(Error::IllegalState(_))
    ));
}
