use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use datapipe_core::{AppSpec, ArgValue, FutureRef, TaskState};
use datapipe_engine::{
    kwargs, AppRegistry, EngineError, LocalProvider, SchedulerConfig, TaskManager, ERRNO_APP,
};
use datapipe_storage::{OpenMode, Queue, RetryMode};

fn fast(max_workers: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_workers,
        poll_interval: Duration::from_millis(20),
    }
}

/// `fraction` + `average` registry; `calls` counts actual fraction
/// executions.
fn pipeline_registry(fraction_source: &str, calls: Arc<AtomicUsize>) -> Arc<AppRegistry> {
    let mut registry = AppRegistry::new();
    registry
        .register_native(AppSpec::native("fraction", fraction_source), move |_, kw| {
            calls.fetch_add(1, Ordering::SeqCst);
            let seed = kw.get("seed").and_then(|v| v.as_int()).unwrap_or(0);
            Ok(ArgValue::Float(0.785 + seed as f64 * 1e-4))
        })
        .unwrap();
    registry
        .register_native(
            AppSpec::native("average", "fn average(fractions) -> f64 { mean(fractions) * 4.0 }"),
            |args, _| {
                let list = args
                    .first()
                    .and_then(|a| a.as_list())
                    .ok_or("average expects a list")?;
                let mut sum = 0.0;
                for item in list {
                    sum += item.as_float().ok_or("expected a float fraction")?;
                }
                Ok(ArgValue::Float(sum / list.len() as f64 * 4.0))
            },
        )
        .unwrap();
    Arc::new(registry)
}

async fn open_queue(dir: &TempDir, name: &str) -> Queue {
    Queue::open(name, dir.path(), OpenMode::OpenOrCreate)
        .await
        .unwrap()
}

async fn fan_out_reduce(tm: &TaskManager, n: i64) -> datapipe_engine::TaskFuture {
    let mut fractions = Vec::new();
    for seed in 0..n {
        let future = tm
            .submit("fraction", vec![], kwargs([("seed", seed)]))
            .await
            .unwrap();
        fractions.push(future.as_arg());
    }
    tm.submit("average", vec![ArgValue::List(fractions)], BTreeMap::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn fan_out_then_reduce() {
    let dir = TempDir::new().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = pipeline_registry("fn fraction(seed) { v1 }", calls.clone());
    let tm = TaskManager::new(open_queue(&dir, "s1").await, registry)
        .unwrap()
        .with_scheduler(fast(4));

    let avg = fan_out_reduce(&tm, 20).await;
    tm.drain().await.unwrap();

    let value = avg.result().await.unwrap().as_float().unwrap();
    assert!((3.0..=3.3).contains(&value), "average out of range: {value}");
    assert_eq!(calls.load(Ordering::SeqCst), 20);

    // causality: the reducer only ran after every fraction succeeded
    let record = tm.queue().get(avg.task_id().unwrap()).await.unwrap();
    assert_eq!(record.state, TaskState::Succeeded);
    assert_eq!(record.dep_ids.len(), 20);
    for dep in &record.dep_ids {
        let dep = tm.queue().get(*dep).await.unwrap();
        assert_eq!(dep.state, TaskState::Succeeded);
        assert!(dep.finished_at.unwrap() <= record.started_at.unwrap());
    }
}

#[tokio::test]
async fn caching_short_circuits_across_sessions() {
    let dir = TempDir::new().unwrap();
    let source = "fn fraction(seed) { stable }";

    // session 1: compute everything
    let calls1 = Arc::new(AtomicUsize::new(0));
    let tm1 = TaskManager::new(
        open_queue(&dir, "s2").await,
        pipeline_registry(source, calls1.clone()),
    )
    .unwrap()
    .with_scheduler(fast(4));
    let avg1 = fan_out_reduce(&tm1, 20).await;
    tm1.drain().await.unwrap();
    let value1 = avg1.result().await.unwrap();
    assert_eq!(calls1.load(Ordering::SeqCst), 20);

    // session 2, same queue: identical fingerprints reuse the records
    let calls2 = Arc::new(AtomicUsize::new(0));
    let tm2 = TaskManager::new(
        open_queue(&dir, "s2").await,
        pipeline_registry(source, calls2.clone()),
    )
    .unwrap()
    .with_scheduler(fast(4));
    let avg2 = fan_out_reduce(&tm2, 20).await;
    tm2.drain().await.unwrap();
    assert_eq!(calls2.load(Ordering::SeqCst), 0, "no re-execution expected");
    assert_eq!(avg2.result().await.unwrap(), value1);
    assert_eq!(avg2.task_id(), avg1.task_id());

    // session 3, fresh queue over the same base_dir: the shared result
    // cache inserts records directly SUCCEEDED
    let calls3 = Arc::new(AtomicUsize::new(0));
    let tm3 = TaskManager::new(
        open_queue(&dir, "s2-bis").await,
        pipeline_registry(source, calls3.clone()),
    )
    .unwrap()
    .with_scheduler(fast(4));
    let avg3 = fan_out_reduce(&tm3, 20).await;
    let record = tm3.queue().get(avg3.task_id().unwrap()).await.unwrap();
    assert_eq!(record.state, TaskState::Succeeded);
    assert_eq!(calls3.load(Ordering::SeqCst), 0);
    assert_eq!(avg3.result().await.unwrap(), value1);
}

#[tokio::test]
async fn source_edit_invalidates_fingerprints() {
    let dir = TempDir::new().unwrap();

    let calls1 = Arc::new(AtomicUsize::new(0));
    let tm1 = TaskManager::new(
        open_queue(&dir, "s3").await,
        pipeline_registry("fn fraction(seed) { x }", calls1.clone()),
    )
    .unwrap()
    .with_scheduler(fast(4));
    let avg1 = fan_out_reduce(&tm1, 20).await;
    tm1.drain().await.unwrap();
    avg1.result().await.unwrap();
    assert_eq!(calls1.load(Ordering::SeqCst), 20);

    // a textual change with no semantic difference still re-runs
    let calls2 = Arc::new(AtomicUsize::new(0));
    let tm2 = TaskManager::new(
        open_queue(&dir, "s3-edit").await,
        pipeline_registry("fn fraction(seed) { x * 1.0 }", calls2.clone()),
    )
    .unwrap()
    .with_scheduler(fast(4));
    let avg2 = fan_out_reduce(&tm2, 20).await;
    tm2.drain().await.unwrap();
    avg2.result().await.unwrap();
    assert_eq!(calls2.load(Ordering::SeqCst), 20);
    assert_ne!(avg1.fingerprint(), avg2.fingerprint());
}

#[tokio::test]
async fn named_apps_rebind_across_source_edits() {
    let dir = TempDir::new().unwrap();
    let seen = Arc::new(AtomicUsize::new(0));

    let make_registry = |source: &str, seen: Arc<AtomicUsize>| {
        let mut registry = AppRegistry::new();
        registry
            .register_native(AppSpec::native("measure", source).named(), move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(ArgValue::Float(1.5))
            })
            .unwrap();
        Arc::new(registry)
    };

    let tm1 = TaskManager::new(
        open_queue(&dir, "named").await,
        make_registry("fn measure() { v1 }", seen.clone()),
    )
    .unwrap()
    .with_scheduler(fast(1));
    let f1 = tm1.submit("measure", vec![], BTreeMap::new()).await.unwrap();
    tm1.drain().await.unwrap();
    assert_eq!(f1.result().await.unwrap(), ArgValue::Float(1.5));
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    // different source, same name + args: rebinds to the cached result
    let tm2 = TaskManager::new(
        open_queue(&dir, "named-bis").await,
        make_registry("fn measure() { v2, rewritten }", seen.clone()),
    )
    .unwrap()
    .with_scheduler(fast(1));
    let f2 = tm2.submit("measure", vec![], BTreeMap::new()).await.unwrap();
    assert_eq!(f2.fingerprint(), f1.fingerprint());
    assert_eq!(f2.result().await.unwrap(), ArgValue::Float(1.5));
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn skipped_apps_return_null_futures() {
    let dir = TempDir::new().unwrap();
    let mut registry = AppRegistry::new();
    registry
        .register_native(AppSpec::native("noop", "fn noop() {}").skipped(), |_, _| {
            Ok(ArgValue::Int(1))
        })
        .unwrap();
    let tm = TaskManager::new(open_queue(&dir, "skip").await, Arc::new(registry)).unwrap();

    let future = tm.submit("noop", vec![], BTreeMap::new()).await.unwrap();
    assert!(future.is_skipped());
    assert_eq!(future.result().await.unwrap(), ArgValue::Null);
    assert_eq!(future.out().await.unwrap(), "");
    assert_eq!(future.as_arg(), ArgValue::Null);

    // nothing was enqueued
    let counts = tm.queue().counts().await.unwrap();
    assert_eq!(counts.values().sum::<i64>(), 0);
}

#[tokio::test]
async fn shell_app_captures_stdout_exactly() {
    let dir = TempDir::new().unwrap();
    let mut registry = AppRegistry::new();
    registry
        .register(AppSpec::shell("echo_pi", vec!["echo", "-n", "pi ~ {pi:.4f}"]))
        .unwrap();
    let tm = TaskManager::new(open_queue(&dir, "bash").await, Arc::new(registry))
        .unwrap()
        .with_scheduler(fast(1));

    let future = tm
        .submit("echo_pi", vec![], kwargs([("pi", 3.14212_f64)]))
        .await
        .unwrap();
    tm.drain().await.unwrap();
    assert_eq!(future.out().await.unwrap(), "pi ~ 3.1421");
    assert_eq!(future.result().await.unwrap(), ArgValue::Null);
}

#[tokio::test]
async fn fork_exec_worker_runs_shell_tasks() {
    let dir = TempDir::new().unwrap();
    let mut registry = AppRegistry::new();
    registry
        .register(AppSpec::shell("greet", vec!["echo", "-n", "hello {who}"]))
        .unwrap();
    let worker = env!("CARGO_BIN_EXE_datapipe-worker").to_string();
    let tm = TaskManager::new(open_queue(&dir, "forkexec").await, Arc::new(registry))
        .unwrap()
        .with_scheduler(fast(2))
        .with_provider(Arc::new(LocalProvider::new(vec![worker])));

    let future = tm
        .submit("greet", vec![], kwargs([("who", "world")]))
        .await
        .unwrap();
    tm.drain().await.unwrap();
    assert_eq!(future.out().await.unwrap(), "hello world");

    let record = tm.queue().get(future.task_id().unwrap()).await.unwrap();
    assert_eq!(record.state, TaskState::Succeeded);
    assert!(record.jobid.as_deref().unwrap_or("").starts_with("local-"));
}

#[tokio::test]
async fn failure_surfaces_and_retry_reruns() {
    let dir = TempDir::new().unwrap();
    let mut registry = AppRegistry::new();
    registry
        .register_native(AppSpec::native("flaky", "fn flaky() { raise }"), |_, _| {
            Err("deliberate failure".to_string())
        })
        .unwrap();
    let tm = TaskManager::new(open_queue(&dir, "retry").await, Arc::new(registry))
        .unwrap()
        .with_scheduler(fast(1));

    let future = tm.submit("flaky", vec![], BTreeMap::new()).await.unwrap();
    tm.drain().await.unwrap();

    match future.result().await {
        Err(EngineError::Failed(failed)) => {
            assert_eq!(failed.errno, ERRNO_APP);
            assert!(failed.err.contains("deliberate failure"));
        }
        other => panic!("expected TaskFailed, got {other:?}"),
    }

    // retry re-queues the same record; the unchanged code fails again
    tm.queue()
        .retry(TaskState::Failed, RetryMode::TerminalOnly)
        .await
        .unwrap();
    tm.drain().await.unwrap();
    assert!(future.result().await.is_err());

    // the fixed callable has a new fingerprint and runs to success
    let mut fixed = AppRegistry::new();
    fixed
        .register_native(AppSpec::native("flaky", "fn flaky() { ok }"), |_, _| {
            Ok(ArgValue::Str("recovered".to_string()))
        })
        .unwrap();
    let tm2 = TaskManager::new(open_queue(&dir, "retry").await, Arc::new(fixed))
        .unwrap()
        .with_scheduler(fast(1));
    let fixed_future = tm2.submit("flaky", vec![], BTreeMap::new()).await.unwrap();
    assert_ne!(fixed_future.fingerprint(), future.fingerprint());
    tm2.drain().await.unwrap();
    assert_eq!(
        fixed_future.result().await.unwrap(),
        ArgValue::Str("recovered".to_string())
    );
}

#[tokio::test]
async fn pause_blocks_dispatch_until_resume() {
    let dir = TempDir::new().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let tm = TaskManager::new(
        open_queue(&dir, "pause").await,
        pipeline_registry("fn fraction(seed) { p }", calls.clone()),
    )
    .unwrap()
    .with_scheduler(fast(2));

    for seed in 0..5 {
        tm.submit("fraction", vec![], kwargs([("seed", seed)]))
            .await
            .unwrap();
    }

    tm.queue().pause().await.unwrap();
    // a paused queue drains immediately without any RUNNING transition
    tm.drain().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let counts = tm.queue().counts().await.unwrap();
    assert_eq!(counts[&TaskState::Pending], 5);
    assert_eq!(counts[&TaskState::Running], 0);

    tm.queue().resume().await.unwrap();
    tm.drain().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(
        tm.queue().counts().await.unwrap()[&TaskState::Succeeded],
        5
    );
}

#[tokio::test]
async fn duplicate_fingerprint_runs_once() {
    let dir = TempDir::new().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let tm = TaskManager::new(
        open_queue(&dir, "dup").await,
        pipeline_registry("fn fraction(seed) { once }", calls.clone()),
    )
    .unwrap()
    .with_scheduler(fast(2));

    let first = tm
        .submit("fraction", vec![], kwargs([("seed", 7_i64)]))
        .await
        .unwrap();
    let second = tm
        .submit("fraction", vec![], kwargs([("seed", 7_i64)]))
        .await
        .unwrap();
    assert_eq!(first.task_id(), second.task_id());

    tm.drain().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        first.result().await.unwrap(),
        second.result().await.unwrap()
    );
}

#[tokio::test]
async fn bad_submissions_are_rejected() {
    let dir = TempDir::new().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let tm = TaskManager::new(
        open_queue(&dir, "errors").await,
        pipeline_registry("fn fraction(seed) { e }", calls),
    )
    .unwrap();

    // unknown app
    assert!(matches!(
        tm.submit("missing_app", vec![], BTreeMap::new()).await,
        Err(EngineError::Enqueue(_))
    ));

    // dangling future reference
    let dangling = ArgValue::Future(FutureRef {
        task_id: 4242,
        fingerprint: "nope".to_string(),
    });
    assert!(matches!(
        tm.submit("average", vec![ArgValue::List(vec![dangling])], BTreeMap::new())
            .await,
        Err(EngineError::Enqueue(_))
    ));
}

#[tokio::test]
async fn second_manager_is_refused() {
    let dir = TempDir::new().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let tm = TaskManager::new(
        open_queue(&dir, "solo").await,
        pipeline_registry("fn fraction(seed) { m }", calls),
    )
    .unwrap()
    .with_scheduler(fast(1));

    tm.submit("fraction", vec![], kwargs([("seed", 1_i64)]))
        .await
        .unwrap();

    tm.queue().acquire_manager_lock("someone-else").await.unwrap();
    match tm.drain().await {
        Err(EngineError::Storage(e)) => assert!(e.to_string().contains("already managed")),
        other => panic!("expected StoreUnavailable, got {other:?}"),
    }

    tm.queue().release_manager_lock("someone-else").await.unwrap();
    tm.drain().await.unwrap();
}
