#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use maestro_core::{
    ExecutionMode, FileStateStore, InMemoryMemoryStore, InMemoryMetrics, MaestroError,
    MaestroResult, SharedWorker, StateStore, Worker, WorkerInput, WorkerOutput,
};
use maestro_dispatch::{DispatchRequest, Dispatcher, DispatcherConfig};
use maestro_executor::{ExecuteRequest, ExecutionStatus, Executor, ExecutorConfig};
use maestro_registry::{DescriptorSpec, DescriptorStatus, Registry, RegistryConfig};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Echoes the payload and counts calls.
struct CountingWorker {
    calls: AtomicU32,
}

#[async_trait]
impl Worker for CountingWorker {
    async fn run(&self, input: WorkerInput) -> MaestroResult<WorkerOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(WorkerOutput::new(serde_json::json!({"echo": input.payload})).with_usage(10, 0.02))
    }
}

/// Sleeps for `payload.delay_ms`.
struct SlowWorker;

#[async_trait]
impl Worker for SlowWorker {
    async fn run(&self, input: WorkerInput) -> MaestroResult<WorkerOutput> {
        let ms = input.payload["delay_ms"].as_u64().unwrap_or(5_000);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(WorkerOutput::new(input.payload))
    }
}

struct FailingWorker;

#[async_trait]
impl Worker for FailingWorker {
    async fn run(&self, _input: WorkerInput) -> MaestroResult<WorkerOutput> {
        Err(MaestroError::Worker("model refused".into()))
    }
}

fn registry_with(name: &str, caps: &[&str], worker: Arc<dyn Worker>) -> Arc<Registry> {
    let registry = Arc::new(Registry::default());
    registry
        .register(
            DescriptorSpec::new(name, caps.iter().map(|c| c.to_string()).collect()),
            Arc::new(SharedWorker::new(worker)),
        )
        .unwrap();
    registry
}

#[tokio::test]
async fn test_identical_sync_executes_hit_cache() {
    let worker = Arc::new(CountingWorker {
        calls: AtomicU32::new(0),
    });
    let registry = registry_with("Writer", &["writing"], worker.clone());
    let executor = Arc::new(Executor::new(registry.clone(), ExecutorConfig::default()));

    let payload: serde_json::Value = serde_json::from_str(r#"{"topic":"rust","len":3}"#).unwrap();
    let reordered: serde_json::Value = serde_json::from_str(r#"{"len":3,"topic":"rust"}"#).unwrap();

    let first = executor
        .execute(ExecuteRequest::new("writer", "ws", "alice", payload))
        .await
        .unwrap()
        .into_result()
        .unwrap();
    let second = executor
        .execute(ExecuteRequest::new("writer", "ws", "alice", reordered))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert_eq!(first.status, ExecutionStatus::Completed);
    assert_eq!(first.output, second.output);
    assert_eq!(first.run_id, second.run_id);
    assert_eq!(first.created_at, second.created_at);
    assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
    assert_eq!(registry.instance_count("writer"), 0);

    let stats = executor.stats();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 1);
}

#[tokio::test]
async fn test_async_mode_skips_cache() {
    let worker = Arc::new(CountingWorker {
        calls: AtomicU32::new(0),
    });
    let registry = registry_with("Writer", &["writing"], worker.clone());
    let executor = Arc::new(Executor::new(registry, ExecutorConfig::default()));

    for _ in 0..2 {
        let outcome = executor
            .execute(
                ExecuteRequest::new("writer", "ws", "alice", serde_json::json!("same"))
                    .with_mode(ExecutionMode::Async),
            )
            .await
            .unwrap();
        let result = executor.wait(outcome.run_id()).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
    }
    assert_eq!(worker.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_timeout_is_terminal_and_releases_instance() {
    let registry = registry_with("Slow", &["writing"], Arc::new(SlowWorker));
    let executor = Arc::new(Executor::new(registry.clone(), ExecutorConfig::default()));

    let result = executor
        .execute(
            ExecuteRequest::new("slow", "ws", "u", serde_json::json!({"delay_ms": 5_000}))
                .with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Timeout);
    assert!(result.error.unwrap().contains("timed out"));
    assert_eq!(registry.instance_count("slow"), 0);
}

#[tokio::test]
async fn test_worker_failure_keeps_message() {
    let registry = registry_with("Flaky", &["writing"], Arc::new(FailingWorker));
    let executor = Arc::new(Executor::new(registry, ExecutorConfig::default()));
    let mut events = executor.subscribe();

    let result = executor
        .execute(ExecuteRequest::new("flaky", "ws", "u", serde_json::Value::Null))
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("model refused"));

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    assert_eq!(names, vec!["run_started", "run_failed"]);
}

#[tokio::test]
async fn test_cancel_is_immediate_and_final() {
    let registry = registry_with("Slow", &["writing"], Arc::new(SlowWorker));
    let executor = Arc::new(Executor::new(registry.clone(), ExecutorConfig::default()));

    let run_id = executor
        .execute(
            ExecuteRequest::new("slow", "ws", "u", serde_json::json!({"delay_ms": 10_000}))
                .with_mode(ExecutionMode::Async),
        )
        .await
        .unwrap()
        .run_id();

    assert!(executor.cancel_execution(run_id).await.unwrap());
    assert_eq!(
        executor.get_status(run_id).unwrap().status,
        ExecutionStatus::Cancelled
    );
    assert!(!executor.cancel_execution(run_id).await.unwrap());

    let result = executor.wait(run_id).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert_eq!(registry.instance_count("slow"), 0);

    let err = executor
        .cancel_execution(uuid::Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, MaestroError::NotFound(_)));
}

#[tokio::test]
async fn test_max_concurrent_runs() {
    let registry = registry_with("Slow", &["writing"], Arc::new(SlowWorker));
    let executor = Arc::new(Executor::new(
        registry,
        ExecutorConfig {
            max_concurrent_runs: 1,
            ..Default::default()
        },
    ));
    let running = executor
        .execute(
            ExecuteRequest::new("slow", "ws", "u", serde_json::json!({"delay_ms": 10_000}))
                .with_mode(ExecutionMode::Async),
        )
        .await
        .unwrap()
        .run_id();
    let err = executor
        .execute(
            ExecuteRequest::new("slow", "ws", "u", serde_json::json!({"delay_ms": 1}))
                .with_mode(ExecutionMode::Async),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MaestroError::Capacity(_)));
    executor.cancel_execution(running).await.unwrap();
}

#[tokio::test]
async fn test_dispatched_run_releases_slot_once() {
    let worker = Arc::new(CountingWorker {
        calls: AtomicU32::new(0),
    });
    let registry = registry_with("Writer", &["writing"], worker.clone());
    let dispatcher = Arc::new(Dispatcher::new(registry.clone(), DispatcherConfig::default()));
    let executor = Arc::new(
        Executor::new(registry.clone(), ExecutorConfig::default())
            .with_dispatcher(dispatcher.clone()),
    );

    for _ in 0..3 {
        let dispatch = dispatcher
            .dispatch(&DispatchRequest::new("writing", "ws", "u", serde_json::json!(1)))
            .unwrap();
        let result = executor
            .execute_dispatched(dispatch, serde_json::json!(1), serde_json::Value::Null, None)
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
    }

    assert_eq!(dispatcher.profile("writer").unwrap().current_load, 0);
    assert_eq!(dispatcher.stats().outstanding, 0);
    assert_eq!(registry.instance_count("writer"), 0);
}

#[tokio::test]
async fn test_identical_dispatched_runs_all_reach_the_worker() {
    let worker = Arc::new(CountingWorker {
        calls: AtomicU32::new(0),
    });
    let registry = registry_with("Writer", &["writing"], worker.clone());
    let dispatcher = Arc::new(Dispatcher::new(registry.clone(), DispatcherConfig::default()));
    let executor = Arc::new(
        Executor::new(registry, ExecutorConfig::default()).with_dispatcher(dispatcher.clone()),
    );

    let mut run_ids = Vec::new();
    for _ in 0..2 {
        let dispatch = dispatcher
            .dispatch(&DispatchRequest::new("writing", "ws", "u", serde_json::json!("same")))
            .unwrap();
        run_ids.push(
            executor
                .submit_dispatched(dispatch, serde_json::json!("same"), serde_json::Value::Null, None)
                .unwrap(),
        );
    }
    for run_id in &run_ids {
        let result = executor.wait(*run_id).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
    }
    assert_ne!(run_ids[0], run_ids[1]);
    assert_eq!(worker.calls.load(Ordering::SeqCst), 2);
    let stats = executor.stats();
    assert_eq!(stats.cache_hits, 0);
    assert_eq!(stats.cache_entries, 0);
}

#[tokio::test]
async fn test_long_run_keeps_agent_routable() {
    let registry = Arc::new(Registry::new(RegistryConfig {
        heartbeat_interval_secs: 1,
        ..Default::default()
    }));
    registry
        .register(
            DescriptorSpec::new("Slow", vec!["writing".into()]),
            Arc::new(SharedWorker::new(Arc::new(SlowWorker))),
        )
        .unwrap();
    let dispatcher = Arc::new(Dispatcher::new(registry.clone(), DispatcherConfig::default()));
    let executor = Arc::new(
        Executor::new(registry.clone(), ExecutorConfig::default())
            .with_dispatcher(dispatcher.clone()),
    );

    let payload = serde_json::json!({"delay_ms": 200});
    let dispatch = dispatcher
        .dispatch(&DispatchRequest::new("writing", "ws", "u", payload.clone()))
        .unwrap();
    let run_id = executor
        .submit_dispatched(dispatch, payload.clone(), serde_json::Value::Null, None)
        .unwrap();

    // Well past three heartbeat periods while the run is still going.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let later = chrono::Utc::now() + chrono::Duration::seconds(30);
    assert!(registry.check_heartbeats_at(later).is_empty());
    assert_eq!(
        registry.get_descriptor("slow").unwrap().status,
        DescriptorStatus::Active
    );

    let result = executor.wait(run_id).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(
        registry.get_descriptor("slow").unwrap().status,
        DescriptorStatus::Registered
    );
    assert!(registry.check_heartbeats_at(later).is_empty());

    let again = dispatcher
        .dispatch(&DispatchRequest::new("writing", "ws", "u", serde_json::json!({"delay_ms": 1})))
        .unwrap();
    let result = executor
        .execute_dispatched(again, serde_json::json!({"delay_ms": 1}), serde_json::Value::Null, None)
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_memory_state_and_metrics_collaborators() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(FileStateStore::new(dir.path().to_path_buf()).await.unwrap());
    let memory = Arc::new(InMemoryMemoryStore::new());
    let metrics = Arc::new(InMemoryMetrics::new());

    let worker = Arc::new(CountingWorker {
        calls: AtomicU32::new(0),
    });
    let registry = registry_with("Writer", &["writing"], worker);
    let executor = Arc::new(
        Executor::new(registry, ExecutorConfig::default())
            .with_state_store(state.clone())
            .with_memory(memory.clone())
            .with_metrics(metrics.clone()),
    );

    executor
        .execute(ExecuteRequest::new("writer", "acme", "u", serde_json::json!("hi")))
        .await
        .unwrap();

    assert!(state.list().await.unwrap().is_empty());
    assert_eq!(memory.count().await, 1);
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.executions, 1);
    assert_eq!(snapshot.tokens, 10);
}

#[tokio::test]
async fn test_retention_sweep_drops_old_results() {
    let worker = Arc::new(CountingWorker {
        calls: AtomicU32::new(0),
    });
    let registry = registry_with("Writer", &["writing"], worker);
    let executor = Arc::new(Executor::new(registry, ExecutorConfig::default()));
    let result = executor
        .execute(ExecuteRequest::new("writer", "ws", "u", serde_json::Value::Null))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert_eq!(executor.purge_finished_runs(), 0);
    let later = chrono::Utc::now() + chrono::Duration::hours(2);
    assert_eq!(executor.purge_finished_runs_at(later), 1);
    assert!(executor.get_status(result.run_id).is_none());
}

#[tokio::test]
async fn test_unknown_agent_is_not_found() {
    let registry = Arc::new(Registry::default());
    let executor = Arc::new(Executor::new(registry, ExecutorConfig::default()));
    let err = executor
        .execute(ExecuteRequest::new("ghost", "ws", "u", serde_json::Value::Null))
        .await
        .unwrap_err();
    assert!(matches!(err, MaestroError::NotFound(_)));
}
