#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use maestro_core::{
    MaestroError, MaestroResult, Priority, SharedWorker, Tier, Worker, WorkerFactory, WorkerInput,
    WorkerOutput,
};
use maestro_dispatch::{
    DispatchConstraints, DispatchOutcome, DispatchRequest, DispatchStrategy, Dispatcher,
    DispatcherConfig,
};
use maestro_registry::{DescriptorSpec, DescriptorStatus, Registry, RegistryConfig};
use std::collections::HashMap;
use std::sync::Arc;

struct Echo;

#[async_trait]
impl Worker for Echo {
    async fn run(&self, input: WorkerInput) -> MaestroResult<WorkerOutput> {
        Ok(WorkerOutput::new(input.payload))
    }
}

fn factory() -> Arc<dyn WorkerFactory> {
    Arc::new(SharedWorker::new(Arc::new(Echo)))
}

#[test]
fn test_writing_request_without_writer_fails_routing() {
    let registry = Arc::new(Registry::default());
    registry
        .register(DescriptorSpec::new("Researcher", vec!["research".into()]), factory())
        .unwrap();
    let dispatcher = Dispatcher::new(registry, DispatcherConfig::default());

    let err = dispatcher
        .dispatch(&DispatchRequest::new("writing", "ws", "u", serde_json::Value::Null))
        .unwrap_err();
    assert_eq!(err.kind(), "routing");
    assert!(err.to_string().contains("no available agents"));
}

#[test]
fn test_routing_overrides_from_config() {
    let registry = Arc::new(Registry::default());
    registry
        .register(DescriptorSpec::new("Triage", vec!["triage".into()]), factory())
        .unwrap();
    let mut routing = HashMap::new();
    routing.insert("support_ticket".to_string(), vec!["triage".to_string()]);
    let dispatcher = Dispatcher::new(
        registry,
        DispatcherConfig {
            routing,
            ..Default::default()
        },
    );
    let result = dispatcher
        .dispatch(&DispatchRequest::new("support_ticket", "ws", "u", serde_json::Value::Null))
        .unwrap();
    assert_eq!(result.agent_id, "triage");
    assert_eq!(result.metadata.required_capabilities, vec!["triage".to_string()]);
}

#[test]
fn test_tier_and_success_rate_constraints() {
    let registry = Arc::new(Registry::default());
    registry
        .register(
            DescriptorSpec::new("Basic Writer", vec!["writing".into()]).with_tier(Tier::Basic),
            factory(),
        )
        .unwrap();
    registry
        .register(
            DescriptorSpec::new("Premium Writer", vec!["writing".into()])
                .with_tier(Tier::Premium),
            factory(),
        )
        .unwrap();
    let dispatcher = Dispatcher::new(registry, DispatcherConfig::default());

    let premium_only = DispatchRequest::new("writing", "ws", "u", serde_json::Value::Null)
        .with_constraints(DispatchConstraints {
            required_tier: Some(Tier::Premium),
            ..Default::default()
        });
    let first = dispatcher.dispatch(&premium_only).unwrap();
    assert_eq!(first.agent_id, "premium-writer");

    // Two failures drag the premium writer's rolling success rate to 0.64.
    dispatcher.release(&first, &DispatchOutcome::failure(100));
    let second = dispatcher.dispatch(&premium_only).unwrap();
    dispatcher.release(&second, &DispatchOutcome::failure(100));

    let reliable = DispatchRequest::new("writing", "ws", "u", serde_json::Value::Null)
        .with_constraints(DispatchConstraints {
            min_success_rate: Some(0.9),
            ..Default::default()
        })
        .with_strategy(DispatchStrategy::PriorityBased)
        .with_priority(Priority::High);
    assert_eq!(dispatcher.dispatch(&reliable).unwrap().agent_id, "basic-writer");
}

#[test]
fn test_concurrent_dispatch_never_overcommits() {
    let registry = Arc::new(Registry::default());
    registry
        .register(
            DescriptorSpec::new("Writer", vec!["writing".into()])
                .with_max_concurrent(3)
                .with_max_instances(50),
            factory(),
        )
        .unwrap();
    let dispatcher = Arc::new(Dispatcher::new(registry, DispatcherConfig::default()));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let d = Arc::clone(&dispatcher);
            std::thread::spawn(move || {
                d.dispatch(&DispatchRequest::new("writing", "ws", "u", serde_json::Value::Null))
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let ok = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(ok, 3);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, MaestroError::Routing(_))));
    assert_eq!(dispatcher.profile("writer").unwrap().current_load, 3);
}

#[test]
fn test_slot_balance_after_release() {
    let registry = Arc::new(Registry::default());
    registry
        .register(DescriptorSpec::new("Writer", vec!["writing".into()]), factory())
        .unwrap();
    let dispatcher = Dispatcher::new(Arc::clone(&registry), DispatcherConfig::default());

    let results: Vec<_> = (0..4)
        .map(|_| {
            dispatcher
                .dispatch(&DispatchRequest::new("writing", "ws", "u", serde_json::Value::Null))
                .unwrap()
        })
        .collect();
    assert_eq!(dispatcher.stats().outstanding, 4);
    for r in &results {
        dispatcher.release(r, &DispatchOutcome::success(20));
        registry.destroy_instance(r.instance_id).unwrap();
    }
    assert_eq!(dispatcher.profile("writer").unwrap().current_load, 0);
    assert_eq!(dispatcher.stats().outstanding, 0);
    assert_eq!(dispatcher.reconcile(), 0);
}

#[test]
fn test_agent_routable_again_after_heartbeat() {
    let registry = Arc::new(Registry::new(RegistryConfig {
        heartbeat_interval_secs: 1,
        ..Default::default()
    }));
    let id = registry
        .register(DescriptorSpec::new("Writer", vec!["writing".into()]), factory())
        .unwrap();
    let dispatcher = Dispatcher::new(registry.clone(), DispatcherConfig::default());
    let request = DispatchRequest::new("writing", "ws", "u", serde_json::Value::Null);

    let first = dispatcher.dispatch(&request).unwrap();
    let later = chrono::Utc::now() + chrono::Duration::seconds(10);
    assert_eq!(registry.check_heartbeats_at(later), vec![id.clone()]);
    assert_eq!(
        registry.get_descriptor(&id).unwrap().status,
        DescriptorStatus::Inactive
    );
    let err = dispatcher.dispatch(&request).unwrap_err();
    assert_eq!(err.kind(), "routing");

    registry.heartbeat(&id).unwrap();
    assert_eq!(
        registry.get_descriptor(&id).unwrap().status,
        DescriptorStatus::Active
    );
    let second = dispatcher.dispatch(&request).unwrap();
    assert_eq!(second.agent_id, id);

    for result in [first, second] {
        registry.destroy_instance(result.instance_id).unwrap();
        assert!(dispatcher.release(&result, &DispatchOutcome::success(5)));
    }
    assert_eq!(
        registry.get_descriptor(&id).unwrap().status,
        DescriptorStatus::Registered
    );
}
