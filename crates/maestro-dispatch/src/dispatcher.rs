use crate::profile::CapabilityProfile;
use crate::request::{
    DispatchOutcome, DispatchRequest, DispatchResult, DispatchStrategy, RoutingMetadata,
};
use crate::routing::RoutingTable;
use crate::strategy::{self, Selection};
use chrono::{DateTime, Utc};
use maestro_core::{DispatchRecord, MaestroError, MaestroResult, MetricsSink, NoopMetrics};
use maestro_registry::Registry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Dispatcher tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Number of recent decisions kept for statistics.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Period of the load reconciliation sweep.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// Extra or replacement entries for the routing table.
    #[serde(default)]
    pub routing: HashMap<String, Vec<String>>,
}

fn default_history_limit() -> usize {
    1_000
}

fn default_reconcile_interval_secs() -> u64 {
    30
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            routing: HashMap::new(),
        }
    }
}

/// One past decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchHistoryEntry {
    pub dispatch_id: Uuid,
    pub request_type: String,
    pub agent_id: String,
    pub strategy: DispatchStrategy,
    pub confidence: f64,
    pub at: DateTime<Utc>,
}

/// Aggregate dispatch statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatcherStats {
    pub total_dispatches: u64,
    pub routing_failures: u64,
    /// Dispatched but not yet released.
    pub outstanding: usize,
    /// Over the retained history.
    pub by_agent: HashMap<String, u64>,
    /// Over the retained history.
    pub by_strategy: HashMap<String, u64>,
    pub average_confidence: f64,
}

#[derive(Default)]
struct DispatchState {
    profiles: HashMap<String, CapabilityProfile>,
    round_robin: HashMap<String, usize>,
    /// dispatch id → agent id
    outstanding: HashMap<Uuid, String>,
    history: VecDeque<DispatchHistoryEntry>,
    total_dispatches: u64,
    routing_failures: u64,
}

impl DispatchState {
    /// Bring static profile fields in line with the registry.
    fn sync_profiles(&mut self, registry: &Registry) {
        let descriptors = registry.list_descriptors();
        let live: HashSet<&str> = descriptors.iter().map(|d| d.id.as_str()).collect();
        self.profiles.retain(|id, _| live.contains(id.as_str()));
        for descriptor in &descriptors {
            self.profiles
                .entry(descriptor.id.clone())
                .and_modify(|p| p.refresh(descriptor))
                .or_insert_with(|| CapabilityProfile::from_descriptor(descriptor));
        }
    }
}

/// Routes requests to agent types and hands out borrowed capacity slots.
///
/// Validation, filtering, selection and the load increment happen inside one
/// critical section, so concurrent dispatches never over-commit an agent.
pub struct Dispatcher {
    registry: Arc<Registry>,
    routing: RoutingTable,
    config: DispatcherConfig,
    metrics: Arc<dyn MetricsSink>,
    state: Mutex<DispatchState>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, config: DispatcherConfig) -> Self {
        let mut routing = RoutingTable::with_defaults();
        routing.extend(&config.routing);
        Self {
            registry,
            routing,
            config,
            metrics: Arc::new(NoopMetrics),
            state: Mutex::new(DispatchState::default()),
            reconciler: Mutex::new(None),
        }
    }

    /// Set the metrics collaborator.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Replace the routing table.
    pub fn with_routing(mut self, routing: RoutingTable) -> Self {
        self.routing = routing;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    /// Pick an agent for `request`, create its instance and take one load slot.
    ///
    /// The slot is held until [`release`](Self::release) is called with the
    /// returned result.
    pub fn dispatch(&self, request: &DispatchRequest) -> MaestroResult<DispatchResult> {
        request.validate()?;
        let required = self.routing.resolve(&request.request_type);
        let preferred = &request.constraints.preferred_capabilities;
        let selection = Selection {
            strategy: request.strategy,
            priority: request.priority,
            required: &required,
            preferred,
        };

        let mut state = self.state.lock();
        state.sync_profiles(&self.registry);
        let counts = self.registry.instance_counts();

        let mut candidates: Vec<&CapabilityProfile> = state
            .profiles
            .values()
            .filter(|p| {
                p.has_capabilities(&required)
                    && p.healthy
                    && p.has_capacity()
                    && counts.get(&p.agent_id).copied().unwrap_or(0) < p.max_instances
                    && p.satisfies(&request.constraints)
            })
            .collect();
        candidates.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

        if candidates.is_empty() {
            state.routing_failures += 1;
            warn!(
                request_type = %request.request_type,
                required = ?required,
                "No available agents"
            );
            return Err(MaestroError::Routing(format!(
                "no available agents for request type '{}'",
                request.request_type
            )));
        }
        let candidate_count = candidates.len();

        let counter = state
            .round_robin
            .get(&request.request_type)
            .copied()
            .unwrap_or(0);
        let mut next_counter = counter;
        let chosen = candidates[strategy::select(&selection, &candidates, &mut next_counter)];
        let agent_id = chosen.agent_id.clone();
        let confidence = strategy::confidence(chosen, &selection);
        let metadata = RoutingMetadata {
            required_capabilities: required.clone(),
            candidates: candidate_count,
            load_before: chosen.current_load,
            max_concurrent: chosen.max_concurrent,
            match_ratio: chosen.match_ratio(&required, preferred),
        };

        let instance_id = self.registry.create_instance(
            &agent_id,
            &request.workspace,
            &request.user,
            request.config.clone(),
        )?;

        if request.strategy == DispatchStrategy::RoundRobin {
            state
                .round_robin
                .insert(request.request_type.clone(), next_counter);
        }

        let now = Utc::now();
        if let Some(profile) = state.profiles.get_mut(&agent_id) {
            profile.current_load += 1;
            profile.total_dispatches += 1;
            profile.last_dispatch = Some(now);
        }

        let result = DispatchResult {
            dispatch_id: Uuid::new_v4(),
            request_id: request.id,
            request_type: request.request_type.clone(),
            agent_id: agent_id.clone(),
            instance_id,
            workspace: request.workspace.clone(),
            user: request.user.clone(),
            strategy: request.strategy,
            priority: request.priority,
            confidence,
            metadata,
            dispatched_at: now,
        };

        state
            .outstanding
            .insert(result.dispatch_id, agent_id.clone());
        state.total_dispatches += 1;
        state.history.push_back(DispatchHistoryEntry {
            dispatch_id: result.dispatch_id,
            request_type: result.request_type.clone(),
            agent_id: agent_id.clone(),
            strategy: result.strategy,
            confidence,
            at: now,
        });
        while state.history.len() > self.config.history_limit {
            state.history.pop_front();
        }
        drop(state);

        self.metrics.record_dispatch(&DispatchRecord {
            request_id: request.id,
            request_type: request.request_type.clone(),
            agent_id: agent_id.clone(),
            instance_id,
            strategy: request.strategy.to_string(),
            confidence,
        });
        info!(
            request_type = %request.request_type,
            agent = %agent_id,
            instance = %instance_id,
            strategy = %request.strategy,
            confidence,
            "Dispatched"
        );
        Ok(result)
    }

    /// Return the slot taken by `result`. Only the first call per dispatch has
    /// any effect; later calls return `false`.
    pub fn release(&self, result: &DispatchResult, outcome: &DispatchOutcome) -> bool {
        let mut state = self.state.lock();
        let Some(agent_id) = state.outstanding.remove(&result.dispatch_id) else {
            return false;
        };
        if let Some(profile) = state.profiles.get_mut(&agent_id) {
            profile.current_load = profile.current_load.saturating_sub(1);
            profile.record_outcome(outcome);
        }
        debug!(
            agent = %agent_id,
            dispatch = %result.dispatch_id,
            success = outcome.success,
            latency_ms = outcome.latency_ms,
            "Dispatch slot released"
        );
        true
    }

    /// Reset every profile's load to the registry's live instance count.
    /// Returns the number of profiles whose load changed.
    pub fn reconcile(&self) -> usize {
        let mut state = self.state.lock();
        state.sync_profiles(&self.registry);
        let counts = self.registry.instance_counts();
        let mut changed = 0;
        for profile in state.profiles.values_mut() {
            let live = counts.get(&profile.agent_id).copied().unwrap_or(0);
            let live = u32::try_from(live).unwrap_or(u32::MAX);
            if profile.current_load != live {
                debug!(
                    agent = %profile.agent_id,
                    from = profile.current_load,
                    to = live,
                    "Reconciled load"
                );
                profile.current_load = live;
                changed += 1;
            }
        }
        let live_agents: HashSet<String> = state.profiles.keys().cloned().collect();
        state
            .outstanding
            .retain(|_, agent| live_agents.contains(agent));
        changed
    }

    /// Snapshot of all profiles, ordered by agent id.
    pub fn profiles(&self) -> Vec<CapabilityProfile> {
        let mut state = self.state.lock();
        state.sync_profiles(&self.registry);
        let mut out: Vec<CapabilityProfile> = state.profiles.values().cloned().collect();
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }

    pub fn profile(&self, agent_id: &str) -> Option<CapabilityProfile> {
        self.state.lock().profiles.get(agent_id).cloned()
    }

    /// The most recent decisions, newest last.
    pub fn history(&self, limit: usize) -> Vec<DispatchHistoryEntry> {
        let state = self.state.lock();
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self) -> DispatcherStats {
        let state = self.state.lock();
        let mut stats = DispatcherStats {
            total_dispatches: state.total_dispatches,
            routing_failures: state.routing_failures,
            outstanding: state.outstanding.len(),
            ..Default::default()
        };
        let mut confidence_sum = 0.0;
        for entry in &state.history {
            *stats.by_agent.entry(entry.agent_id.clone()).or_insert(0) += 1;
            *stats
                .by_strategy
                .entry(entry.strategy.to_string())
                .or_insert(0) += 1;
            confidence_sum += entry.confidence;
        }
        if !state.history.is_empty() {
            stats.average_confidence = confidence_sum / state.history.len() as f64;
        }
        stats
    }

    /// Start the reconciliation sweep. Calling twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut reconciler = self.reconciler.lock();
        if reconciler.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let period = Duration::from_secs(self.config.reconcile_interval_secs.max(1));
        *reconciler = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(dispatcher) = weak.upgrade() else {
                    break;
                };
                let changed = dispatcher.reconcile();
                if changed > 0 {
                    debug!(changed, "Dispatcher reconciliation finished");
                }
            }
        }));
        info!(period_secs = period.as_secs(), "Dispatcher reconciliation started");
    }

    pub fn stop(&self) {
        if let Some(handle) = self.reconciler.lock().take() {
            handle.abort();
            info!("Dispatcher reconciliation stopped");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use maestro_core::{
        InMemoryMetrics, Priority, SharedWorker, Worker, WorkerFactory, WorkerInput, WorkerOutput,
    };
    use maestro_registry::{DescriptorSpec, DescriptorStatus};

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

    fn setup(specs: Vec<DescriptorSpec>) -> Dispatcher {
        let registry = Arc::new(Registry::default());
        for spec in specs {
            registry.register(spec, factory()).unwrap();
        }
        Dispatcher::new(registry, DispatcherConfig::default())
    }

    fn request(kind: &str) -> DispatchRequest {
        DispatchRequest::new(kind, "ws", "alice", serde_json::json!({"q": 1}))
    }

    #[test]
    fn test_no_capable_agent_is_routing_error() {
        let dispatcher = setup(vec![DescriptorSpec::new("Researcher", vec!["research".into()])]);
        let err = dispatcher.dispatch(&request("writing")).unwrap_err();
        assert!(matches!(err, MaestroError::Routing(_)));
        assert_eq!(dispatcher.stats().routing_failures, 1);
    }

    #[test]
    fn test_dispatch_takes_slot_and_creates_instance() {
        let dispatcher = setup(vec![DescriptorSpec::new("Writer", vec!["writing".into()])]);
        let result = dispatcher.dispatch(&request("writing")).unwrap();
        assert_eq!(result.agent_id, "writer");
        assert!(dispatcher.registry().get_instance(result.instance_id).is_some());
        assert_eq!(dispatcher.profile("writer").unwrap().current_load, 1);
        assert!(result.confidence > 0.0 && result.confidence <= 1.0);

        assert!(dispatcher.release(&result, &DispatchOutcome::success(10)));
        assert!(!dispatcher.release(&result, &DispatchOutcome::success(10)));
        assert_eq!(dispatcher.profile("writer").unwrap().current_load, 0);
    }

    #[test]
    fn test_max_concurrent_filters_saturated_agent() {
        let dispatcher = setup(vec![
            DescriptorSpec::new("Writer", vec!["writing".into()]).with_max_concurrent(1)
        ]);
        let first = dispatcher.dispatch(&request("writing")).unwrap();
        let err = dispatcher.dispatch(&request("writing")).unwrap_err();
        assert!(matches!(err, MaestroError::Routing(_)));

        dispatcher.release(&first, &DispatchOutcome::success(5));
        assert!(dispatcher.dispatch(&request("writing")).is_ok());
    }

    #[test]
    fn test_unhealthy_agent_is_skipped() {
        let dispatcher = setup(vec![DescriptorSpec::new("Writer", vec!["writing".into()])]);
        dispatcher
            .registry()
            .set_status("writer", DescriptorStatus::Disabled)
            .unwrap();
        assert!(matches!(
            dispatcher.dispatch(&request("writing")),
            Err(MaestroError::Routing(_))
        ));
    }

    #[test]
    fn test_round_robin_is_per_request_type() {
        let dispatcher = setup(vec![
            DescriptorSpec::new("A", vec!["writing".into()]),
            DescriptorSpec::new("B", vec!["writing".into()]),
        ]);
        let rr = |kind: &str| request(kind).with_strategy(DispatchStrategy::RoundRobin);
        let picks: Vec<String> = (0..3)
            .map(|_| dispatcher.dispatch(&rr("writing")).unwrap().agent_id)
            .collect();
        assert_eq!(picks, vec!["a", "b", "a"]);
    }

    #[test]
    fn test_cost_constraint_and_strategy() {
        let dispatcher = setup(vec![
            DescriptorSpec::new("Cheap", vec!["writing".into()]).with_cost(0.1),
            DescriptorSpec::new("Pricey", vec!["writing".into()]).with_cost(2.0),
        ]);
        let req = request("writing").with_strategy(DispatchStrategy::CostOptimized);
        assert_eq!(dispatcher.dispatch(&req).unwrap().agent_id, "cheap");

        let capped = request("writing").with_constraints(crate::DispatchConstraints {
            max_cost: Some(0.05),
            ..Default::default()
        });
        assert!(dispatcher.dispatch(&capped).is_err());
    }

    #[test]
    fn test_history_is_bounded() {
        let registry = Arc::new(Registry::default());
        registry
            .register(
                DescriptorSpec::new("Writer", vec!["writing".into()])
                    .with_max_concurrent(100)
                    .with_max_instances(100),
                factory(),
            )
            .unwrap();
        let dispatcher = Dispatcher::new(
            registry,
            DispatcherConfig {
                history_limit: 3,
                ..Default::default()
            },
        );
        for _ in 0..5 {
            dispatcher.dispatch(&request("writing")).unwrap();
        }
        assert_eq!(dispatcher.history(10).len(), 3);
        let stats = dispatcher.stats();
        assert_eq!(stats.total_dispatches, 5);
        assert_eq!(stats.by_agent.get("writer"), Some(&3));
        assert_eq!(stats.outstanding, 5);
    }

    #[test]
    fn test_reconcile_matches_registry() {
        let dispatcher = setup(vec![DescriptorSpec::new("Writer", vec!["writing".into()])]);
        let result = dispatcher.dispatch(&request("writing")).unwrap();
        dispatcher
            .registry()
            .destroy_instance(result.instance_id)
            .unwrap();
        assert_eq!(dispatcher.reconcile(), 1);
        assert_eq!(dispatcher.profile("writer").unwrap().current_load, 0);
    }

    #[test]
    fn test_metrics_recorded() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let dispatcher = setup(vec![DescriptorSpec::new("Writer", vec!["writing".into()])])
            .with_metrics(metrics.clone());
        dispatcher
            .dispatch(&request("writing").with_priority(Priority::Urgent))
            .unwrap();
        assert_eq!(metrics.snapshot().dispatches, 1);
    }
}
