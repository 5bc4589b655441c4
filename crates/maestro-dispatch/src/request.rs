use chrono::{DateTime, Utc};
use maestro_core::{MaestroError, MaestroResult, Priority, Tier};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How the dispatcher picks among eligible agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStrategy {
    /// Per-request-type counter modulo the candidate count.
    RoundRobin,
    /// Lowest `load / max_concurrent`.
    #[default]
    LoadBalanced,
    /// Urgent favours latency, high favours success rate, otherwise least loaded.
    PriorityBased,
    /// Highest `matched × success × (1 − load_ratio)`.
    CapabilityMatch,
    /// Cheapest per call.
    CostOptimized,
}

impl DispatchStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchStrategy::RoundRobin => "round_robin",
            DispatchStrategy::LoadBalanced => "load_balanced",
            DispatchStrategy::PriorityBased => "priority_based",
            DispatchStrategy::CapabilityMatch => "capability_match",
            DispatchStrategy::CostOptimized => "cost_optimized",
        }
    }
}

impl std::fmt::Display for DispatchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional filters applied on top of capability, health and capacity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConstraints {
    pub max_cost: Option<f64>,
    pub max_latency_ms: Option<u64>,
    pub min_success_rate: Option<f64>,
    /// Minimum tier; higher tiers also qualify.
    pub required_tier: Option<Tier>,
    /// Nice-to-have capabilities. They raise the match score but never filter.
    pub preferred_capabilities: Vec<String>,
}

impl DispatchConstraints {
    fn validate(&self) -> MaestroResult<()> {
        if let Some(cost) = self.max_cost {
            if !cost.is_finite() || cost < 0.0 {
                return Err(MaestroError::Validation(
                    "max_cost must be a non-negative number".into(),
                ));
            }
        }
        if let Some(rate) = self.min_success_rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(MaestroError::Validation(
                    "min_success_rate must be within [0, 1]".into(),
                ));
            }
        }
        Ok(())
    }
}

/// A routing request. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub id: Uuid,
    /// Looked up in the routing table to find the required capabilities.
    pub request_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub workspace: String,
    pub user: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub strategy: DispatchStrategy,
    #[serde(default)]
    pub constraints: DispatchConstraints,
    /// Configuration for the instance created for this dispatch.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl DispatchRequest {
    pub fn new(
        request_type: impl Into<String>,
        workspace: impl Into<String>,
        user: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_type: request_type.into(),
            payload,
            workspace: workspace.into(),
            user: user.into(),
            priority: Priority::default(),
            strategy: DispatchStrategy::default(),
            constraints: DispatchConstraints::default(),
            config: serde_json::Value::Null,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_strategy(mut self, strategy: DispatchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_constraints(mut self, constraints: DispatchConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub(crate) fn validate(&self) -> MaestroResult<()> {
        if self.request_type.trim().is_empty() {
            return Err(MaestroError::Validation("request type must not be empty".into()));
        }
        if self.workspace.trim().is_empty() {
            return Err(MaestroError::Validation("workspace must not be empty".into()));
        }
        if self.user.trim().is_empty() {
            return Err(MaestroError::Validation("user must not be empty".into()));
        }
        self.constraints.validate()
    }
}

/// Why a candidate was chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingMetadata {
    pub required_capabilities: Vec<String>,
    /// Number of agents that passed the filters.
    pub candidates: usize,
    /// Load of the chosen agent before this dispatch.
    pub load_before: u32,
    pub max_concurrent: u32,
    pub match_ratio: f64,
}

/// The outcome of a successful dispatch. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResult {
    /// Identifies this dispatch for slot release.
    pub dispatch_id: Uuid,
    pub request_id: Uuid,
    pub request_type: String,
    pub agent_id: String,
    /// Instance created for this dispatch.
    pub instance_id: Uuid,
    pub workspace: String,
    pub user: String,
    pub strategy: DispatchStrategy,
    pub priority: Priority,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub metadata: RoutingMetadata,
    pub dispatched_at: DateTime<Utc>,
}

/// How the dispatched work went, reported when the slot is released.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub success: bool,
    pub latency_ms: u64,
}

impl DispatchOutcome {
    pub fn success(latency_ms: u64) -> Self {
        Self {
            success: true,
            latency_ms,
        }
    }

    pub fn failure(latency_ms: u64) -> Self {
        Self {
            success: false,
            latency_ms,
        }
    }
}
