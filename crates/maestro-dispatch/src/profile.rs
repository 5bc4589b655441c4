use crate::request::{DispatchConstraints, DispatchOutcome};
use chrono::{DateTime, Utc};
use maestro_core::Tier;
use maestro_registry::AgentDescriptor;
use serde::{Deserialize, Serialize};

/// Weight of the newest observation in the rolling averages.
const EMA_ALPHA: f64 = 0.2;

/// Dispatcher-local routing view of one agent type.
///
/// Static fields are refreshed from the registry on every dispatch; load and
/// the rolling averages are owned by the dispatcher and can be rebuilt with
/// [`Dispatcher::reconcile`](crate::Dispatcher::reconcile).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityProfile {
    pub agent_id: String,
    pub capabilities: Vec<String>,
    pub tier: Tier,
    pub max_concurrent: u32,
    pub max_instances: usize,
    pub cost_per_call: f64,
    /// Outstanding dispatches.
    pub current_load: u32,
    pub avg_latency_ms: f64,
    /// Rolling success rate in `[0, 1]`.
    pub success_rate: f64,
    pub healthy: bool,
    pub total_dispatches: u64,
    pub last_dispatch: Option<DateTime<Utc>>,
}

impl CapabilityProfile {
    pub fn from_descriptor(descriptor: &AgentDescriptor) -> Self {
        Self {
            agent_id: descriptor.id.clone(),
            capabilities: descriptor.capabilities.clone(),
            tier: descriptor.tier,
            max_concurrent: descriptor.max_concurrent,
            max_instances: descriptor.max_instances,
            cost_per_call: descriptor.cost_per_call,
            current_load: 0,
            avg_latency_ms: descriptor.expected_latency_ms as f64,
            success_rate: 1.0,
            healthy: descriptor.status.is_healthy(),
            total_dispatches: 0,
            last_dispatch: None,
        }
    }

    /// Pick up descriptor changes, keeping load and rolling stats.
    pub(crate) fn refresh(&mut self, descriptor: &AgentDescriptor) {
        self.capabilities.clone_from(&descriptor.capabilities);
        self.tier = descriptor.tier;
        self.max_concurrent = descriptor.max_concurrent;
        self.max_instances = descriptor.max_instances;
        self.cost_per_call = descriptor.cost_per_call;
        self.healthy = descriptor.status.is_healthy();
    }

    pub fn load_ratio(&self) -> f64 {
        if self.max_concurrent == 0 {
            return 1.0;
        }
        (f64::from(self.current_load) / f64::from(self.max_concurrent)).min(1.0)
    }

    pub fn has_capacity(&self) -> bool {
        self.current_load < self.max_concurrent
    }

    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required
            .iter()
            .all(|c| self.capabilities.binary_search(c).is_ok())
    }

    pub fn satisfies(&self, constraints: &DispatchConstraints) -> bool {
        if let Some(max) = constraints.max_cost {
            if self.cost_per_call > max {
                return false;
            }
        }
        if let Some(max) = constraints.max_latency_ms {
            if self.avg_latency_ms > max as f64 {
                return false;
            }
        }
        if let Some(min) = constraints.min_success_rate {
            if self.success_rate < min {
                return false;
            }
        }
        if let Some(tier) = constraints.required_tier {
            if self.tier < tier {
                return false;
            }
        }
        true
    }

    /// Number of required plus preferred capabilities this agent declares.
    pub fn matched(&self, required: &[String], preferred: &[String]) -> usize {
        required
            .iter()
            .chain(preferred)
            .filter(|c| self.capabilities.binary_search(c).is_ok())
            .count()
    }

    /// `matched / (required + preferred)`, or 1 when nothing is asked for.
    pub fn match_ratio(&self, required: &[String], preferred: &[String]) -> f64 {
        let wanted = required.len() + preferred.len();
        if wanted == 0 {
            return 1.0;
        }
        self.matched(required, preferred) as f64 / wanted as f64
    }

    /// Fold a finished run into the rolling averages.
    pub(crate) fn record_outcome(&mut self, outcome: &DispatchOutcome) {
        let observed = if outcome.success { 1.0 } else { 0.0 };
        self.success_rate = (1.0 - EMA_ALPHA) * self.success_rate + EMA_ALPHA * observed;
        self.avg_latency_ms =
            (1.0 - EMA_ALPHA) * self.avg_latency_ms + EMA_ALPHA * outcome.latency_ms as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_registry::DescriptorSpec;

    fn profile() -> CapabilityProfile {
        let spec = DescriptorSpec::new("Writer", vec!["writing".into(), "editing".into()])
            .with_cost(0.5)
            .with_latency(200)
            .with_max_concurrent(4);
        let mut caps = spec.capabilities.clone();
        caps.sort();
        CapabilityProfile {
            agent_id: "writer".into(),
            capabilities: caps,
            tier: spec.tier,
            max_concurrent: spec.max_concurrent,
            max_instances: spec.max_instances,
            cost_per_call: spec.cost_per_call,
            current_load: 0,
            avg_latency_ms: spec.expected_latency_ms as f64,
            success_rate: 1.0,
            healthy: true,
            total_dispatches: 0,
            last_dispatch: None,
        }
    }

    #[test]
    fn test_load_ratio_and_capacity() {
        let mut p = profile();
        assert_eq!(p.load_ratio(), 0.0);
        p.current_load = 2;
        assert!((p.load_ratio() - 0.5).abs() < f64::EPSILON);
        p.current_load = 4;
        assert!(!p.has_capacity());
    }

    #[test]
    fn test_constraints() {
        let p = profile();
        assert!(p.satisfies(&DispatchConstraints::default()));
        assert!(!p.satisfies(&DispatchConstraints {
            max_cost: Some(0.1),
            ..Default::default()
        }));
        assert!(!p.satisfies(&DispatchConstraints {
            max_latency_ms: Some(100),
            ..Default::default()
        }));
        assert!(!p.satisfies(&DispatchConstraints {
            required_tier: Some(Tier::Premium),
            ..Default::default()
        }));
        assert!(p.satisfies(&DispatchConstraints {
            required_tier: Some(Tier::Basic),
            ..Default::default()
        }));
    }

    #[test]
    fn test_match_ratio_counts_preferred() {
        let p = profile();
        let required = vec!["writing".to_string()];
        assert_eq!(p.match_ratio(&required, &[]), 1.0);
        let preferred = vec!["editing".to_string(), "research".to_string()];
        assert_eq!(p.matched(&required, &preferred), 2);
        assert!((p.match_ratio(&required, &preferred) - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_record_outcome_ema() {
        let mut p = profile();
        p.record_outcome(&DispatchOutcome::failure(1200));
        assert!((p.success_rate - 0.8).abs() < 1e-9);
        assert!((p.avg_latency_ms - 400.0).abs() < 1e-9);
    }
}
