use crate::profile::CapabilityProfile;
use crate::request::DispatchStrategy;
use maestro_core::Priority;

/// Inputs shared by every strategy.
pub(crate) struct Selection<'a> {
    pub strategy: DispatchStrategy,
    pub priority: Priority,
    pub required: &'a [String],
    pub preferred: &'a [String],
}

/// Pick one candidate and return its index. `candidates` must be non-empty and
/// in a stable order; ties resolve to the earliest candidate.
pub(crate) fn select(
    selection: &Selection<'_>,
    candidates: &[&CapabilityProfile],
    round_robin: &mut usize,
) -> usize {
    debug_assert!(!candidates.is_empty());
    match selection.strategy {
        DispatchStrategy::RoundRobin => {
            let idx = *round_robin % candidates.len();
            *round_robin = round_robin.wrapping_add(1);
            idx
        }
        DispatchStrategy::LoadBalanced => argmin(candidates, |p| p.load_ratio()),
        DispatchStrategy::PriorityBased => match selection.priority {
            Priority::Urgent => argmin(candidates, |p| p.avg_latency_ms),
            Priority::High => argmin(candidates, |p| -p.success_rate),
            Priority::Normal | Priority::Low => {
                let mut best = 0;
                for (i, p) in candidates.iter().enumerate().skip(1) {
                    let b = candidates[best];
                    let better = p.current_load < b.current_load
                        || (p.current_load == b.current_load
                            && p.avg_latency_ms < b.avg_latency_ms);
                    if better {
                        best = i;
                    }
                }
                best
            }
        },
        DispatchStrategy::CapabilityMatch => argmin(candidates, |p| {
            let matched = p.matched(selection.required, selection.preferred) as f64;
            -(matched * p.success_rate * (1.0 - p.load_ratio()))
        }),
        DispatchStrategy::CostOptimized => argmin(candidates, |p| p.cost_per_call),
    }
}

fn argmin<F>(candidates: &[&CapabilityProfile], key: F) -> usize
where
    F: Fn(&CapabilityProfile) -> f64,
{
    let mut best = 0;
    let mut best_key = key(candidates[0]);
    for (i, p) in candidates.iter().enumerate().skip(1) {
        let k = key(p);
        if k < best_key {
            best = i;
            best_key = k;
        }
    }
    best
}

/// `success × (1 − load_ratio) × match_ratio × priority multiplier`, clamped to `[0, 1]`.
pub(crate) fn confidence(profile: &CapabilityProfile, selection: &Selection<'_>) -> f64 {
    let score = profile.success_rate
        * (1.0 - profile.load_ratio())
        * profile.match_ratio(selection.required, selection.preferred)
        * selection.priority.confidence_multiplier();
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::Tier;

    fn profile(id: &str, load: u32, latency: f64, success: f64, cost: f64) -> CapabilityProfile {
        CapabilityProfile {
            agent_id: id.into(),
            capabilities: vec!["writing".into()],
            tier: Tier::Standard,
            max_concurrent: 4,
            max_instances: 10,
            cost_per_call: cost,
            current_load: load,
            avg_latency_ms: latency,
            success_rate: success,
            healthy: true,
            total_dispatches: 0,
            last_dispatch: None,
        }
    }

    fn selection(strategy: DispatchStrategy, priority: Priority) -> Selection<'static> {
        Selection {
            strategy,
            priority,
            required: &[],
            preferred: &[],
        }
    }

    #[test]
    fn test_round_robin_cycles() {
        let a = profile("a", 0, 100.0, 1.0, 1.0);
        let b = profile("b", 0, 100.0, 1.0, 1.0);
        let candidates = vec![&a, &b];
        let sel = selection(DispatchStrategy::RoundRobin, Priority::Normal);
        let mut counter = 0;
        let picks: Vec<usize> = (0..4).map(|_| select(&sel, &candidates, &mut counter)).collect();
        assert_eq!(picks, vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_load_balanced_picks_least_loaded() {
        let a = profile("a", 3, 100.0, 1.0, 1.0);
        let b = profile("b", 1, 100.0, 1.0, 1.0);
        let sel = selection(DispatchStrategy::LoadBalanced, Priority::Normal);
        assert_eq!(select(&sel, &[&a, &b], &mut 0), 1);
    }

    #[test]
    fn test_priority_based() {
        let fast = profile("fast", 2, 50.0, 0.7, 1.0);
        let reliable = profile("reliable", 2, 500.0, 0.99, 1.0);
        let idle = profile("idle", 0, 900.0, 0.8, 1.0);
        let candidates = vec![&fast, &reliable, &idle];

        let urgent = selection(DispatchStrategy::PriorityBased, Priority::Urgent);
        assert_eq!(select(&urgent, &candidates, &mut 0), 0);
        let high = selection(DispatchStrategy::PriorityBased, Priority::High);
        assert_eq!(select(&high, &candidates, &mut 0), 1);
        let normal = selection(DispatchStrategy::PriorityBased, Priority::Normal);
        assert_eq!(select(&normal, &candidates, &mut 0), 2);
    }

    #[test]
    fn test_cost_optimized() {
        let a = profile("a", 0, 100.0, 1.0, 0.3);
        let b = profile("b", 0, 100.0, 1.0, 0.1);
        let sel = selection(DispatchStrategy::CostOptimized, Priority::Normal);
        assert_eq!(select(&sel, &[&a, &b], &mut 0), 1);
    }

    #[test]
    fn test_capability_match_all_zero_tie_takes_first() {
        let a = profile("a", 4, 100.0, 1.0, 1.0);
        let b = profile("b", 4, 100.0, 1.0, 1.0);
        let sel = selection(DispatchStrategy::CapabilityMatch, Priority::Normal);
        assert_eq!(select(&sel, &[&a, &b], &mut 0), 0);
    }

    #[test]
    fn test_capability_match_prefers_extra_capabilities() {
        let plain = profile("plain", 0, 100.0, 1.0, 1.0);
        let mut rich = profile("rich", 0, 100.0, 1.0, 1.0);
        rich.capabilities = vec!["editing".into(), "writing".into()];
        let required = vec!["writing".to_string()];
        let preferred = vec!["editing".to_string()];
        let sel = Selection {
            strategy: DispatchStrategy::CapabilityMatch,
            priority: Priority::Normal,
            required: &required,
            preferred: &preferred,
        };
        assert_eq!(select(&sel, &[&plain, &rich], &mut 0), 1);
    }

    #[test]
    fn test_confidence_is_clamped_product() {
        let p = profile("a", 1, 100.0, 0.8, 1.0);
        let sel = selection(DispatchStrategy::LoadBalanced, Priority::High);
        let c = confidence(&p, &sel);
        assert!((c - 0.8 * 0.75).abs() < 1e-9);

        let low = selection(DispatchStrategy::LoadBalanced, Priority::Low);
        assert!(confidence(&p, &low) < c);
    }
}
