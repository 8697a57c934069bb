//! Load-balancing policies. The set is closed at compile time; the MAB
//! agent swaps between members at runtime.

use std::fmt::Display;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::seq::SliceRandom;

use edgerun_common::{Coordinates, StatusInformation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PolicyKind {
    #[default]
    Random,
    RoundRobin,
    WeightedRoundRobin,
    LeastLoaded,
    NearestTarget,
}

pub const POLICY_SET: [PolicyKind; 5] = [
    PolicyKind::Random,
    PolicyKind::RoundRobin,
    PolicyKind::WeightedRoundRobin,
    PolicyKind::LeastLoaded,
    PolicyKind::NearestTarget,
];

impl Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PolicyKind::Random => "random",
            PolicyKind::RoundRobin => "round-robin",
            PolicyKind::WeightedRoundRobin => "weighted-round-robin",
            PolicyKind::LeastLoaded => "least-loaded",
            PolicyKind::NearestTarget => "nearest-target",
        };
        f.write_str(name)
    }
}

/// A backend node URL with its most recent status snapshot.
#[derive(Debug, Clone)]
pub struct Target {
    pub url: String,
    pub status: Option<StatusInformation>,
}

impl Target {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: None,
        }
    }
}

/// One operation: pick a backend for the named function.
pub trait LbPolicy: Send + Sync {
    fn select_target(&self, fun_name: &str, targets: &[Target]) -> Option<String>;
}

pub fn build_policy(kind: PolicyKind, origin: Coordinates) -> Box<dyn LbPolicy> {
    match kind {
        PolicyKind::Random => Box::new(Random),
        PolicyKind::RoundRobin => Box::new(RoundRobin::default()),
        PolicyKind::WeightedRoundRobin => Box::new(WeightedRoundRobin::default()),
        PolicyKind::LeastLoaded => Box::new(LeastLoaded),
        PolicyKind::NearestTarget => Box::new(NearestTarget { origin }),
    }
}

struct Random;

impl LbPolicy for Random {
    fn select_target(&self, _fun_name: &str, targets: &[Target]) -> Option<String> {
        targets
            .choose(&mut rand::thread_rng())
            .map(|t| t.url.clone())
    }
}

#[derive(Default)]
struct RoundRobin {
    next: AtomicUsize,
}

impl LbPolicy for RoundRobin {
    fn select_target(&self, _fun_name: &str, targets: &[Target]) -> Option<String> {
        if targets.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % targets.len();
        Some(targets[idx].url.clone())
    }
}

/// Round robin where each target is visited proportionally to its
/// advertised spare capacity.
#[derive(Default)]
struct WeightedRoundRobin {
    next: AtomicUsize,
}

fn capacity_weight(target: &Target) -> usize {
    match &target.status {
        Some(status) => {
            let cpus = status.available_cpus.max(0.0);
            let mem_gb = (status.available_mem_mb.max(0) as f64) / 1024.0;
            1 + (cpus + mem_gb).round() as usize
        }
        None => 1,
    }
}

impl LbPolicy for WeightedRoundRobin {
    fn select_target(&self, _fun_name: &str, targets: &[Target]) -> Option<String> {
        let total: usize = targets.iter().map(capacity_weight).sum();
        if total == 0 {
            return None;
        }
        let mut slot = self.next.fetch_add(1, Ordering::Relaxed) % total;
        for target in targets {
            let weight = capacity_weight(target);
            if slot < weight {
                return Some(target.url.clone());
            }
            slot -= weight;
        }
        None
    }
}

/// Prefers the node with the most warm containers for the function,
/// breaking ties on the fewest drops.
struct LeastLoaded;

impl LbPolicy for LeastLoaded {
    fn select_target(&self, fun_name: &str, targets: &[Target]) -> Option<String> {
        targets
            .iter()
            .max_by_key(|t| {
                let score = match &t.status {
                    Some(s) => (
                        s.available_warm_containers
                            .get(fun_name)
                            .copied()
                            .unwrap_or(0),
                        std::cmp::Reverse(s.drop_count),
                    ),
                    None => (0, std::cmp::Reverse(u64::MAX)),
                };
                score
            })
            .map(|t| t.url.clone())
    }
}

/// Picks the node closest to this proxy in network-coordinate space.
struct NearestTarget {
    origin: Coordinates,
}

impl LbPolicy for NearestTarget {
    fn select_target(&self, _fun_name: &str, targets: &[Target]) -> Option<String> {
        targets
            .iter()
            .min_by(|a, b| {
                let dist = |t: &Target| {
                    t.status
                        .as_ref()
                        .map(|s| self.origin.distance(&s.coordinates))
                        .unwrap_or(f64::MAX)
                };
                dist(a)
                    .partial_cmp(&dist(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|t| t.url.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn target(url: &str, cpus: f64, mem: i64, warm_f: usize, x: f64) -> Target {
        target_with_drops(url, cpus, mem, warm_f, 0, x)
    }

    fn target_with_drops(
        url: &str,
        cpus: f64,
        mem: i64,
        warm_f: usize,
        drops: u64,
        x: f64,
    ) -> Target {
        Target {
            url: url.to_string(),
            status: Some(StatusInformation {
                url: url.to_string(),
                available_warm_containers: HashMap::from([("f".to_string(), warm_f)]),
                available_mem_mb: mem,
                available_cpus: cpus,
                drop_count: drops,
                coordinates: Coordinates { x, y: 0.0 },
            }),
        }
    }

    #[test]
    fn round_robin_cycles_through_targets() {
        let policy = build_policy(PolicyKind::RoundRobin, Coordinates::default());
        let targets = vec![Target::new("http://a"), Target::new("http://b")];
        let picks: Vec<_> = (0..4)
            .map(|_| policy.select_target("f", &targets).unwrap())
            .collect();
        assert_eq!(picks, ["http://a", "http://b", "http://a", "http://b"]);
    }

    #[test]
    fn weighted_round_robin_favors_spare_capacity() {
        let policy = build_policy(PolicyKind::WeightedRoundRobin, Coordinates::default());
        let targets = vec![
            target("http://big", 8.0, 8192, 0, 0.0),
            target("http://small", 0.0, 0, 0, 0.0),
        ];
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..100 {
            *counts
                .entry(policy.select_target("f", &targets).unwrap())
                .or_default() += 1;
        }
        assert!(counts["http://big"] > counts["http://small"]);
    }

    #[test]
    fn least_loaded_prefers_warm_containers() {
        let policy = build_policy(PolicyKind::LeastLoaded, Coordinates::default());
        let targets = vec![
            target("http://cold", 4.0, 4096, 0, 0.0),
            target("http://warm", 1.0, 512, 3, 0.0),
        ];
        assert_eq!(
            policy.select_target("f", &targets).unwrap(),
            "http://warm"
        );
    }

    #[test]
    fn least_loaded_breaks_warm_ties_on_fewest_drops() {
        let policy = build_policy(PolicyKind::LeastLoaded, Coordinates::default());
        let targets = vec![
            target_with_drops("http://dropping", 8.0, 8192, 2, 40, 0.0),
            target_with_drops("http://steady", 1.0, 512, 2, 1, 0.0),
        ];
        assert_eq!(
            policy.select_target("f", &targets).unwrap(),
            "http://steady"
        );
    }

    #[test]
    fn nearest_target_minimizes_coordinate_distance() {
        let policy = build_policy(
            PolicyKind::NearestTarget,
            Coordinates { x: 1.0, y: 0.0 },
        );
        let targets = vec![
            target("http://far", 1.0, 512, 0, 100.0),
            target("http://near", 1.0, 512, 0, 2.0),
        ];
        assert_eq!(
            policy.select_target("f", &targets).unwrap(),
            "http://near"
        );
    }

    #[test]
    fn empty_target_list_yields_none() {
        for kind in POLICY_SET {
            let policy = build_policy(kind, Coordinates::default());
            assert!(policy.select_target("f", &[]).is_none(), "{kind}");
        }
    }
}
