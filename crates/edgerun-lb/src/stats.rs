//! Per-policy, per-target counters accumulated between MAB cycles.
//!
//! Two copies are kept: `new` accumulates live, `old` holds the
//! snapshot taken at the previous cycle so the agent sees a delta.

use std::collections::HashMap;

use crate::policy::{PolicyKind, Target};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TargetCounters {
    pub completions: u64,
    pub failures: u64,
    pub response_time_sum: f64,
}

#[derive(Debug, Clone, Default)]
pub struct LbStats {
    pub policy: PolicyKind,
    pub targets: HashMap<String, TargetCounters>,
}

impl LbStats {
    pub fn new(policy: PolicyKind, targets: &[Target]) -> Self {
        Self {
            policy,
            targets: targets
                .iter()
                .map(|t| (t.url.clone(), TargetCounters::default()))
                .collect(),
        }
    }

    pub fn record_success(&mut self, target: &str, response_time: f64) {
        let counters = self.targets.entry(target.to_string()).or_default();
        counters.completions += 1;
        counters.response_time_sum += response_time;
    }

    pub fn record_failure(&mut self, target: &str) {
        self.targets.entry(target.to_string()).or_default().failures += 1;
    }
}

/// What happened fleet-wide since the previous snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsDelta {
    pub completions: u64,
    pub failures: u64,
    pub mean_response_time: f64,
}

impl StatsDelta {
    /// Difference between the accumulating stats and their snapshot.
    pub fn between(new: &LbStats, old: &LbStats) -> Self {
        let mut completions = 0u64;
        let mut failures = 0u64;
        let mut rt_sum = 0.0f64;

        for (url, counters) in &new.targets {
            let base = old.targets.get(url).copied().unwrap_or_default();
            completions += counters.completions.saturating_sub(base.completions);
            failures += counters.failures.saturating_sub(base.failures);
            rt_sum += counters.response_time_sum - base.response_time_sum;
        }

        let mean_response_time = if completions > 0 {
            rt_sum / completions as f64
        } else {
            0.0
        };
        Self {
            completions,
            failures,
            mean_response_time,
        }
    }

    pub fn samples(&self) -> u64 {
        self.completions + self.failures
    }
}
