//! ε-greedy bandit over the load-balancing policy set.
//!
//! Arms are policies; the reward of a cycle is the success ratio minus
//! the normalized mean response time, so faster and more reliable
//! policies score higher.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::info;

use crate::policy::{PolicyKind, POLICY_SET};
use crate::stats::StatsDelta;

const DEFAULT_EPSILON: f64 = 0.1;

#[derive(Debug)]
pub struct MabAgent {
    epsilon: f64,
    values: HashMap<PolicyKind, f64>,
    counts: HashMap<PolicyKind, u64>,
}

impl Default for MabAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl MabAgent {
    pub fn new() -> Self {
        Self::with_epsilon(DEFAULT_EPSILON)
    }

    pub fn with_epsilon(epsilon: f64) -> Self {
        Self {
            epsilon,
            values: HashMap::new(),
            counts: HashMap::new(),
        }
    }

    /// Feeds the outcome of one cycle under `policy` back into the arm
    /// estimate. Cycles without samples carry no signal and are skipped.
    pub fn update(&mut self, policy: PolicyKind, delta: &StatsDelta) {
        if delta.samples() == 0 {
            return;
        }
        let success_ratio = delta.completions as f64 / delta.samples() as f64;
        let rt_penalty = delta.mean_response_time / (1.0 + delta.mean_response_time);
        let reward = success_ratio - rt_penalty;

        let count = self.counts.entry(policy).or_insert(0);
        *count += 1;
        let value = self.values.entry(policy).or_insert(0.0);
        *value += (reward - *value) / *count as f64;

        info!(%policy, reward, samples = delta.samples(), "mab reward");
    }

    /// Next policy to install: greedy on the estimated values, with an
    /// ε chance of exploring a random arm.
    pub fn select_policy(&self) -> PolicyKind {
        let mut rng = rand::thread_rng();
        if rng.gen::<f64>() < self.epsilon {
            return *POLICY_SET.choose(&mut rng).unwrap_or(&PolicyKind::Random);
        }
        self.greedy_policy()
    }

    fn greedy_policy(&self) -> PolicyKind {
        let mut best = PolicyKind::Random;
        let mut best_value = f64::NEG_INFINITY;
        for kind in POLICY_SET {
            let value = self.values.get(&kind).copied().unwrap_or(0.0);
            if value > best_value {
                best = kind;
                best_value = value;
            }
        }
        best
    }
}
