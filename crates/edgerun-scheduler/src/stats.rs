//! Sliding-window statistics backing the decision engines.
//!
//! Each (function, service class) pair is one arm. Aggregates keep a
//! running sum so reads are O(1); stale samples are pruned on access and
//! by a background loop so idle arms do not pin memory.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;

use edgerun_common::ServiceClass;

/// Width of the statistics window.
pub const STATS_WINDOW: Duration = Duration::from_secs(300);

/// How often the background loop prunes idle arms.
const PRUNE_PERIOD: Duration = Duration::from_secs(30);

pub type ArmKey = (String, ServiceClass);

/// Time-stamped samples within a fixed window, with an O(1) mean.
#[derive(Debug)]
pub struct WindowedSeries {
    window: Duration,
    samples: VecDeque<(Instant, f64)>,
    sum: f64,
}

impl WindowedSeries {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            sum: 0.0,
        }
    }

    pub fn push(&mut self, value: f64) {
        let now = Instant::now();
        self.samples.push_back((now, value));
        self.sum += value;
        self.prune(now);
    }

    pub fn prune(&mut self, now: Instant) {
        while let Some((t, v)) = self.samples.front() {
            if now.duration_since(*t) > self.window {
                self.sum -= v;
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.sum / self.samples.len() as f64)
        }
    }

    /// Events per second over the window.
    pub fn rate_per_sec(&self) -> f64 {
        self.samples.len() as f64 / self.window.as_secs_f64()
    }
}

#[derive(Debug)]
pub struct ArmStats {
    /// Arrivals over the full window.
    arrivals: WindowedSeries,
    /// Arrivals over the most recent half window; the difference of the
    /// two rates is the arrival flux.
    recent_arrivals: WindowedSeries,
    local_rt: WindowedSeries,
    offload_rt: WindowedSeries,
    drops: WindowedSeries,
}

impl Default for ArmStats {
    fn default() -> Self {
        Self {
            arrivals: WindowedSeries::new(STATS_WINDOW),
            recent_arrivals: WindowedSeries::new(STATS_WINDOW / 2),
            local_rt: WindowedSeries::new(STATS_WINDOW),
            offload_rt: WindowedSeries::new(STATS_WINDOW),
            drops: WindowedSeries::new(STATS_WINDOW),
        }
    }
}

impl ArmStats {
    fn prune(&mut self, now: Instant) {
        self.arrivals.prune(now);
        self.recent_arrivals.prune(now);
        self.local_rt.prune(now);
        self.offload_rt.prune(now);
        self.drops.prune(now);
    }
}

/// Point-in-time view of one arm used by a single decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArmSnapshot {
    pub arrival_rate: f64,
    /// Rate-of-change of arrivals, per second; positive when arrivals
    /// are accelerating.
    pub flux: f64,
    pub local_rt: Option<f64>,
    pub offload_rt: Option<f64>,
    pub local_count: usize,
    pub offload_count: usize,
    pub drop_rate: f64,
}

#[derive(Debug, Default)]
pub struct EngineStats {
    arms: DashMap<ArmKey, ArmStats>,
}

impl EngineStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn key(fun: &str, class: ServiceClass) -> ArmKey {
        (fun.to_string(), class)
    }

    pub fn record_arrival(&self, fun: &str, class: ServiceClass) {
        let mut arm = self.arms.entry(Self::key(fun, class)).or_default();
        arm.arrivals.push(1.0);
        arm.recent_arrivals.push(1.0);
    }

    pub fn record_local(&self, fun: &str, class: ServiceClass, response_time: f64) {
        let mut arm = self.arms.entry(Self::key(fun, class)).or_default();
        arm.local_rt.push(response_time);
    }

    pub fn record_offload(&self, fun: &str, class: ServiceClass, response_time: f64) {
        let mut arm = self.arms.entry(Self::key(fun, class)).or_default();
        arm.offload_rt.push(response_time);
    }

    pub fn record_drop(&self, fun: &str, class: ServiceClass) {
        let mut arm = self.arms.entry(Self::key(fun, class)).or_default();
        arm.drops.push(1.0);
    }

    pub fn snapshot(&self, fun: &str, class: ServiceClass) -> ArmSnapshot {
        let now = Instant::now();
        let Some(mut arm) = self.arms.get_mut(&Self::key(fun, class)) else {
            return ArmSnapshot::default();
        };
        arm.prune(now);
        ArmSnapshot {
            arrival_rate: arm.arrivals.rate_per_sec(),
            flux: arm.recent_arrivals.rate_per_sec() - arm.arrivals.rate_per_sec(),
            local_rt: arm.local_rt.mean(),
            offload_rt: arm.offload_rt.mean(),
            local_count: arm.local_rt.len(),
            offload_count: arm.offload_rt.len(),
            drop_rate: arm.drops.rate_per_sec(),
        }
    }

    /// Background bookkeeping loop started by the engines' `init`.
    pub fn spawn_pruner(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PRUNE_PERIOD);
            loop {
                interval.tick().await;
                let now = Instant::now();
                for mut arm in self.arms.iter_mut() {
                    arm.prune(now);
                }
            }
        })
    }
}
