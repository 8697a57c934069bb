//! Node-wide resource accounting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crate::pool::FunctionPool;

/// Lock-free snapshot of the ledger, kept in sync with every mutation.
/// Lets the decision engine sample available resources without touching
/// the ledger lock.
#[derive(Debug, Default)]
pub struct ResourceMirror {
    cpu_bits: AtomicU64,
    mem_mb: AtomicI64,
}

impl ResourceMirror {
    pub fn available_cpus(&self) -> f64 {
        f64::from_bits(self.cpu_bits.load(Ordering::Acquire))
    }

    pub fn available_mem_mb(&self) -> i64 {
        self.mem_mb.load(Ordering::Acquire)
    }

    fn store(&self, cpus: f64, mem_mb: i64) {
        self.cpu_bits.store(cpus.to_bits(), Ordering::Release);
        self.mem_mb.store(mem_mb, Ordering::Release);
    }
}

/// Available CPU shares and memory for the node, the drop counter, and
/// the per-function container pools. A single instance lives behind the
/// [`Node`](crate::Node) reader/writer lock; every method here assumes
/// the lock is held.
#[derive(Debug)]
pub struct Ledger {
    pub available_cpus: f64,
    pub available_mem_mb: i64,
    pub drop_count: u64,
    pub(crate) pools: HashMap<String, FunctionPool>,
    total_cpus: f64,
    total_mem_mb: i64,
    mirror: Arc<ResourceMirror>,
}

impl Ledger {
    pub fn new(total_cpus: f64, total_mem_mb: i64, mirror: Arc<ResourceMirror>) -> Self {
        mirror.store(total_cpus, total_mem_mb);
        Self {
            available_cpus: total_cpus,
            available_mem_mb: total_mem_mb,
            drop_count: 0,
            pools: HashMap::new(),
            total_cpus,
            total_mem_mb,
            mirror,
        }
    }

    pub fn total_cpus(&self) -> f64 {
        self.total_cpus
    }

    pub fn total_mem_mb(&self) -> i64 {
        self.total_mem_mb
    }

    /// Deducts the given amounts. The caller has already verified
    /// availability; reservations are never partial.
    pub(crate) fn deduct(&mut self, cpus: f64, mem_mb: i64) {
        self.available_cpus -= cpus;
        self.available_mem_mb -= mem_mb;
        self.sync_mirror();
    }

    /// Adds back a prior reservation. No bounds check: the caller pairs
    /// this with an earlier deduction.
    pub(crate) fn release(&mut self, cpus: f64, mem_mb: i64) {
        self.available_cpus += cpus;
        self.available_mem_mb += mem_mb;
        self.sync_mirror();
    }

    pub(crate) fn sync_mirror(&self) {
        self.mirror.store(self.available_cpus, self.available_mem_mb);
    }
}
