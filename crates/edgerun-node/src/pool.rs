//! Per-function container pools: warm/busy tracking, eviction, expiry.
//!
//! Locking rules: every operation that touches the ledger or a pool
//! takes the node lock in write mode for its whole duration;
//! `warm_status` takes it in read mode. The lock is released across
//! sandbox creation; eviction holds it so the two-phase commit is never
//! observable half-done. Memory is charged at container creation and
//! credited at destruction only; CPU is charged at acquire (warm or
//! cold) and credited at release.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use edgerun_common::{Config, ContainerId, EdgeError, Function, Result, SandboxDriver};

use crate::ledger::{Ledger, ResourceMirror};

/// An idle, initialized sandbox ready to run its function again.
#[derive(Debug, Clone)]
pub struct WarmEntry {
    pub container: ContainerId,
    pub function: String,
    /// Nanoseconds since the epoch; the cleaner destroys the entry once
    /// this instant passes.
    pub expiration_ns: i64,
}

#[derive(Debug, Clone)]
pub struct BusyEntry {
    pub container: ContainerId,
    pub function: String,
}

/// Ready and busy sandboxes of one function. Insertion order is
/// preserved; warm entries are consumed from the front.
#[derive(Debug)]
pub struct FunctionPool {
    pub(crate) fun: Function,
    pub(crate) ready: VecDeque<WarmEntry>,
    pub(crate) busy: VecDeque<BusyEntry>,
}

impl FunctionPool {
    fn new(fun: Function) -> Self {
        Self {
            fun,
            ready: VecDeque::new(),
            busy: VecDeque::new(),
        }
    }
}

fn now_ns() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Owner of the ledger lock, the pool map and the sandbox driver handle.
/// One instance per worker process, passed around explicitly.
pub struct Node {
    resources: RwLock<Ledger>,
    mirror: Arc<ResourceMirror>,
    driver: Arc<dyn SandboxDriver>,
    done: broadcast::Sender<()>,
    container_ttl: Duration,
    totals: (f64, i64),
    identifier: String,
}

impl Node {
    pub fn new(driver: Arc<dyn SandboxDriver>, cfg: &Config) -> Self {
        let mirror = Arc::new(ResourceMirror::default());
        let (done, _) = broadcast::channel(64);
        Self {
            resources: RwLock::new(Ledger::new(cfg.total_cpus, cfg.total_mem_mb, mirror.clone())),
            mirror,
            driver,
            done,
            container_ttl: cfg.container_expiration(),
            totals: (cfg.total_cpus, cfg.total_mem_mb),
            identifier: format!("edgerun-{}", Uuid::new_v4()),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Node-id suffix folded into request identifiers.
    pub fn id_suffix(&self) -> &str {
        &self.identifier[self.identifier.len() - 5..]
    }

    pub fn driver(&self) -> &Arc<dyn SandboxDriver> {
        &self.driver
    }

    /// Broadcast fired whenever the node finishes a unit of work.
    pub fn subscribe_done(&self) -> broadcast::Receiver<()> {
        self.done.subscribe()
    }

    /// Lock-free view of available resources for the decision engine.
    pub fn available_snapshot(&self) -> (f64, i64) {
        (self.mirror.available_cpus(), self.mirror.available_mem_mb())
    }

    /// Resources the node was configured with.
    pub fn totals(&self) -> (f64, i64) {
        self.totals
    }

    pub async fn drop_count(&self) -> u64 {
        self.resources.read().await.drop_count
    }

    /// Counts a dropped request.
    pub async fn record_drop(&self) -> u64 {
        let mut ledger = self.resources.write().await;
        ledger.drop_count += 1;
        ledger.drop_count
    }

    /// Atomically reserves `cpus` and `mem_mb`, evicting warm containers
    /// to reclaim memory when permitted. Never partially reserves.
    pub async fn acquire_resources(&self, cpus: f64, mem_mb: i64, may_evict: bool) -> bool {
        let mut guard = self.resources.write().await;
        self.acquire_locked(&mut guard, cpus, mem_mb, may_evict).await
    }

    async fn acquire_locked(
        &self,
        ledger: &mut Ledger,
        cpus: f64,
        mem_mb: i64,
        may_evict: bool,
    ) -> bool {
        if ledger.available_cpus < cpus {
            return false;
        }
        if ledger.available_mem_mb < mem_mb {
            if !may_evict {
                return false;
            }
            if !self.dismiss(ledger, mem_mb).await {
                return false;
            }
        }
        ledger.deduct(cpus, mem_mb);
        true
    }

    /// Two-phase eviction: first identify front-running warm entries
    /// whose memory covers `required_mb`, then destroy them and credit
    /// the memory back. If the need cannot be covered nothing is
    /// touched; a destruction failure aborts the reclamation.
    async fn dismiss(&self, ledger: &mut Ledger, required_mb: i64) -> bool {
        let mut reclaimable = 0i64;
        let mut victims: Vec<(String, ContainerId, i64)> = Vec::new();

        'research: for (name, pool) in ledger.pools.iter() {
            // every container in a pool runs the same function, so each
            // warm entry frees the same amount
            let mem = pool.fun.memory_mb;
            for entry in pool.ready.iter() {
                victims.push((name.clone(), entry.container.clone(), mem));
                reclaimable += mem;
                if reclaimable >= required_mb {
                    break 'research;
                }
            }
        }

        if reclaimable < required_mb {
            return false;
        }

        for (pool_name, container, mem) in victims {
            if let Err(e) = self.driver.destroy(&container).await {
                warn!(container = %container, error = %e, "eviction aborted: destroy failed");
                return false;
            }
            if let Some(pool) = ledger.pools.get_mut(&pool_name) {
                pool.ready.retain(|w| w.container != container);
            }
            ledger.release(0.0, mem);
            debug!(container = %container, freed_mb = mem, "evicted warm container");
        }
        true
    }

    /// Takes the oldest warm container for `fun` and moves it to the
    /// busy pool, reserving CPU only (memory was charged at creation).
    pub async fn acquire_warm(&self, fun: &Function) -> Result<ContainerId> {
        let mut guard = self.resources.write().await;
        let ledger = &mut *guard;

        let has_warm = ledger
            .pools
            .get(&fun.name)
            .is_some_and(|p| !p.ready.is_empty());
        if !has_warm {
            return Err(EdgeError::NoWarmFound);
        }
        if ledger.available_cpus < fun.cpu_demand {
            return Err(EdgeError::OutOfResources);
        }

        let Some(pool) = ledger.pools.get_mut(&fun.name) else {
            return Err(EdgeError::NoWarmFound);
        };
        let Some(entry) = pool.ready.pop_front() else {
            return Err(EdgeError::NoWarmFound);
        };
        let container = entry.container;
        pool.busy.push_back(BusyEntry {
            container: container.clone(),
            function: fun.name.clone(),
        });
        ledger.deduct(fun.cpu_demand, 0);

        debug!(container = %container, function = %fun.name, "acquired warm container");
        Ok(container)
    }

    /// Creates and starts a new container for `fun`, already in the busy
    /// pool. The ledger lock is released across the driver call; the
    /// reservation is rolled back if creation fails.
    pub async fn new_container(&self, fun: &Function) -> Result<ContainerId> {
        {
            let mut guard = self.resources.write().await;
            if !self
                .acquire_locked(&mut guard, fun.cpu_demand, fun.memory_mb, true)
                .await
            {
                return Err(EdgeError::OutOfResources);
            }
        }

        match self.driver.create(fun).await {
            Ok(container) => {
                let mut guard = self.resources.write().await;
                let ledger = &mut *guard;
                ledger
                    .pools
                    .entry(fun.name.clone())
                    .or_insert_with(|| FunctionPool::new(fun.clone()))
                    .busy
                    .push_back(BusyEntry {
                        container: container.clone(),
                        function: fun.name.clone(),
                    });
                info!(container = %container, function = %fun.name, "created container");
                Ok(container)
            }
            Err(e) => {
                warn!(function = %fun.name, error = %e, "container creation failed");
                let mut guard = self.resources.write().await;
                guard.release(fun.cpu_demand, fun.memory_mb);
                Err(e)
            }
        }
    }

    /// Puts a busy container back into the ready pool with a fresh
    /// expiration and credits its CPU. The node-done event fires after
    /// the pool update, before the lock is released.
    pub async fn release(&self, container: &ContainerId, fun: &Function) {
        let expiration_ns = now_ns() + self.container_ttl.as_nanos() as i64;

        let mut guard = self.resources.write().await;
        let ledger = &mut *guard;
        let pool = ledger
            .pools
            .entry(fun.name.clone())
            .or_insert_with(|| FunctionPool::new(fun.clone()));

        if let Some(pos) = pool.busy.iter().position(|b| &b.container == container) {
            pool.busy.remove(pos);
        }
        pool.ready.push_back(WarmEntry {
            container: container.clone(),
            function: fun.name.clone(),
            expiration_ns,
        });
        ledger.release(fun.cpu_demand, 0);

        let _ = self.done.send(());
    }

    /// Destroys every warm container whose expiration has passed,
    /// crediting its memory. Driven periodically by the cleaner.
    pub async fn expire_idle(&self) {
        let now = now_ns();
        let mut expired: Vec<ContainerId> = Vec::new();

        {
            let mut guard = self.resources.write().await;
            let ledger = &mut *guard;
            let mut credit = 0i64;
            for pool in ledger.pools.values_mut() {
                let mem = pool.fun.memory_mb;
                let before = pool.ready.len();
                pool.ready.retain(|w| {
                    if w.expiration_ns < now {
                        expired.push(w.container.clone());
                        false
                    } else {
                        true
                    }
                });
                credit += mem * (before - pool.ready.len()) as i64;
            }
            if credit > 0 {
                ledger.release(0.0, credit);
            }
        }

        for container in expired {
            info!(container = %container, "cleaner: removing expired container");
            if let Err(e) = self.driver.destroy(&container).await {
                warn!(container = %container, error = %e, "failed to destroy expired container");
            }
        }
    }

    /// Purges both collections of `fun`'s pool. Resource credits are
    /// applied before returning; destruction happens on a detached task.
    pub async fn shutdown_for(&self, fun_name: &str) {
        let mut guard = self.resources.write().await;
        let ledger = &mut *guard;
        let Some(pool) = ledger.pools.remove(fun_name) else {
            return;
        };
        let doomed = Self::drain_pool(ledger, pool);
        drop(guard);
        self.destroy_detached(doomed);
    }

    /// Destroys every container on the node, usually at termination.
    pub async fn shutdown_all(&self) {
        let mut guard = self.resources.write().await;
        let ledger = &mut *guard;
        let pools: Vec<FunctionPool> = ledger.pools.drain().map(|(_, p)| p).collect();
        let mut doomed = Vec::new();
        for pool in pools {
            doomed.extend(Self::drain_pool(ledger, pool));
        }
        drop(guard);
        self.destroy_detached(doomed);
    }

    /// Credits memory for every entry and CPU for busy entries, and
    /// returns the container ids to destroy.
    fn drain_pool(ledger: &mut Ledger, pool: FunctionPool) -> Vec<ContainerId> {
        let mem = pool.fun.memory_mb;
        let cpu = pool.fun.cpu_demand;
        let mut doomed = Vec::with_capacity(pool.ready.len() + pool.busy.len());

        for warm in pool.ready {
            ledger.release(0.0, mem);
            doomed.push(warm.container);
        }
        for busy in pool.busy {
            ledger.release(cpu, mem);
            doomed.push(busy.container);
        }
        doomed
    }

    fn destroy_detached(&self, doomed: Vec<ContainerId>) {
        if doomed.is_empty() {
            return;
        }
        let driver = self.driver.clone();
        tokio::spawn(async move {
            for container in doomed {
                match driver.destroy(&container).await {
                    Ok(()) => info!(container = %container, "destroyed container"),
                    Err(e) => warn!(container = %container, error = %e, "failed to destroy container"),
                }
            }
        });
    }

    /// Number of warm containers available per function.
    pub async fn warm_status(&self) -> HashMap<String, usize> {
        let ledger = self.resources.read().await;
        ledger
            .pools
            .iter()
            .map(|(name, pool)| (name.clone(), pool.ready.len()))
            .collect()
    }

    pub async fn available_resources(&self) -> (f64, i64) {
        let ledger = self.resources.read().await;
        (ledger.available_cpus, ledger.available_mem_mb)
    }

    /// Test/seed hook: registers an already-created warm container.
    pub async fn seed_warm(&self, fun: &Function, container: ContainerId, expiration_ns: i64) {
        let mut guard = self.resources.write().await;
        let ledger = &mut *guard;
        ledger.deduct(0.0, fun.memory_mb);
        ledger
            .pools
            .entry(fun.name.clone())
            .or_insert_with(|| FunctionPool::new(fun.clone()))
            .ready
            .push_back(WarmEntry {
                container,
                function: fun.name.clone(),
                expiration_ns,
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDriver;
    use edgerun_common::Config;

    fn fun(name: &str, cpu: f64, mem: i64) -> Function {
        Function {
            name: name.to_string(),
            runtime: "python311".to_string(),
            custom_image: None,
            tar_function_code: None,
            cpu_demand: cpu,
            memory_mb: mem,
        }
    }

    fn node_with(cpus: f64, mem: i64) -> (Arc<Node>, Arc<MockDriver>) {
        let driver = Arc::new(MockDriver::new());
        let cfg = Config {
            total_cpus: cpus,
            total_mem_mb: mem,
            ..Default::default()
        };
        (Arc::new(Node::new(driver.clone(), &cfg)), driver)
    }

    fn far_future() -> i64 {
        now_ns() + 600_000_000_000
    }

    #[tokio::test]
    async fn warm_hit_moves_entry_to_busy_and_charges_cpu_only() {
        let (node, _driver) = node_with(1.0, 512);
        let f = fun("f", 0.5, 512);
        node.seed_warm(&f, "sbx-0".to_string(), far_future()).await;

        let id = node.acquire_warm(&f).await.unwrap();
        assert_eq!(id, "sbx-0");

        let (cpus, mem) = node.available_resources().await;
        assert_eq!(cpus, 0.5);
        assert_eq!(mem, 0);
        assert_eq!(node.warm_status().await.get("f"), Some(&0));
    }

    #[tokio::test]
    async fn warm_miss_yields_no_warm_found() {
        let (node, _driver) = node_with(1.0, 512);
        let f = fun("f", 0.5, 128);
        assert!(matches!(
            node.acquire_warm(&f).await,
            Err(EdgeError::NoWarmFound)
        ));
    }

    #[tokio::test]
    async fn warm_hit_without_cpu_fails_and_keeps_entry() {
        let (node, _driver) = node_with(0.25, 512);
        let f = fun("f", 0.5, 256);
        node.seed_warm(&f, "sbx-0".to_string(), far_future()).await;

        assert!(matches!(
            node.acquire_warm(&f).await,
            Err(EdgeError::OutOfResources)
        ));
        // the warm entry is untouched
        assert_eq!(node.warm_status().await.get("f"), Some(&1));
    }

    #[tokio::test]
    async fn cold_start_with_eviction_reclaims_warm_memory() {
        let (node, driver) = node_with(1.0, 256);
        let g = fun("g", 0.2, 256);
        node.seed_warm(&g, "warm-g".to_string(), far_future()).await;
        // g's warm container holds all 256 MB of the node

        let f = fun("f", 0.5, 256);
        let id = node.new_container(&f).await.unwrap();

        assert!(driver.destroyed().await.contains(&"warm-g".to_string()));
        assert_eq!(node.warm_status().await.get("g"), Some(&0));
        let (cpus, mem) = node.available_resources().await;
        assert_eq!(cpus, 0.5);
        assert_eq!(mem, 0);
        assert!(!id.is_empty());
    }

    #[tokio::test]
    async fn eviction_is_all_or_nothing() {
        let (node, driver) = node_with(1.0, 256);
        let g = fun("g", 0.2, 128);
        node.seed_warm(&g, "warm-g".to_string(), far_future()).await;
        // 128 available + 128 reclaimable < 512 required

        let f = fun("f", 0.5, 512);
        assert!(matches!(
            node.new_container(&f).await,
            Err(EdgeError::OutOfResources)
        ));

        assert!(driver.destroyed().await.is_empty());
        assert_eq!(node.warm_status().await.get("g"), Some(&1));
        let (cpus, mem) = node.available_resources().await;
        assert_eq!(cpus, 1.0);
        assert_eq!(mem, 128);
    }

    #[tokio::test]
    async fn failed_creation_rolls_back_reservation() {
        let (node, driver) = node_with(2.0, 1024);
        driver.fail_create(true);

        let f = fun("f", 1.0, 512);
        assert!(matches!(
            node.new_container(&f).await,
            Err(EdgeError::SandboxDriver(_))
        ));

        let (cpus, mem) = node.available_resources().await;
        assert_eq!(cpus, 2.0);
        assert_eq!(mem, 1024);
        assert!(node.warm_status().await.is_empty());
    }

    #[tokio::test]
    async fn release_returns_container_to_ready_and_credits_cpu() {
        let (node, _driver) = node_with(2.0, 1024);
        let f = fun("f", 1.0, 512);
        let id = node.new_container(&f).await.unwrap();

        let mut done = node.subscribe_done();
        node.release(&id, &f).await;
        done.try_recv().expect("done event after release");

        let (cpus, mem) = node.available_resources().await;
        assert_eq!(cpus, 2.0);
        assert_eq!(mem, 512); // memory stays charged while the container is warm
        assert_eq!(node.warm_status().await.get("f"), Some(&1));
    }

    #[tokio::test]
    async fn expired_entries_are_destroyed_and_memory_credited() {
        let (node, driver) = node_with(1.0, 512);
        let f = fun("f", 0.5, 256);
        node.seed_warm(&f, "old".to_string(), now_ns() - 1).await;
        node.seed_warm(&f, "fresh".to_string(), far_future()).await;

        node.expire_idle().await;

        assert_eq!(node.warm_status().await.get("f"), Some(&1));
        assert_eq!(driver.destroyed().await, vec!["old".to_string()]);
        let (_, mem) = node.available_resources().await;
        assert_eq!(mem, 256);
    }

    #[tokio::test]
    async fn shutdown_all_credits_busy_cpu_and_memory() {
        let (node, _driver) = node_with(2.0, 1024);
        let f = fun("f", 1.0, 512);
        let _busy = node.new_container(&f).await.unwrap();
        let warm_owner = node.new_container(&f).await.unwrap();
        node.release(&warm_owner, &f).await;

        node.shutdown_all().await;

        let (cpus, mem) = node.available_resources().await;
        assert_eq!(cpus, 2.0);
        assert_eq!(mem, 1024);
        assert!(node.warm_status().await.is_empty());
    }

    #[tokio::test]
    async fn resources_are_conserved_across_acquire_release_cycles() {
        let (node, _driver) = node_with(4.0, 2048);
        let f = fun("f", 0.5, 256);

        for _ in 0..3 {
            let id = node.new_container(&f).await.unwrap();
            node.release(&id, &f).await;
            let warm = node.acquire_warm(&f).await.unwrap();
            node.release(&warm, &f).await;
        }
        node.expire_idle().await;
        node.shutdown_all().await;

        let (cpus, mem) = node.available_resources().await;
        assert_eq!(cpus, 4.0);
        assert_eq!(mem, 2048);
    }

    #[tokio::test]
    async fn drop_counter_increments_once_per_drop() {
        let (node, _driver) = node_with(0.0, 0);
        assert_eq!(node.record_drop().await, 1);
        assert_eq!(node.record_drop().await, 2);
        assert_eq!(node.drop_count().await, 2);
    }

    #[tokio::test]
    async fn mirror_tracks_ledger_mutations() {
        let (node, _driver) = node_with(2.0, 1024);
        let f = fun("f", 1.0, 512);
        let id = node.new_container(&f).await.unwrap();

        let (cpus, mem) = node.available_snapshot();
        assert_eq!(cpus, 1.0);
        assert_eq!(mem, 512);

        node.release(&id, &f).await;
        let (cpus, _) = node.available_snapshot();
        assert_eq!(cpus, 2.0);
    }
}
