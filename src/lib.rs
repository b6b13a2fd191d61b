//! # Distro Replication
//! A leaderless, eventually consistent replication engine for ephemeral
//! service-registry state.
//!
//! Every node owns a deterministic slice of the key space, computed by
//! rendezvous-hashing keys over the sorted member list. Local mutations are
//! debounced by the delay task engine and pushed to every peer through a
//! key-sharded worker pool, which serializes all work for one key on a single
//! lane. A periodic verification cycle broadcasts per-key checksums of the
//! owned data so peers that missed a push detect the divergence and pull the
//! authoritative content back - convergence never depends on any individual
//! push arriving.
//!
//! The engine does not speak to the network or to disk itself: cluster
//! membership arrives over a `tokio::sync::watch` channel and storage,
//! inbound application and RPC sends are plugged in per resource type via
//! the [`DataStorage`], [`DataProcessor`] and [`TransportAgent`] traits.
//!
//! ```rust,no_run
//! use std::net::SocketAddr;
//! use distro_replication::{
//!     DataOperation,
//!     DistroConfig,
//!     DistroKey,
//!     DistroProtocol,
//!     MemberList,
//!     MemberView,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let me: SocketAddr = "10.0.0.1:7000".parse()?;
//!     let peer: SocketAddr = "10.0.0.2:7000".parse()?;
//!     let (_view, changes) = MemberView::new(MemberList::from_members([me, peer]));
//!
//!     let protocol = DistroProtocol::new(me, changes, DistroConfig::default());
//!     // Register a DataStorage, DataProcessor and TransportAgent for each
//!     // resource type here, then:
//!     protocol.start();
//!
//!     protocol.sync(
//!         DistroKey::new("svc-1", "ephemeral-instances"),
//!         DataOperation::Change,
//!     )?;
//!     Ok(())
//! }
//! ```

#[macro_use]
extern crate tracing;

mod components;
mod core;
mod error;
mod mapper;
mod membership;
mod registry;
mod replication;
mod statistics;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub use components::{DataProcessor, DataStorage, FailedTaskHandler, TransportAgent};
use futures::StreamExt;
pub use mapper::{ResponsibilityMapper, ResponsibilityRule};
pub use membership::{Member, MemberList, MemberView};
use parking_lot::Mutex;
use rand::Rng;
pub use registry::ComponentRegistry;
pub use statistics::{ProtocolStatistics, VerifyRecord};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::WatchStream;

pub use crate::core::{
    DataOperation,
    DistroData,
    DistroKey,
    KeyChecksum,
    VerifyData,
    VerifyDiff,
};
pub use crate::error::{DistroError, TransportError};
use crate::replication::{
    start_delay_task_engine,
    start_verify_cycle,
    DelayEngineContext,
    DelayTask,
    DelayTaskQueue,
    VerifyCycleContext,
    VerifyHandle,
    WorkerPool,
};

/// Tuning knobs for the replication engine.
///
/// The defaults shrink under tests so cycles complete inside test timeouts.
#[derive(Debug, Clone)]
pub struct DistroConfig {
    /// How long a change is debounced before it is pushed to peers.
    pub sync_delay: Duration,
    /// How often the delay queue scans for due tasks.
    pub processing_interval: Duration,
    /// Time between anti-entropy cycles.
    pub verify_interval: Duration,
    /// Grace period before the first anti-entropy cycle.
    pub verify_initial_delay: Duration,
    /// Timeout applied to every network call.
    pub rpc_timeout: Duration,
    /// Number of key-sharded worker lanes.
    pub worker_lanes: usize,
    /// How many times a failed push is retried before it is dropped and left
    /// for the verification cycle to repair.
    pub max_retries: u32,
    /// Base delay for the default retry backoff; doubles per attempt.
    pub retry_backoff: Duration,
    /// Merge bound after which a pending task's fire time stops moving.
    pub max_coalesced_ops: u32,
    /// Pull a full snapshot from a peer on startup so a rebooted node does
    /// not have to wait for its first verification cycle.
    pub load_snapshot_on_start: bool,
}

impl Default for DistroConfig {
    fn default() -> Self {
        if cfg!(any(test, feature = "test-utils")) {
            Self {
                sync_delay: Duration::from_millis(100),
                processing_interval: Duration::from_millis(20),
                verify_interval: Duration::from_secs(1),
                verify_initial_delay: Duration::from_millis(300),
                rpc_timeout: Duration::from_secs(1),
                worker_lanes: 4,
                max_retries: 3,
                retry_backoff: Duration::from_millis(100),
                max_coalesced_ops: 64,
                load_snapshot_on_start: true,
            }
        } else {
            Self {
                sync_delay: Duration::from_secs(1),
                processing_interval: Duration::from_millis(100),
                verify_interval: Duration::from_secs(5),
                verify_initial_delay: Duration::from_secs(30),
                rpc_timeout: Duration::from_secs(2),
                worker_lanes: 8,
                max_retries: 3,
                retry_backoff: Duration::from_millis(500),
                max_coalesced_ops: 64,
                load_snapshot_on_start: true,
            }
        }
    }
}

impl DistroConfig {
    /// Set how long changes are debounced before being pushed.
    pub fn with_sync_delay(mut self, dur: Duration) -> Self {
        self.sync_delay = dur;
        self
    }

    /// Set the interval between anti-entropy cycles.
    pub fn with_verify_interval(mut self, dur: Duration) -> Self {
        self.verify_interval = dur;
        self
    }

    /// Set the grace period before the first anti-entropy cycle.
    pub fn with_verify_initial_delay(mut self, dur: Duration) -> Self {
        self.verify_initial_delay = dur;
        self
    }

    /// Enable or disable the startup snapshot load.
    pub fn with_snapshot_load(mut self, enabled: bool) -> Self {
        self.load_snapshot_on_start = enabled;
        self
    }
}

/// The replication engine itself.
///
/// Construction wires a fresh [`ComponentRegistry`] and responsibility
/// mapper; nothing runs until [`start`](Self::start) is called, and
/// [`shutdown`](Self::shutdown) (or dropping the protocol) stops every
/// background task. In-flight work is lost on shutdown by design - the next
/// verification cycle heals whatever was dropped.
///
/// Multiple protocol instances can coexist in one process; there is no
/// process-wide state.
pub struct DistroProtocol {
    self_addr: SocketAddr,
    config: DistroConfig,
    registry: Arc<ComponentRegistry>,
    mapper: Arc<ResponsibilityMapper>,
    statistics: ProtocolStatistics,
    last_verify: Arc<Mutex<VerifyRecord>>,
    member_changes: watch::Receiver<MemberList>,
    services: Mutex<Option<RunningServices>>,
}

struct RunningServices {
    pool: Arc<WorkerPool>,
    delay_queue: DelayTaskQueue,
    verify: VerifyHandle,
    pump: JoinHandle<()>,
    watcher: JoinHandle<()>,
    warmup: Option<JoinHandle<()>>,
}

impl DistroProtocol {
    /// Creates an engine for the node at `self_addr`, consuming membership
    /// snapshots from `member_changes`.
    pub fn new(
        self_addr: SocketAddr,
        member_changes: watch::Receiver<MemberList>,
        config: DistroConfig,
    ) -> Self {
        Self {
            self_addr,
            config,
            registry: Arc::new(ComponentRegistry::default()),
            mapper: Arc::new(ResponsibilityMapper::new(self_addr)),
            statistics: ProtocolStatistics::default(),
            last_verify: Arc::new(Mutex::new(VerifyRecord::default())),
            member_changes,
            services: Mutex::new(None),
        }
    }

    /// The registry used to plug in per-resource-type implementations.
    ///
    /// All components for a type should be registered before the first call
    /// to [`sync`](Self::sync) referencing it.
    pub fn components(&self) -> &ComponentRegistry {
        &self.registry
    }

    /// Starts the background services: the delay task dispatcher, the worker
    /// lanes, the membership watcher and the verification cycle.
    ///
    /// Must be called from within a tokio runtime. Calling it twice is a
    /// no-op.
    pub fn start(&self) {
        let mut services = self.services.lock();
        if services.is_some() {
            debug!("Replication services are already running.");
            return;
        }

        self.mapper.update(self.member_changes.borrow().clone());

        let pool = Arc::new(WorkerPool::start(self.config.worker_lanes));

        let (delay_queue, fired) = start_delay_task_engine(DelayEngineContext {
            sync_delay: self.config.sync_delay,
            processing_interval: self.config.processing_interval,
            max_coalesced_ops: self.config.max_coalesced_ops,
            statistics: self.statistics.clone(),
        });

        let exec_ctx = Arc::new(ExecuteContext {
            registry: self.registry.clone(),
            delay_queue: delay_queue.clone(),
            statistics: self.statistics.clone(),
            rpc_timeout: self.config.rpc_timeout,
            max_retries: self.config.max_retries,
            retry_backoff: self.config.retry_backoff,
        });
        let pump = tokio::spawn(run_task_pump(fired, pool.clone(), exec_ctx));

        let verify = start_verify_cycle(VerifyCycleContext {
            verify_interval: self.config.verify_interval,
            initial_delay: self.config.verify_initial_delay,
            rpc_timeout: self.config.rpc_timeout,
            self_addr: self.self_addr,
            mapper: self.mapper.clone(),
            registry: self.registry.clone(),
            statistics: self.statistics.clone(),
            last_record: self.last_verify.clone(),
        });

        let watcher = tokio::spawn(watch_membership_changes(
            WatchStream::new(self.member_changes.clone()),
            self.mapper.clone(),
        ));

        let warmup = self.config.load_snapshot_on_start.then(|| {
            tokio::spawn(load_initial_snapshot(
                self.registry.clone(),
                self.mapper.members().peers(self.self_addr).to_vec(),
                self.config.rpc_timeout,
            ))
        });

        *services = Some(RunningServices {
            pool,
            delay_queue,
            verify,
            pump,
            watcher,
            warmup,
        });

        info!(self_addr = %self.self_addr, "Distro replication engine started.");
    }

    /// Stops every background service. Queued and in-flight tasks are
    /// dropped; no state is persisted.
    pub fn shutdown(&self) {
        if let Some(services) = self.services.lock().take() {
            services.delay_queue.kill();
            services.verify.kill();
            services.pool.shutdown();
            services.pump.abort();
            services.watcher.abort();
            if let Some(warmup) = services.warmup {
                warmup.abort();
            }
            info!(self_addr = %self.self_addr, "Distro replication engine stopped.");
        }
    }

    /// Schedules replication of a local mutation to every peer.
    ///
    /// This only enqueues delay tasks and never blocks on the network; the
    /// actual pushes happen asynchronously after the debounce window. The
    /// only error surfaced here is structural misconfiguration - transient
    /// peer failures are retried internally and healed by anti-entropy.
    pub fn sync(&self, key: DistroKey, operation: DataOperation) -> Result<(), DistroError> {
        if !operation.is_mutation() {
            return Err(DistroError::InvalidOperation(operation));
        }
        self.ensure_sync_components(key.resource_type())?;

        let services = self.services.lock();
        let Some(services) = services.as_ref() else {
            return Err(DistroError::NotRunning);
        };

        for peer in self.mapper.members().peers(self.self_addr) {
            services.delay_queue.add_task(
                DistroKey::with_target(key.resource_key(), key.resource_type(), peer.addr()),
                operation,
            );
        }
        Ok(())
    }

    /// Schedules replication of a local mutation to a single peer.
    pub fn sync_to_target(
        &self,
        key: DistroKey,
        operation: DataOperation,
        target: SocketAddr,
    ) -> Result<(), DistroError> {
        if !operation.is_mutation() {
            return Err(DistroError::InvalidOperation(operation));
        }
        self.ensure_sync_components(key.resource_type())?;

        let services = self.services.lock();
        let Some(services) = services.as_ref() else {
            return Err(DistroError::NotRunning);
        };

        services.delay_queue.add_task(
            DistroKey::with_target(key.resource_key(), key.resource_type(), target),
            operation,
        );
        Ok(())
    }

    /// Applies data pushed by a peer.
    ///
    /// Called by the environment's RPC layer when a `sync_data` send arrives.
    /// The apply runs on the key's worker lane, so it cannot interleave with
    /// a pull for the same key, and the returned acknowledgement is only
    /// produced once the processor has actually applied the data.
    pub async fn on_receive(&self, data: DistroData) -> Result<(), DistroError> {
        let resource_type = data.key().resource_type().to_string();
        let processor = self
            .registry
            .find_data_processor(&resource_type)
            .ok_or(DistroError::UnregisteredType(resource_type))?;

        let key = data.key().untargeted();
        self.pool()?
            .execute(&key, async move {
                match data.operation() {
                    DataOperation::Snapshot => processor.process_snapshot(data).await,
                    _ => processor.process_data(data).await,
                }
            })
            .await?
            .map_err(DistroError::Processor)
    }

    /// Handles a checksum batch broadcast by a peer's verification cycle.
    ///
    /// The processor for the type reports which keys disagree with the
    /// batch; those are pulled back from the sender on their worker lanes.
    /// Keys this node previously replicated from the sender that vanished
    /// from the batch are deleted. A batch containing keys this node owns is
    /// rejected outright - an owner never accepts checksums for its own data.
    pub async fn on_verify(&self, data: VerifyData) -> Result<(), DistroError> {
        let resource_type = data.resource_type.clone();
        let processor = self
            .registry
            .find_data_processor(&resource_type)
            .ok_or_else(|| DistroError::UnregisteredType(resource_type.clone()))?;
        let storage = self
            .registry
            .find_data_storage(&resource_type)
            .ok_or_else(|| DistroError::UnregisteredType(resource_type.clone()))?;
        let transport = self
            .registry
            .find_transport_agent(&resource_type)
            .ok_or_else(|| DistroError::UnregisteredType(resource_type.clone()))?;

        for checksum in &data.checksums {
            if self.mapper.responsible(&checksum.resource_key) {
                warn!(
                    source = %data.source,
                    resource_key = %checksum.resource_key,
                    "Received a verification batch containing a key this node owns; ignoring batch."
                );
                return Ok(());
            }
        }

        let diff = processor
            .process_verify_data(&data)
            .await
            .map_err(DistroError::Processor)?;

        let pool = self.pool()?;

        // Keys the sender owned last time we heard from it which are absent
        // from this batch no longer exist on the owner: drop them locally.
        let snapshot = storage
            .get_datum_snapshot()
            .await
            .map_err(DistroError::Storage)?;
        let batch_keys: HashSet<&str> = data
            .checksums
            .iter()
            .map(|c| c.resource_key.as_str())
            .collect();

        for datum in snapshot {
            let resource_key = datum.key().resource_key();
            if batch_keys.contains(resource_key) {
                continue;
            }
            if self.mapper.map_target(resource_key) != Some(data.source) {
                continue;
            }

            let delete = DistroData::new(
                DistroKey::new(resource_key, &resource_type),
                DataOperation::Delete,
                Vec::new(),
            );
            let key = delete.key().clone();
            let processor = processor.clone();
            let statistics = self.statistics.clone();
            pool.dispatch(&key, async move {
                match processor.process_data(delete).await {
                    Ok(()) => {
                        statistics
                            .removals_applied
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    },
                    Err(e) => error!(error = ?e, "Failed to apply reconciliation delete."),
                }
            })?;
        }

        // Divergent keys are pulled back from the sender, one lane-routed
        // task per key so a pull can never race a push for the same key.
        for resource_key in diff.to_update {
            let key = DistroKey::new(resource_key, &resource_type);
            let transport = transport.clone();
            let processor = processor.clone();
            let source = data.source;
            let rpc_timeout = self.config.rpc_timeout;

            self.statistics
                .pulls_issued
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let lane_key = key.clone();
            pool.dispatch(
                &lane_key,
                pull_and_apply(transport, processor, source, key, rpc_timeout),
            )?;
        }

        Ok(())
    }

    /// Serves a pull for one key from local storage.
    ///
    /// A key that no longer exists is answered with a delete so the puller
    /// converges on the removal instead of erroring.
    pub async fn on_query(&self, key: DistroKey) -> Result<DistroData, DistroError> {
        let resource_type = key.resource_type().to_string();
        let storage = self
            .registry
            .find_data_storage(&resource_type)
            .ok_or(DistroError::UnregisteredType(resource_type))?;

        match storage
            .get_distro_data(&key.untargeted())
            .await
            .map_err(DistroError::Storage)?
        {
            Some(data) => Ok(DistroData::new(
                data.key().clone(),
                DataOperation::Snapshot,
                data.into_payload(),
            )),
            None => Ok(DistroData::new(
                key.untargeted(),
                DataOperation::Delete,
                Vec::new(),
            )),
        }
    }

    /// Serves a full-state pull for one resource type from local storage.
    pub async fn on_snapshot(&self, resource_type: &str) -> Result<Vec<DistroData>, DistroError> {
        let storage = self
            .registry
            .find_data_storage(resource_type)
            .ok_or_else(|| DistroError::UnregisteredType(resource_type.to_string()))?;

        let snapshot = storage
            .get_datum_snapshot()
            .await
            .map_err(DistroError::Storage)?;

        Ok(snapshot
            .into_iter()
            .map(|data| {
                let key = data.key().clone();
                DistroData::new(key, DataOperation::Snapshot, data.into_payload())
            })
            .collect())
    }

    /// Whether this node owns `resource_key`.
    pub fn responsible(&self, resource_key: &str) -> bool {
        self.mapper.responsible(resource_key)
    }

    /// Ownership with caller-supplied overrides; see [`ResponsibilityRule`].
    pub fn responsible_by_rule(
        &self,
        resource_key: &str,
        rules: &[&dyn ResponsibilityRule],
    ) -> bool {
        self.mapper.responsible_by_rule(resource_key, rules)
    }

    /// The node that owns `resource_key`, or `None` when the member list is
    /// empty.
    pub fn map_target(&self, resource_key: &str) -> Option<SocketAddr> {
        self.mapper.map_target(resource_key)
    }

    /// The membership snapshot the engine is currently operating on.
    pub fn members(&self) -> MemberList {
        self.mapper.members()
    }

    pub fn self_addr(&self) -> SocketAddr {
        self.self_addr
    }

    #[inline]
    /// Live counters for the engine.
    pub fn statistics(&self) -> ProtocolStatistics {
        self.statistics.clone()
    }

    /// Outcome of the most recent verification cycle.
    pub fn last_verify_record(&self) -> VerifyRecord {
        *self.last_verify.lock()
    }

    fn ensure_sync_components(&self, resource_type: &str) -> Result<(), DistroError> {
        if self.registry.find_data_storage(resource_type).is_none()
            || self.registry.find_transport_agent(resource_type).is_none()
        {
            return Err(DistroError::UnregisteredType(resource_type.to_string()));
        }
        Ok(())
    }

    fn pool(&self) -> Result<Arc<WorkerPool>, DistroError> {
        self.services
            .lock()
            .as_ref()
            .map(|services| services.pool.clone())
            .ok_or(DistroError::NotRunning)
    }
}

impl Drop for DistroProtocol {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Everything a fired sync task needs to execute and, on failure, retry.
struct ExecuteContext {
    registry: Arc<ComponentRegistry>,
    delay_queue: DelayTaskQueue,
    statistics: ProtocolStatistics,
    rpc_timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
}

/// Moves fired delay tasks onto their worker lanes.
async fn run_task_pump(
    fired: flume::Receiver<DelayTask>,
    pool: Arc<WorkerPool>,
    ctx: Arc<ExecuteContext>,
) {
    while let Ok(task) = fired.recv_async().await {
        let key = task.key.clone();
        if pool.dispatch(&key, execute_sync_task(ctx.clone(), task)).is_err() {
            break;
        }
    }
    debug!("Sync task pump stopped.");
}

/// Pushes one key's current content to its target peer.
async fn execute_sync_task(ctx: Arc<ExecuteContext>, task: DelayTask) {
    let Some(target) = task.key.target() else {
        warn!(key = %task.key, "Sync task fired without a target peer.");
        return;
    };

    let resource_type = task.key.resource_type();
    let Some(transport) = ctx.registry.find_transport_agent(resource_type) else {
        error!(
            resource_type = %resource_type,
            "Transport agent disappeared from the registry; dropping sync task."
        );
        return;
    };

    let data = match task.operation {
        DataOperation::Delete => DistroData::new(
            task.key.untargeted(),
            DataOperation::Delete,
            Vec::new(),
        ),
        _ => {
            let Some(storage) = ctx.registry.find_data_storage(resource_type) else {
                error!(
                    resource_type = %resource_type,
                    "Data storage disappeared from the registry; dropping sync task."
                );
                return;
            };
            match storage.get_distro_data(&task.key.untargeted()).await {
                Ok(Some(data)) => {
                    let payload = data.into_payload();
                    DistroData::new(task.key.untargeted(), task.operation, payload)
                },
                // The key vanished between scheduling and firing; the delete
                // task that removed it handles the peers.
                Ok(None) => {
                    debug!(key = %task.key, "Key no longer in storage; skipping push.");
                    return;
                },
                Err(e) => {
                    error!(error = ?e, key = %task.key, "Failed to read storage for push.");
                    handle_failed_task(&ctx, task).await;
                    return;
                },
            }
        },
    };

    let res = match timeout(ctx.rpc_timeout, transport.sync_data(target, data)).await {
        Ok(res) => res,
        Err(_) => Err(TransportError::Timeout(target, ctx.rpc_timeout)),
    };

    match res {
        Ok(()) => {
            ctx.statistics
                .sync_sends_success
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            debug!(key = %task.key, target_addr = %target, "Pushed change to peer.");
        },
        Err(e) => {
            ctx.statistics
                .sync_sends_failed
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            warn!(
                error = ?e,
                key = %task.key,
                target_addr = %target,
                "Failed to push change to peer."
            );
            handle_failed_task(&ctx, task).await;
        },
    }
}

async fn handle_failed_task(ctx: &ExecuteContext, task: DelayTask) {
    let attempts = task.attempts + 1;

    // A registered handler owns the retry policy for its type.
    if let Some(handler) = ctx.registry.find_failed_task_handler(task.key.resource_type()) {
        handler.retry(task.key, task.operation, attempts).await;
        return;
    }

    if attempts > ctx.max_retries {
        ctx.statistics
            .retries_exhausted
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        error!(
            key = %task.key,
            attempts = attempts,
            "Dropping sync task after exhausting retries. \
            The next verification cycle will repair the divergence."
        );
        return;
    }

    let delay = backoff_delay(ctx.retry_backoff, attempts);
    ctx.delay_queue
        .add_retry_task(task.key, task.operation, attempts, delay);
}

fn backoff_delay(base: Duration, attempts: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempts.min(6));
    let jitter = rand::thread_rng().gen_range(0..=50);
    exp + Duration::from_millis(jitter)
}

/// Pulls one key's authoritative content from `source` and applies it.
async fn pull_and_apply(
    transport: Arc<dyn TransportAgent>,
    processor: Arc<dyn DataProcessor>,
    source: SocketAddr,
    key: DistroKey,
    rpc_timeout: Duration,
) {
    let res = match timeout(rpc_timeout, transport.get_data(source, key.clone())).await {
        Ok(res) => res,
        Err(_) => Err(TransportError::Timeout(source, rpc_timeout)),
    };

    match res {
        Ok(data) => {
            let apply = match data.operation() {
                DataOperation::Delete => processor.process_data(data).await,
                _ => processor.process_snapshot(data).await,
            };
            if let Err(e) = apply {
                error!(error = ?e, key = %key, "Failed to apply pulled data.");
            }
        },
        Err(e) => {
            warn!(
                error = ?e,
                key = %key,
                source = %source,
                "Failed to pull authoritative data; the next verification cycle will retry."
            );
        },
    }
}

/// Feeds membership snapshots into the responsibility mapper.
///
/// The snapshot is replaced wholesale so ownership flips atomically for
/// every reader.
async fn watch_membership_changes(
    mut changes: WatchStream<MemberList>,
    mapper: Arc<ResponsibilityMapper>,
) {
    while let Some(members) = changes.next().await {
        info!(num_members = members.len(), "Cluster membership has changed.");
        mapper.update(members);
    }
}

/// One-shot startup warm-up: pull a full snapshot of every registered type
/// from the first reachable peer.
///
/// Failure here is not fatal - the node simply converges through the normal
/// verification cycles instead.
async fn load_initial_snapshot(
    registry: Arc<ComponentRegistry>,
    peers: Vec<Member>,
    rpc_timeout: Duration,
) {
    if peers.is_empty() {
        return;
    }

    for resource_type in registry.registered_types() {
        let Some(transport) = registry.find_transport_agent(&resource_type) else {
            continue;
        };
        let Some(processor) = registry.find_data_processor(&resource_type) else {
            continue;
        };

        for peer in &peers {
            let target = peer.addr();
            let res = match timeout(rpc_timeout, transport.get_datum_snapshot(target)).await {
                Ok(res) => res,
                Err(_) => Err(TransportError::Timeout(target, rpc_timeout)),
            };

            match res {
                Ok(batch) => {
                    let num_loaded = batch.len();
                    for data in batch {
                        if let Err(e) = processor.process_snapshot(data).await {
                            warn!(error = ?e, "Failed to apply snapshot entry during startup load.");
                        }
                    }
                    info!(
                        resource_type = %resource_type,
                        source = %target,
                        num_loaded = num_loaded,
                        "Loaded initial snapshot from peer."
                    );
                    break;
                },
                Err(e) => {
                    warn!(
                        error = ?e,
                        target_addr = %target,
                        resource_type = %resource_type,
                        "Snapshot load failed; trying next peer."
                    );
                },
            }
        }
    }
}
