use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::core::{KeyChecksum, VerifyData};
use crate::error::TransportError;
use crate::mapper::ResponsibilityMapper;
use crate::registry::ComponentRegistry;
use crate::replication::MAX_CONCURRENT_REQUESTS;
use crate::statistics::{ProtocolStatistics, VerifyRecord};

/// The wiring the verification cycle runs against.
pub(crate) struct VerifyCycleContext {
    /// Time between cycles.
    pub(crate) verify_interval: Duration,
    /// Grace period before the first cycle, giving pushes and the startup
    /// snapshot load a chance to settle.
    pub(crate) initial_delay: Duration,
    pub(crate) rpc_timeout: Duration,
    pub(crate) self_addr: SocketAddr,
    pub(crate) mapper: Arc<ResponsibilityMapper>,
    pub(crate) registry: Arc<ComponentRegistry>,
    pub(crate) statistics: ProtocolStatistics,
    pub(crate) last_record: Arc<Mutex<VerifyRecord>>,
}

#[derive(Clone)]
/// A handle for stopping the verification cycle.
///
/// This handle is cheap to clone.
pub(crate) struct VerifyHandle {
    kill_switch: Arc<AtomicBool>,
}

impl VerifyHandle {
    pub(crate) fn kill(&self) {
        self.kill_switch.store(true, Ordering::Relaxed);
    }
}

/// Starts the periodic anti-entropy task.
///
/// Each cycle checksums every key this node owns and broadcasts the batches
/// to all peers. Peers that disagree pull the authoritative data back, so
/// convergence does not depend on any individual push having succeeded.
pub(crate) fn start_verify_cycle(ctx: VerifyCycleContext) -> VerifyHandle {
    let kill_switch = Arc::new(AtomicBool::new(false));

    tokio::spawn(verify_cycle(ctx, kill_switch.clone()));

    VerifyHandle { kill_switch }
}

async fn verify_cycle(ctx: VerifyCycleContext, kill_switch: Arc<AtomicBool>) {
    info!("Verification cycle is running.");

    tokio::time::sleep(ctx.initial_delay).await;

    let mut interval = interval(ctx.verify_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;

        if kill_switch.load(Ordering::Relaxed) {
            break;
        }

        let record = run_cycle(&ctx).await;

        *ctx.last_record.lock() = record;
        ctx.statistics.verify_cycles.fetch_add(1, Ordering::Relaxed);

        if record.attempted > 0 {
            debug!(
                attempted = record.attempted,
                succeeded = record.succeeded,
                failed = record.failed,
                "Verification cycle completed."
            );
        }
    }

    info!("Verification cycle stopped.");
}

async fn run_cycle(ctx: &VerifyCycleContext) -> VerifyRecord {
    let mut record = VerifyRecord::default();

    let peers = ctx.mapper.members().peers(ctx.self_addr);
    if peers.is_empty() {
        return record;
    }

    for resource_type in ctx.registry.registered_types() {
        let Some(storage) = ctx.registry.find_data_storage(&resource_type) else {
            continue;
        };
        let Some(transport) = ctx.registry.find_transport_agent(&resource_type) else {
            warn!(
                resource_type = %resource_type,
                "Resource type has storage but no transport agent; skipping verification."
            );
            continue;
        };

        let snapshot = match storage.get_datum_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(
                    error = ?e,
                    resource_type = %resource_type,
                    "Failed to snapshot storage for verification."
                );
                continue;
            },
        };

        let checksums: Vec<KeyChecksum> = snapshot
            .iter()
            .filter(|data| ctx.mapper.responsible(data.key().resource_key()))
            .map(|data| KeyChecksum {
                resource_key: data.key().resource_key().to_string(),
                checksum: data.checksum(),
            })
            .collect();

        // An empty batch is still broadcast: peers holding keys this node
        // owned previously use the batch to notice those keys are gone.
        let limiter = Arc::new(Semaphore::new(MAX_CONCURRENT_REQUESTS));
        let mut requests = peers
            .iter()
            .map(|peer| {
                let target = peer.addr();
                let transport = transport.clone();
                let limiter = limiter.clone();
                let data = VerifyData {
                    resource_type: resource_type.clone(),
                    source: ctx.self_addr,
                    checksums: checksums.clone(),
                };
                let rpc_timeout = ctx.rpc_timeout;
                async move {
                    let _permit = limiter.acquire().await;
                    let res = match timeout(rpc_timeout, transport.sync_verify_data(target, data))
                        .await
                    {
                        Ok(res) => res,
                        Err(_) => Err(TransportError::Timeout(target, rpc_timeout)),
                    };
                    (target, res)
                }
            })
            .collect::<FuturesUnordered<_>>();

        while let Some((target, res)) = requests.next().await {
            record.attempted += 1;
            match res {
                Ok(()) => record.succeeded += 1,
                Err(e) => {
                    record.failed += 1;
                    error!(
                        error = ?e,
                        target_addr = %target,
                        resource_type = %resource_type,
                        "Failed to send verification batch to peer. \
                        The peer will be retried next cycle."
                    );
                },
            }
        }
    }

    record
}
