use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tokio::time::{interval, MissedTickBehavior};

use crate::core::{DataOperation, DistroKey};
use crate::statistics::ProtocolStatistics;

/// A pending, not yet fired synchronisation task for one targeted key.
///
/// Tasks are immutable values: merging replaces the entry in the pending map
/// rather than mutating it in place.
#[derive(Debug, Clone)]
pub(crate) struct DelayTask {
    pub(crate) key: DistroKey,
    pub(crate) operation: DataOperation,
    pub(crate) fire_at: Instant,
    pub(crate) merged: u32,
    pub(crate) attempts: u32,
}

pub(crate) struct DelayEngineContext {
    /// How long a task waits before firing; refreshed on every merge.
    pub(crate) sync_delay: Duration,
    /// How often the dispatcher scans for due tasks.
    pub(crate) processing_interval: Duration,
    /// Once a task has absorbed this many merges its fire time is pinned, so
    /// sustained churn on one key cannot postpone it forever.
    pub(crate) max_coalesced_ops: u32,
    pub(crate) statistics: ProtocolStatistics,
}

#[derive(Clone)]
/// Handle for feeding tasks into the delay engine.
///
/// This handle is cheap to clone. Adding a task never blocks the caller; the
/// dispatcher loop picks it up on its next tick.
pub(crate) struct DelayTaskQueue {
    tx: Sender<Op>,
    kill_switch: Arc<AtomicBool>,
}

impl DelayTaskQueue {
    /// Schedules a push for `key`, coalescing with any pending task.
    pub(crate) fn add_task(&self, key: DistroKey, operation: DataOperation) {
        let _ = self.tx.send(Op::Task { key, operation });
    }

    /// Re-enters a failed task with an explicit backoff delay.
    pub(crate) fn add_retry_task(
        &self,
        key: DistroKey,
        operation: DataOperation,
        attempts: u32,
        fire_delay: Duration,
    ) {
        let _ = self.tx.send(Op::Retry {
            key,
            operation,
            attempts,
            fire_delay,
        });
    }

    /// Stops the dispatcher loop.
    pub(crate) fn kill(&self) {
        self.kill_switch.store(true, Ordering::Relaxed);
    }
}

enum Op {
    Task {
        key: DistroKey,
        operation: DataOperation,
    },
    Retry {
        key: DistroKey,
        operation: DataOperation,
        attempts: u32,
        fire_delay: Duration,
    },
}

/// Starts the delay task engine.
///
/// Returns the ingress handle and the stream of fired tasks, which the
/// orchestrator turns into worker-lane jobs.
pub(crate) fn start_delay_task_engine(
    ctx: DelayEngineContext,
) -> (DelayTaskQueue, flume::Receiver<DelayTask>) {
    let kill_switch = Arc::new(AtomicBool::new(false));
    let (tx, rx) = unbounded();
    let (fired_tx, fired_rx) = flume::unbounded();

    tokio::spawn(delay_task_engine(ctx, rx, fired_tx, kill_switch.clone()));

    (DelayTaskQueue { tx, kill_switch }, fired_rx)
}

async fn delay_task_engine(
    ctx: DelayEngineContext,
    rx: Receiver<Op>,
    fired_tx: flume::Sender<DelayTask>,
    kill_switch: Arc<AtomicBool>,
) {
    debug!("Delay task engine is running.");

    let mut pending: HashMap<DistroKey, DelayTask> = HashMap::new();
    let mut interval = interval(ctx.processing_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;

        if kill_switch.load(Ordering::Relaxed) {
            break;
        }

        while let Ok(op) = rx.try_recv() {
            register_op(&mut pending, op, &ctx);
        }

        let now = Instant::now();
        let due: Vec<DistroKey> = pending
            .iter()
            .filter(|(_, task)| task.fire_at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in due {
            if let Some(task) = pending.remove(&key) {
                if fired_tx.send_async(task).await.is_err() {
                    return;
                }
            }
        }
    }

    debug!("Delay task engine stopped.");
}

fn register_op(pending: &mut HashMap<DistroKey, DelayTask>, op: Op, ctx: &DelayEngineContext) {
    let now = Instant::now();
    match op {
        Op::Task { key, operation } => match pending.remove(&key) {
            None => {
                ctx.statistics
                    .sync_tasks_submitted
                    .fetch_add(1, Ordering::Relaxed);
                pending.insert(
                    key.clone(),
                    DelayTask {
                        key,
                        operation,
                        fire_at: now + ctx.sync_delay,
                        merged: 0,
                        attempts: 0,
                    },
                );
            },
            Some(existing) => {
                let operation = merge_operations(existing.operation, operation);
                let merged = existing.merged.saturating_add(1);
                let fire_at = if merged < ctx.max_coalesced_ops {
                    now + ctx.sync_delay
                } else {
                    existing.fire_at
                };

                ctx.statistics
                    .sync_tasks_coalesced
                    .fetch_add(1, Ordering::Relaxed);
                pending.insert(
                    key.clone(),
                    DelayTask {
                        key,
                        operation,
                        fire_at,
                        merged,
                        // A fresh local change supersedes any retry state.
                        attempts: 0,
                    },
                );
            },
        },
        Op::Retry {
            key,
            operation,
            attempts,
            fire_delay,
        } => {
            // A pending task already covers this key with newer local state;
            // the retry has nothing left to add.
            if pending.contains_key(&key) {
                return;
            }
            pending.insert(
                key.clone(),
                DelayTask {
                    key,
                    operation,
                    fire_at: now + fire_delay,
                    merged: 0,
                    attempts,
                },
            );
        },
    }
}

fn merge_operations(existing: DataOperation, new: DataOperation) -> DataOperation {
    match (existing, new) {
        // A delete cancels whatever was pending; only the delete fires.
        (_, DataOperation::Delete) => DataOperation::Delete,
        // The peer has not seen the key yet, so the task stays an add. The
        // payload is read from storage at fire time either way.
        (DataOperation::Add, _) => DataOperation::Add,
        (_, new) => new,
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;

    fn ctx(sync_delay: Duration, max_coalesced_ops: u32) -> DelayEngineContext {
        DelayEngineContext {
            sync_delay,
            processing_interval: Duration::from_millis(10),
            max_coalesced_ops,
            statistics: ProtocolStatistics::default(),
        }
    }

    fn key(name: &str) -> DistroKey {
        let target: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        DistroKey::with_target(name, "ephemeral-instances", target)
    }

    #[test]
    fn rapid_operations_coalesce_into_one_task() {
        let ctx = ctx(Duration::from_millis(100), 64);
        let mut pending = HashMap::new();

        for operation in [
            DataOperation::Add,
            DataOperation::Change,
            DataOperation::Change,
        ] {
            register_op(
                &mut pending,
                Op::Task {
                    key: key("svc-1"),
                    operation,
                },
                &ctx,
            );
        }

        assert_eq!(pending.len(), 1);
        let task = pending.get(&key("svc-1")).unwrap();
        assert_eq!(task.operation, DataOperation::Add);
        assert_eq!(task.merged, 2);
        assert_eq!(ctx.statistics.sync_tasks_submitted(), 1);
        assert_eq!(ctx.statistics.sync_tasks_coalesced(), 2);
    }

    #[test]
    fn delete_supersedes_pending_add() {
        let ctx = ctx(Duration::from_millis(100), 64);
        let mut pending = HashMap::new();

        register_op(
            &mut pending,
            Op::Task {
                key: key("svc-1"),
                operation: DataOperation::Add,
            },
            &ctx,
        );
        register_op(
            &mut pending,
            Op::Task {
                key: key("svc-1"),
                operation: DataOperation::Delete,
            },
            &ctx,
        );

        assert_eq!(pending.len(), 1);
        assert_eq!(
            pending.get(&key("svc-1")).unwrap().operation,
            DataOperation::Delete,
        );
    }

    #[test]
    fn merge_extends_the_fire_time() {
        let ctx = ctx(Duration::from_millis(100), 64);
        let mut pending = HashMap::new();

        register_op(
            &mut pending,
            Op::Task {
                key: key("svc-1"),
                operation: DataOperation::Change,
            },
            &ctx,
        );
        let first_fire = pending.get(&key("svc-1")).unwrap().fire_at;

        std::thread::sleep(Duration::from_millis(20));
        register_op(
            &mut pending,
            Op::Task {
                key: key("svc-1"),
                operation: DataOperation::Change,
            },
            &ctx,
        );
        let second_fire = pending.get(&key("svc-1")).unwrap().fire_at;

        assert!(second_fire > first_fire);
    }

    #[test]
    fn coalescing_bound_pins_the_fire_time() {
        let ctx = ctx(Duration::from_millis(100), 3);
        let mut pending = HashMap::new();

        for _ in 0..10 {
            register_op(
                &mut pending,
                Op::Task {
                    key: key("svc-1"),
                    operation: DataOperation::Change,
                },
                &ctx,
            );
        }
        let pinned = pending.get(&key("svc-1")).unwrap().fire_at;

        std::thread::sleep(Duration::from_millis(20));
        register_op(
            &mut pending,
            Op::Task {
                key: key("svc-1"),
                operation: DataOperation::Change,
            },
            &ctx,
        );

        // Past the merge bound the fire time no longer moves.
        assert_eq!(pending.get(&key("svc-1")).unwrap().fire_at, pinned);
    }

    #[test]
    fn retry_yields_to_pending_local_change() {
        let ctx = ctx(Duration::from_millis(100), 64);
        let mut pending = HashMap::new();

        register_op(
            &mut pending,
            Op::Task {
                key: key("svc-1"),
                operation: DataOperation::Change,
            },
            &ctx,
        );
        register_op(
            &mut pending,
            Op::Retry {
                key: key("svc-1"),
                operation: DataOperation::Change,
                attempts: 2,
                fire_delay: Duration::from_millis(500),
            },
            &ctx,
        );

        // The retry must not clobber the fresh task's attempt count.
        assert_eq!(pending.get(&key("svc-1")).unwrap().attempts, 0);
    }

    #[test]
    fn distinct_targets_keep_distinct_tasks() {
        let ctx = ctx(Duration::from_millis(100), 64);
        let mut pending = HashMap::new();

        let target_a: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let target_b: SocketAddr = "127.0.0.1:9002".parse().unwrap();
        for target in [target_a, target_b] {
            register_op(
                &mut pending,
                Op::Task {
                    key: DistroKey::with_target("svc-1", "ephemeral-instances", target),
                    operation: DataOperation::Change,
                },
                &ctx,
            );
        }

        assert_eq!(pending.len(), 2);
        assert_eq!(ctx.statistics.sync_tasks_submitted(), 2);
    }

    #[tokio::test]
    async fn dispatcher_fires_tasks_after_the_delay() {
        let statistics = ProtocolStatistics::default();
        let (queue, fired) = start_delay_task_engine(DelayEngineContext {
            sync_delay: Duration::from_millis(50),
            processing_interval: Duration::from_millis(10),
            max_coalesced_ops: 64,
            statistics,
        });

        queue.add_task(key("svc-1"), DataOperation::Add);
        queue.add_task(key("svc-1"), DataOperation::Change);

        let task = tokio::time::timeout(Duration::from_secs(2), fired.recv_async())
            .await
            .expect("task should fire within the window")
            .expect("engine should still be running");

        assert_eq!(task.key, key("svc-1"));
        assert_eq!(task.operation, DataOperation::Add);

        // Nothing else was pending.
        assert!(fired.try_recv().is_err());
        queue.kill();
    }
}
