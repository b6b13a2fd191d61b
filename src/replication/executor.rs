use std::future::Future;
use std::pin::Pin;

use tokio::sync::oneshot;

use crate::core::DistroKey;
use crate::error::DistroError;

type LaneJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

enum Job {
    Run(LaneJob),
    Stop,
}

/// A fixed set of key-sharded worker lanes.
///
/// A key always maps to the same lane, so all work for one key - pushes,
/// verification-triggered pulls and inbound applies - executes strictly in
/// dispatch order, while different keys run in parallel across lanes. This is
/// the only serialization mechanism in the engine; there is no global lock.
pub(crate) struct WorkerPool {
    lanes: Vec<flume::Sender<Job>>,
}

impl WorkerPool {
    pub(crate) fn start(num_lanes: usize) -> Self {
        let lanes = (0..num_lanes.max(1))
            .map(|lane_id| {
                let (tx, rx) = flume::unbounded();
                tokio::spawn(lane_worker(lane_id, rx));
                tx
            })
            .collect();

        Self { lanes }
    }

    fn lane_for(&self, key: &DistroKey) -> &flume::Sender<Job> {
        let index = key.lane_hash() as usize % self.lanes.len();
        &self.lanes[index]
    }

    /// Queues a job on the key's lane, fire and forget.
    pub(crate) fn dispatch(
        &self,
        key: &DistroKey,
        job: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), DistroError> {
        self.lane_for(key)
            .send(Job::Run(Box::pin(job)))
            .map_err(|_| DistroError::NotRunning)
    }

    /// Queues a job on the key's lane and awaits its result.
    ///
    /// Used by the inbound surface so an acknowledgement is only produced
    /// after the data has actually been applied.
    pub(crate) async fn execute<T, F>(&self, key: &DistroKey, job: F) -> Result<T, DistroError>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.dispatch(key, async move {
            let _ = tx.send(job.await);
        })?;

        rx.await.map_err(|_| DistroError::NotRunning)
    }

    /// Asks every lane to stop once its queued work is done.
    pub(crate) fn shutdown(&self) {
        for lane in &self.lanes {
            let _ = lane.send(Job::Stop);
        }
    }
}

async fn lane_worker(lane_id: usize, rx: flume::Receiver<Job>) {
    while let Ok(job) = rx.recv_async().await {
        match job {
            Job::Run(fut) => fut.await,
            Job::Stop => break,
        }
    }
    debug!(lane_id = lane_id, "Worker lane stopped.");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;

    fn key(name: &str) -> DistroKey {
        DistroKey::new(name, "ephemeral-instances")
    }

    #[tokio::test]
    async fn same_key_jobs_run_in_dispatch_order() {
        let pool = WorkerPool::start(4);
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100usize {
            let seen = seen.clone();
            pool.dispatch(&key("svc-1"), async move {
                // Yield so out-of-order execution would actually show up.
                tokio::task::yield_now().await;
                seen.lock().push(i);
            })
            .unwrap();
        }

        let done = pool
            .execute(&key("svc-1"), async {})
            .await
            .map(|_| true)
            .unwrap_or(false);
        assert!(done);

        let seen = seen.lock();
        assert_eq!(*seen, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn execute_returns_the_job_result() {
        let pool = WorkerPool::start(2);
        let value = pool.execute(&key("svc-1"), async { 7usize }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn different_keys_use_their_own_lanes() {
        let pool = WorkerPool::start(8);

        // A slow job on one key must not delay another key's lane for long.
        pool.dispatch(&key("slow"), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .unwrap();

        // At least one other key hashes away from the blocked lane.
        let mut finished = false;
        for i in 0..16 {
            let name = format!("fast-{i}");
            let res = tokio::time::timeout(
                Duration::from_millis(500),
                pool.execute(&key(&name), async { () }),
            )
            .await;
            if res.is_ok() {
                finished = true;
                break;
            }
        }
        assert!(finished, "every key landed on the blocked lane");
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let pool = WorkerPool::start(1);
        pool.shutdown();

        // Give the worker a moment to observe the stop signal.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let res = pool.execute(&key("svc-1"), async {}).await;
        assert!(matches!(res, Err(DistroError::NotRunning)));
    }
}
