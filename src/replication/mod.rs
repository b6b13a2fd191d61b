mod delay;
mod executor;
mod verifier;

/// Upper bound on in-flight RPCs per broadcast fan-out.
pub(crate) const MAX_CONCURRENT_REQUESTS: usize = 10;

pub(crate) use delay::{start_delay_task_engine, DelayEngineContext, DelayTask, DelayTaskQueue};
pub(crate) use executor::WorkerPool;
pub(crate) use verifier::{start_verify_cycle, VerifyCycleContext, VerifyHandle};
