use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use pywren_client_core::keys::{self, CallId, JOBS_PREFIX};

use crate::api::{InvokerEvent, JobSpec};
use crate::backend::InvokePayload;
use crate::board::CompletionBoard;
use crate::invoker::InvokerShared;

/// Everything an invoke task needs to know about the job it serves.
pub(crate) struct JobContext {
    pub(crate) spec: Arc<JobSpec>,
    pub(crate) board: Arc<CompletionBoard>,
}

/// One unit of dispatch work: a call of a job, plus how often it has been
/// attempted already.
pub(crate) struct WorkItem {
    pub(crate) ctx: Arc<JobContext>,
    pub(crate) call_id: CallId,
    pub(crate) attempt: u32,
}

/// Bounded-parallelism executor for the background dispatch path.
pub(crate) struct InvokePool {
    permits: Arc<Semaphore>,
}

impl InvokePool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity.max(1))),
        }
    }

    /// Spawn the invocation of `item`, waiting for a slot when saturated.
    pub(crate) async fn submit(&self, shared: Arc<InvokerShared>, item: WorkItem) {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("invoke pool semaphore closed");
        tokio::spawn(async move {
            let _permit = permit;
            invoke_call(&shared, item).await;
        });
    }
}

/// Perform one dispatch attempt against a randomly selected handler.
///
/// An empty activation id is a transient rejection: the item goes back onto
/// the pending queue (taking a future token) until its attempt budget runs
/// out. A handler error is a hard failure surfaced to the call's handle.
pub(crate) async fn invoke_call(shared: &InvokerShared, item: WorkItem) -> Option<CallId> {
    let spec = &item.ctx.spec;
    let call_id = item.call_id;
    let payload = build_payload(shared, spec, call_id);

    let handler = shared.backends.select();
    let started = Instant::now();
    match handler
        .invoke(&spec.runtime_name, spec.runtime_memory, &payload)
        .await
    {
        Ok(Some(activation_id)) => {
            let roundtrip_ms = started.elapsed().as_millis() as u64;
            debug!(
                executor_id = %spec.executor_id,
                job_id = %spec.job_id,
                %call_id,
                %activation_id,
                roundtrip_ms,
                "function invocation done"
            );
            item.ctx.board.record_dispatch(call_id, activation_id.clone());
            shared.emit(InvokerEvent::CallDispatched {
                job_id: spec.job_id.clone(),
                call_id,
                activation_id,
                roundtrip_ms,
            });
            Some(call_id)
        }
        Ok(None) => {
            if item.attempt >= shared.max_dispatch_attempts {
                let reason = format!("dispatch rejected after {} attempts", item.attempt);
                warn!(job_id = %spec.job_id, %call_id, "{reason}");
                item.ctx.board.fail_call(call_id, reason.clone());
                shared.emit(InvokerEvent::CallFailed {
                    job_id: spec.job_id.clone(),
                    call_id,
                    reason,
                });
            } else {
                debug!(
                    job_id = %spec.job_id,
                    %call_id,
                    attempt = item.attempt,
                    "dispatch rejected, re-enqueueing"
                );
                shared.emit(InvokerEvent::CallRequeued {
                    job_id: spec.job_id.clone(),
                    call_id,
                    attempt: item.attempt,
                });
                shared.pending_calls.offer(WorkItem {
                    ctx: item.ctx.clone(),
                    call_id,
                    attempt: item.attempt + 1,
                });
            }
            None
        }
        Err(err) => {
            let reason = format!("invoke failed: {err:#}");
            warn!(job_id = %spec.job_id, %call_id, "{reason}");
            item.ctx.board.fail_call(call_id, reason.clone());
            shared.emit(InvokerEvent::CallFailed {
                job_id: spec.job_id.clone(),
                call_id,
                reason,
            });
            None
        }
    }
}

fn build_payload(shared: &InvokerShared, spec: &JobSpec, call_id: CallId) -> InvokePayload {
    InvokePayload {
        config: shared.config_value.clone(),
        log_level: shared.log_level.clone(),
        func_key: spec.func_key.clone(),
        data_key: spec.data_key.clone(),
        output_key: keys::output_key(JOBS_PREFIX, &spec.executor_id, &spec.job_id, call_id),
        status_key: keys::status_key(JOBS_PREFIX, &spec.executor_id, &spec.job_id, call_id),
        extra_env: spec.extra_env.clone(),
        execution_timeout: spec.execution_timeout,
        data_byte_range: spec.data_ranges[call_id.index()],
        executor_id: spec.executor_id.clone(),
        job_id: spec.job_id.clone(),
        call_id,
        host_submit_time: Utc::now().timestamp_micros() as f64 / 1e6,
        client_version: env!("CARGO_PKG_VERSION").to_string(),
    }
}
