//! Public API types for the invocation engine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use pywren_client_core::keys::{self, CallId, JOBS_PREFIX};

use crate::backend::ActivationId;
use crate::board::CompletionBoard;
use crate::runtime::RuntimeError;

/// Byte range `[start, end]` of the input partition handed to one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange(pub u64, pub u64);

/// Immutable description of one job of N independent calls.
///
/// Produced by the job builder; the engine only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Identifier of the executor that owns this job.
    pub executor_id: String,
    /// Job identifier, unique within the executor.
    pub job_id: String,
    /// Number of calls in the job.
    pub total_calls: u32,
    /// Object-store key of the serialized function.
    pub func_key: String,
    /// Object-store key of the serialized input data.
    pub data_key: String,
    /// One input byte range per call, indexed by call number.
    pub data_ranges: Vec<ByteRange>,
    /// Runtime the calls execute on.
    pub runtime_name: String,
    /// Runtime memory in MB.
    pub runtime_memory: u32,
    /// Per-call execution timeout in seconds.
    pub execution_timeout: u64,
    /// Extra environment variables forwarded to the runtime.
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,
    /// Opaque job metadata, echoed on every call handle.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Parallelism of the direct burst at job start.
    pub invoke_pool_threads: usize,
    /// Whether this job itself fans out further remote invocations.
    #[serde(default)]
    pub remote_invocation: bool,
    /// Name of the user function, for log lines only.
    pub func_name: String,
    /// Call count before remote-invocation fan-out, for log lines only.
    #[serde(default)]
    pub original_total_calls: u32,
}

impl JobSpec {
    pub(crate) fn validate(&self) -> Result<(), JobError> {
        if self.data_ranges.len() != self.total_calls as usize {
            return Err(JobError::DataRangeMismatch {
                job_id: self.job_id.clone(),
                expected: self.total_calls,
                got: self.data_ranges.len(),
            });
        }
        Ok(())
    }
}

/// How the dispatch loop is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Pick [`DispatchMode::Task`] when running inside a FaaS function
    /// (nested invocation), [`DispatchMode::Thread`] otherwise.
    #[default]
    Auto,
    /// Cooperative task on the caller's runtime.
    Task,
    /// Dedicated OS thread with its own single-threaded runtime, so a
    /// dispatcher crash is isolated from the caller.
    Thread,
}

/// Tunables for one invoker instance.
#[derive(Debug, Clone)]
pub struct InvokerOptions {
    /// Interval between job-status polls of the storage watcher.
    pub poll_tick: Duration,
    /// Concurrency cap of the background invoke pool.
    pub background_pool_size: usize,
    /// How the dispatch loop is scheduled.
    pub dispatch_mode: DispatchMode,
}

impl InvokerOptions {
    /// Default storage-watcher poll interval.
    pub const DEFAULT_POLL_TICK: Duration = Duration::from_millis(100);

    /// Default concurrency cap of the background invoke pool.
    pub const DEFAULT_BACKGROUND_POOL_SIZE: usize = 500;
}

impl Default for InvokerOptions {
    fn default() -> Self {
        Self {
            poll_tick: Self::DEFAULT_POLL_TICK,
            background_pool_size: Self::DEFAULT_BACKGROUND_POOL_SIZE,
            dispatch_mode: DispatchMode::Auto,
        }
    }
}

/// Invoker event stream payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum InvokerEvent {
    /// Invoker constructed; dispatch loop running.
    Started,
    /// Graceful stop requested.
    StopRequested,
    /// A job was submitted.
    JobStarted {
        /// Job identifier.
        job_id: String,
        /// Number of calls in the job.
        total_calls: u32,
        /// How many calls went through the direct burst.
        direct_calls: u32,
    },
    /// One call was accepted by the compute backend.
    CallDispatched {
        /// Job identifier.
        job_id: String,
        /// Call identifier.
        call_id: CallId,
        /// Backend-issued activation id.
        activation_id: ActivationId,
        /// Invoke round-trip in milliseconds.
        roundtrip_ms: u64,
    },
    /// One call was transiently rejected and re-enqueued.
    CallRequeued {
        /// Job identifier.
        job_id: String,
        /// Call identifier.
        call_id: CallId,
        /// Dispatch attempts made so far.
        attempt: u32,
    },
    /// One call failed permanently.
    CallFailed {
        /// Job identifier.
        job_id: String,
        /// Call identifier.
        call_id: CallId,
        /// Failure description.
        reason: String,
    },
    /// The completion watcher saw every call of a job reach a terminal
    /// state (completed, or failed its dispatch budget).
    JobCompleted {
        /// Job identifier.
        job_id: String,
    },
    /// The completion watcher gave up on a job.
    WatcherFailed {
        /// Job identifier.
        job_id: String,
        /// Failure description.
        reason: String,
    },
    /// Dispatch loop exited.
    Stopped,
}

/// Lifecycle state of one call, as visible to its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// Dispatched (or queued for dispatch); no completion evidence yet.
    Invoked,
    /// Completion evidence seen.
    Done,
    /// Failed permanently (dispatch budget exhausted, backend hard
    /// failure, or watcher failure).
    Failed,
}

/// Terminal failure of one call, surfaced through its handle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// This specific call failed.
    #[error("call {call_id} failed: {reason}")]
    CallFailed {
        /// Call identifier.
        call_id: CallId,
        /// Failure description.
        reason: String,
    },
    /// The whole job failed (completion watcher gave up).
    #[error("job {job_id} failed: {reason}")]
    JobFailed {
        /// Job identifier.
        job_id: String,
        /// Failure description.
        reason: String,
    },
}

/// Errors raised by job submission before any handle is produced.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The job descriptor is internally inconsistent.
    #[error("job {job_id}: expected {expected} data ranges, got {got}")]
    DataRangeMismatch {
        /// Job identifier.
        job_id: String,
        /// `total_calls` of the descriptor.
        expected: u32,
        /// Length of `data_ranges`.
        got: usize,
    },
    /// Runtime selection failed (deployment or version compatibility).
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Awaitable handle to one call of a submitted job.
///
/// Handles are created in the [`CallState::Invoked`] state before `run`
/// returns and are owned by the caller; dropping one abandons the call
/// without cancelling it.
#[derive(Clone)]
pub struct CallHandle {
    pub(crate) spec: Arc<JobSpec>,
    pub(crate) call_id: CallId,
    pub(crate) board: Arc<CompletionBoard>,
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("executor_id", &self.spec.executor_id)
            .field("job_id", &self.spec.job_id)
            .field("call_id", &self.call_id)
            .field("state", &self.state())
            .finish()
    }
}

impl CallHandle {
    /// Identifier of this call within its job.
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Identifier of the executor that owns the job.
    pub fn executor_id(&self) -> &str {
        &self.spec.executor_id
    }

    /// Identifier of the job.
    pub fn job_id(&self) -> &str {
        &self.spec.job_id
    }

    /// Object-store key the call's output will appear under.
    pub fn output_key(&self) -> String {
        keys::output_key(
            JOBS_PREFIX,
            &self.spec.executor_id,
            &self.spec.job_id,
            self.call_id,
        )
    }

    /// Object-store key the call's status record will appear under.
    pub fn status_key(&self) -> String {
        keys::status_key(
            JOBS_PREFIX,
            &self.spec.executor_id,
            &self.spec.job_id,
            self.call_id,
        )
    }

    /// Job metadata echoed from the descriptor.
    pub fn metadata(&self) -> &serde_json::Value {
        &self.spec.metadata
    }

    /// Backend activation id, once the call has been accepted.
    pub fn activation_id(&self) -> Option<ActivationId> {
        self.board.activation_id(self.call_id)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CallState {
        self.board.state_of(self.call_id)
    }

    /// Wait until completion evidence for this call is seen, or until the
    /// call (or its whole job) fails.
    pub async fn wait(&self) -> Result<(), CallError> {
        self.board.wait(self.call_id).await
    }
}
