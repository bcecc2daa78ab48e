use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, broadcast};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use pywren_client_core::config::{ComputeConfig, Config, extract_compute_config};
use pywren_client_core::keys::CallId;

use crate::api::{CallHandle, DispatchMode, InvokerEvent, InvokerOptions, JobError, JobSpec};
use crate::backend::{BackendPool, ComputeHandler, InternalStorage, RuntimeMeta};
use crate::board::CompletionBoard;
use crate::fifo::ConcurrentFifo;
use crate::invoke::{InvokePool, JobContext, WorkItem, invoke_call};
use crate::runtime::{RuntimeError, RuntimeSelector};
use crate::watcher::spawn_watcher;

/// Unit of dispatch permission. One token lets one pending call move to
/// dispatch.
pub(crate) struct Token;

/// State shared between the job runner, the dispatch loop, the invoke tasks
/// and the completion watchers.
pub(crate) struct InvokerShared {
    pub(crate) executor_id: String,
    pub(crate) workers: u32,
    pub(crate) config_value: serde_json::Value,
    pub(crate) log_level: Option<String>,
    pub(crate) storage: Arc<dyn InternalStorage>,
    pub(crate) backends: BackendPool,
    pub(crate) token_bucket: ConcurrentFifo<Token>,
    pub(crate) pending_calls: ConcurrentFifo<WorkItem>,
    pub(crate) invoke_pool: InvokePool,
    pub(crate) poll_tick: Duration,
    pub(crate) watcher_retries: u32,
    pub(crate) max_dispatch_attempts: u32,
    pub(crate) rabbitmq_monitor: bool,
    pub(crate) amqp_url: Option<String>,
    stop_flag: AtomicBool,
    stop_notify: Notify,
    event_tx: broadcast::Sender<InvokerEvent>,
}

impl InvokerShared {
    pub(crate) fn emit(&self, event: InvokerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn should_stop(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }

    async fn next_token(&self) -> Option<Token> {
        loop {
            // Register for the stop wakeup before checking the flag so a
            // stop between the check and the await is not lost.
            let stopped = self.stop_notify.notified();
            if self.should_stop() {
                return None;
            }
            tokio::select! {
                _ = stopped => continue,
                token = self.token_bucket.take() => return Some(token),
            }
        }
    }

    async fn next_pending(&self) -> Option<WorkItem> {
        loop {
            let stopped = self.stop_notify.notified();
            if self.should_stop() {
                return None;
            }
            tokio::select! {
                _ = stopped => continue,
                item = self.pending_calls.take() => return Some(item),
            }
        }
    }
}

enum DispatchHandle {
    Task(tokio::task::JoinHandle<()>),
    Thread(std::thread::JoinHandle<()>),
}

/// Whether this process is itself running inside a FaaS function (nested
/// fan-out), detected from the environment the remote runtimes set.
pub fn running_inside_faas() -> bool {
    std::env::var_os("PYWREN_FUNCTION").is_some()
}

fn spawn_dispatch(
    shared: Arc<InvokerShared>,
    mode: DispatchMode,
) -> anyhow::Result<DispatchHandle> {
    let mode = match mode {
        DispatchMode::Auto => {
            if running_inside_faas() {
                DispatchMode::Task
            } else {
                DispatchMode::Thread
            }
        }
        other => other,
    };
    match mode {
        DispatchMode::Auto | DispatchMode::Task => {
            let handle = tokio::runtime::Handle::try_current().map_err(|_| {
                anyhow::anyhow!("cooperative dispatch requires a running tokio runtime")
            })?;
            Ok(DispatchHandle::Task(handle.spawn(dispatch_loop(shared))))
        }
        DispatchMode::Thread => {
            let thread = std::thread::Builder::new()
                .name("pywren-dispatch".to_string())
                .spawn(move || {
                    match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(runtime) => runtime.block_on(dispatch_loop(shared)),
                        Err(err) => error!("failed to build dispatch runtime: {err:#}"),
                    }
                })?;
            Ok(DispatchHandle::Thread(thread))
        }
    }
}

/// Token-bucket scheduling loop: pair one token with one pending call and
/// hand the pair to the invoke pool.
async fn dispatch_loop(shared: Arc<InvokerShared>) {
    debug!(executor_id = %shared.executor_id, "invoker dispatcher started");
    loop {
        let Some(_token) = shared.next_token().await else {
            break;
        };
        let Some(item) = shared.next_pending().await else {
            break;
        };
        shared.invoke_pool.submit(shared.clone(), item).await;
    }
    debug!(executor_id = %shared.executor_id, "invoker dispatcher finished");
    shared.emit(InvokerEvent::Stopped);
}

/// Drives the calls of submitted jobs against the compute backend under a
/// bounded-concurrency discipline.
///
/// At most `workers` activations are outstanding at once: the first calls of
/// a job on an idle invoker are dispatched directly, every further call waits
/// in the pending queue for a token produced by a remote completion.
pub struct FunctionInvoker {
    config: Arc<Config>,
    language_version: String,
    shared: Arc<InvokerShared>,
    runtimes: RuntimeSelector,
    ongoing_activations: AtomicU32,
    _dispatch: DispatchHandle,
}

impl FunctionInvoker {
    /// Construct an invoker and start its dispatch loop.
    ///
    /// `handler_factory` is called once per configured region with that
    /// region's compute projection. `language_version` is the version the
    /// serialized functions target; it is checked against every runtime.
    pub fn new<F>(
        config: Config,
        executor_id: impl Into<String>,
        storage: Arc<dyn InternalStorage>,
        handler_factory: F,
        language_version: impl Into<String>,
        options: InvokerOptions,
    ) -> anyhow::Result<Self>
    where
        F: Fn(ComputeConfig) -> anyhow::Result<Arc<dyn ComputeHandler>>,
    {
        let executor_id = executor_id.into();
        let compute = extract_compute_config(&config);
        let backends = BackendPool::from_config(&compute, handler_factory)?;
        let workers = config.pywren.workers;
        debug!(executor_id = %executor_id, workers, "total workers");

        let max_dispatch_attempts = if config.pywren.invocation_retry {
            config.pywren.retries + 1
        } else {
            1
        };

        let (event_tx, _) = broadcast::channel(1024);
        let shared = Arc::new(InvokerShared {
            executor_id,
            workers,
            config_value: config.to_value(),
            log_level: std::env::var("PYWREN_LOGLEVEL").ok(),
            storage,
            backends,
            token_bucket: ConcurrentFifo::new(),
            pending_calls: ConcurrentFifo::new(),
            invoke_pool: InvokePool::new(options.background_pool_size),
            poll_tick: options.poll_tick,
            watcher_retries: config.pywren.retries,
            max_dispatch_attempts,
            rabbitmq_monitor: config.pywren.rabbitmq_monitor,
            amqp_url: config.rabbitmq.amqp_url.clone(),
            stop_flag: AtomicBool::new(false),
            stop_notify: Notify::new(),
            event_tx,
        });

        let dispatch = spawn_dispatch(shared.clone(), options.dispatch_mode)?;
        shared.emit(InvokerEvent::Started);

        Ok(Self {
            config: Arc::new(config),
            language_version: language_version.into(),
            shared,
            runtimes: RuntimeSelector::new(),
            ongoing_activations: AtomicU32::new(0),
            _dispatch: dispatch,
        })
    }

    /// Identifier of the executor this invoker serves.
    pub fn executor_id(&self) -> &str {
        &self.shared.executor_id
    }

    /// Configured cap of outstanding activations.
    pub fn workers(&self) -> u32 {
        self.shared.workers
    }

    /// Activations issued since the last stale-token drain.
    pub fn ongoing_activations(&self) -> u32 {
        self.ongoing_activations.load(Ordering::SeqCst)
    }

    /// Subscribe to the invoker event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<InvokerEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Ensure the configured runtime is deployed and compatible on every
    /// backend, deploying it where missing. Returns the runtime metadata of
    /// the last backend checked.
    pub async fn select_runtime(
        &self,
        job_id: &str,
        runtime_memory: Option<u32>,
    ) -> Result<RuntimeMeta, RuntimeError> {
        let runtime_name = self.config.pywren.runtime.clone();
        let memory = runtime_memory.unwrap_or(self.config.pywren.runtime_memory);
        let deploy_timeout = Duration::from_secs(self.config.pywren.runtime_timeout);
        info!(
            executor_id = %self.shared.executor_id,
            job_id,
            runtime = %runtime_name,
            memory,
            "selected runtime"
        );

        let mut selected: Option<RuntimeMeta> = None;
        for handler in self.shared.backends.iter() {
            selected = Some(
                self.runtimes
                    .ensure_deployed(
                        handler,
                        &self.shared.storage,
                        &runtime_name,
                        memory,
                        deploy_timeout,
                        &self.language_version,
                    )
                    .await?,
            );
        }
        Ok(selected.expect("backend pool is never empty"))
    }

    /// Submit a job: validate it, make sure its runtime is usable, dispatch
    /// the first wave directly, queue the rest, start the completion
    /// watcher, and return one handle per call.
    pub async fn run(&self, spec: JobSpec) -> Result<Vec<CallHandle>, JobError> {
        spec.validate()?;
        self.select_runtime(&spec.job_id, Some(spec.runtime_memory))
            .await?;

        let total = spec.total_calls;
        if total == 0 {
            info!(
                executor_id = %self.shared.executor_id,
                job_id = %spec.job_id,
                "job has no calls, nothing to invoke"
            );
            return Ok(Vec::new());
        }

        // Reclaim headroom left by completions that arrived after the
        // previous job's dispatch had already saturated.
        let mut drained: u32 = 0;
        while self.shared.token_bucket.try_take().is_some() {
            drained += 1;
        }
        if drained > 0 {
            let _ = self
                .ongoing_activations
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                    Some(v.saturating_sub(drained))
                });
        }

        let spec = Arc::new(spec);
        let board = Arc::new(CompletionBoard::new(spec.job_id.clone(), total));
        let ctx = Arc::new(JobContext {
            spec: spec.clone(),
            board: board.clone(),
        });

        if spec.remote_invocation {
            info!(
                executor_id = %self.shared.executor_id,
                job_id = %spec.job_id,
                func = %spec.func_name,
                spawners = total,
                total_activations = spec.original_total_calls,
                "starting remote invocation"
            );
        } else {
            info!(
                executor_id = %self.shared.executor_id,
                job_id = %spec.job_id,
                func = %spec.func_name,
                total_activations = total,
                "starting function invocation"
            );
        }

        let ongoing = self.ongoing_activations.load(Ordering::SeqCst);
        let workers = self.shared.workers;
        let direct = if ongoing < workers {
            total.min(workers - ongoing)
        } else {
            0
        };
        self.shared.emit(InvokerEvent::JobStarted {
            job_id: spec.job_id.clone(),
            total_calls: total,
            direct_calls: direct,
        });

        if direct > 0 {
            let threads = spec.invoke_pool_threads.max(1);
            let mut burst = JoinSet::new();
            for index in 0..direct {
                while burst.len() >= threads {
                    let _ = burst.join_next().await;
                }
                let shared = self.shared.clone();
                let item = WorkItem {
                    ctx: ctx.clone(),
                    call_id: CallId::new(index),
                    attempt: 1,
                };
                burst.spawn(async move {
                    invoke_call(&shared, item).await;
                });
            }
            // Block until the whole first wave has finished dispatching.
            while burst.join_next().await.is_some() {}
            self.ongoing_activations.fetch_add(direct, Ordering::SeqCst);
        }

        for index in direct..total {
            self.shared.pending_calls.offer(WorkItem {
                ctx: ctx.clone(),
                call_id: CallId::new(index),
                attempt: 1,
            });
        }

        spawn_watcher(self.shared.clone(), ctx);

        let handles = (0..total)
            .map(|index| CallHandle {
                spec: spec.clone(),
                call_id: CallId::new(index),
                board: board.clone(),
            })
            .collect();
        Ok(handles)
    }

    /// Request the dispatch loop to stop. In-flight invocations are not
    /// cancelled; the backend has already accepted them.
    pub fn stop(&self) {
        if !self.shared.stop_flag.swap(true, Ordering::SeqCst) {
            debug!(executor_id = %self.shared.executor_id, "stopping invoker dispatcher");
            self.shared.emit(InvokerEvent::StopRequested);
            self.shared.stop_notify.notify_waiters();
        }
    }
}
