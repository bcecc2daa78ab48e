//! End-to-end scenarios for the invocation engine, driven against
//! in-process compute and storage collaborators.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use pywren_client_core::keys::CallId;
use pywren_client_engine::{
    ActivationId, ByteRange, CallError, CallState, ComputeHandler, DispatchMode, FunctionInvoker,
    InternalStorage, InvokePayload, InvokerEvent, InvokerOptions, JobError, JobSpec, RuntimeError,
    RuntimeMeta,
};
use pywren_client_core::config::Config;

const LOCAL_VERSION: &str = "3.8";

/// Shared in-memory stand-in for the remote cluster: job status records,
/// runtime metadata, and bookkeeping counters for assertions.
struct MockWorld {
    remote_version: String,
    complete_after: Option<Duration>,
    fail_status_polls: bool,
    status: Mutex<HashMap<(String, String), HashSet<CallId>>>,
    meta: Mutex<HashMap<String, RuntimeMeta>>,
    status_polls: AtomicU32,
    dispatched: AtomicU32,
    completed: AtomicU32,
    max_outstanding: AtomicU32,
    last_payload: Mutex<Option<serde_json::Value>>,
}

impl MockWorld {
    fn new(complete_after: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            remote_version: LOCAL_VERSION.to_string(),
            complete_after,
            fail_status_polls: false,
            status: Mutex::new(HashMap::new()),
            meta: Mutex::new(HashMap::new()),
            status_polls: AtomicU32::new(0),
            dispatched: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            max_outstanding: AtomicU32::new(0),
            last_payload: Mutex::new(None),
        })
    }

    fn complete(&self, executor_id: &str, job_id: &str, call_id: CallId) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.status
            .lock()
            .unwrap()
            .entry((executor_id.to_string(), job_id.to_string()))
            .or_default()
            .insert(call_id);
    }
}

struct MockHandler {
    name: String,
    world: Arc<MockWorld>,
    invocations: Mutex<Vec<CallId>>,
    reject_once: Mutex<HashSet<CallId>>,
    reject_always: Mutex<HashSet<CallId>>,
    seq: AtomicU64,
}

impl MockHandler {
    fn new(name: &str, world: &Arc<MockWorld>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            world: world.clone(),
            invocations: Mutex::new(Vec::new()),
            reject_once: Mutex::new(HashSet::new()),
            reject_always: Mutex::new(HashSet::new()),
            seq: AtomicU64::new(0),
        })
    }

    fn invocation_count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }
}

#[async_trait]
impl ComputeHandler for MockHandler {
    async fn invoke(
        &self,
        _runtime_name: &str,
        _runtime_memory: u32,
        payload: &InvokePayload,
    ) -> anyhow::Result<Option<ActivationId>> {
        self.invocations.lock().unwrap().push(payload.call_id);
        *self.world.last_payload.lock().unwrap() = Some(serde_json::to_value(payload)?);

        if self.reject_always.lock().unwrap().contains(&payload.call_id) {
            return Ok(None);
        }
        if self.reject_once.lock().unwrap().remove(&payload.call_id) {
            return Ok(None);
        }

        let dispatched = self.world.dispatched.fetch_add(1, Ordering::SeqCst) + 1;
        let outstanding = dispatched.saturating_sub(self.world.completed.load(Ordering::SeqCst));
        self.world
            .max_outstanding
            .fetch_max(outstanding, Ordering::SeqCst);

        if let Some(delay) = self.world.complete_after {
            let world = self.world.clone();
            let executor_id = payload.executor_id.clone();
            let job_id = payload.job_id.clone();
            let call_id = payload.call_id;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                world.complete(&executor_id, &job_id, call_id);
            });
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        Ok(Some(ActivationId(format!("act-{}-{seq}", self.name))))
    }

    async fn create_runtime(
        &self,
        _runtime_name: &str,
        _runtime_memory: u32,
        _timeout: Duration,
    ) -> anyhow::Result<RuntimeMeta> {
        Ok(RuntimeMeta {
            python_ver: Some(self.world.remote_version.clone()),
            extra: serde_json::Map::new(),
        })
    }

    fn runtime_key(&self, runtime_name: &str, runtime_memory: u32) -> String {
        format!("{}/{runtime_name}_{runtime_memory}MB", self.name)
    }
}

struct MockStorage {
    world: Arc<MockWorld>,
}

#[async_trait]
impl InternalStorage for MockStorage {
    async fn get_runtime_meta(&self, runtime_key: &str) -> anyhow::Result<RuntimeMeta> {
        self.world
            .meta
            .lock()
            .unwrap()
            .get(runtime_key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("not deployed"))
    }

    async fn put_runtime_meta(&self, runtime_key: &str, meta: &RuntimeMeta) -> anyhow::Result<()> {
        self.world
            .meta
            .lock()
            .unwrap()
            .insert(runtime_key.to_string(), meta.clone());
        Ok(())
    }

    async fn get_job_status(
        &self,
        executor_id: &str,
        job_id: &str,
    ) -> anyhow::Result<HashSet<CallId>> {
        self.world.status_polls.fetch_add(1, Ordering::SeqCst);
        if self.world.fail_status_polls {
            anyhow::bail!("storage unavailable");
        }
        Ok(self
            .world
            .status
            .lock()
            .unwrap()
            .get(&(executor_id.to_string(), job_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

fn test_config(workers: u32, extra: &str) -> Config {
    Config::from_yaml_str(&format!(
        "pywren:\n  workers: {workers}\n  runtime: python3.8\n  runtime_memory: 256\n  runtime_timeout: 600\n{extra}"
    ))
    .unwrap()
}

fn test_options() -> InvokerOptions {
    InvokerOptions {
        poll_tick: Duration::from_millis(10),
        dispatch_mode: DispatchMode::Task,
        ..InvokerOptions::default()
    }
}

fn new_invoker(
    config: Config,
    world: &Arc<MockWorld>,
    handlers: Vec<Arc<MockHandler>>,
) -> FunctionInvoker {
    let storage = Arc::new(MockStorage {
        world: world.clone(),
    });
    let queue = Mutex::new(handlers.into_iter().collect::<VecDeque<_>>());
    FunctionInvoker::new(
        config,
        "ex1",
        storage,
        move |_compute| {
            let handler = queue
                .lock()
                .unwrap()
                .pop_front()
                .expect("factory called more often than handlers were provided");
            Ok(handler as Arc<dyn ComputeHandler>)
        },
        LOCAL_VERSION,
        test_options(),
    )
    .unwrap()
}

fn job(job_id: &str, total_calls: u32) -> JobSpec {
    JobSpec {
        executor_id: "ex1".to_string(),
        job_id: job_id.to_string(),
        total_calls,
        func_key: "pywren.jobs/ex1/agg/func.pickle".to_string(),
        data_key: "pywren.jobs/ex1/agg/data.pickle".to_string(),
        data_ranges: (0..u64::from(total_calls))
            .map(|i| ByteRange(i * 100, (i + 1) * 100 - 1))
            .collect(),
        runtime_name: "python3.8".to_string(),
        runtime_memory: 256,
        execution_timeout: 600,
        extra_env: BTreeMap::new(),
        metadata: serde_json::Value::Null,
        invoke_pool_threads: 8,
        remote_invocation: false,
        func_name: "map_fn".to_string(),
        original_total_calls: total_calls,
    }
}

async fn wait_all(handles: &[pywren_client_engine::CallHandle]) {
    for handle in handles {
        timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("call did not resolve in time")
            .expect("call failed");
    }
}

fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<InvokerEvent>) -> Vec<InvokerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn cold_idle_job_goes_entirely_through_the_direct_burst() {
    let world = MockWorld::new(Some(Duration::from_millis(20)));
    let handler = MockHandler::new("main", &world);
    let invoker = new_invoker(test_config(100, ""), &world, vec![handler.clone()]);

    let handles = invoker.run(job("A000", 10)).await.unwrap();
    assert_eq!(handles.len(), 10);
    assert_eq!(invoker.ongoing_activations(), 10);
    // The whole first wave fits under the worker cap, so dispatch happens
    // synchronously inside `run`.
    assert_eq!(handler.invocation_count(), 10);

    let ids: Vec<String> = handles.iter().map(|h| h.call_id().to_string()).collect();
    assert_eq!(ids[0], "00000");
    assert_eq!(ids[9], "00009");
    assert_eq!(
        handles[3].output_key(),
        "pywren.jobs/ex1/A000/00003/output.pickle"
    );
    assert_eq!(
        handles[3].status_key(),
        "pywren.jobs/ex1/A000/00003/status.json"
    );

    wait_all(&handles).await;
    assert_eq!(handles[0].state(), CallState::Done);
    assert_eq!(invoker.ongoing_activations(), 10);
}

#[tokio::test]
async fn saturated_pool_feeds_queued_calls_one_per_completion() {
    let world = MockWorld::new(Some(Duration::from_millis(15)));
    let handler = MockHandler::new("main", &world);
    let invoker = new_invoker(test_config(4, ""), &world, vec![handler.clone()]);

    let handles = invoker.run(job("A001", 12)).await.unwrap();
    assert_eq!(invoker.ongoing_activations(), 4);
    assert_eq!(handler.invocation_count(), 4);

    wait_all(&handles).await;
    assert_eq!(handler.invocation_count(), 12);
    // Never more activations outstanding than the configured worker cap.
    assert!(world.max_outstanding.load(Ordering::SeqCst) <= 4);
}

#[tokio::test]
async fn transiently_rejected_call_is_requeued_and_eventually_dispatched() {
    let world = MockWorld::new(Some(Duration::from_millis(15)));
    let handler = MockHandler::new("main", &world);
    handler.reject_once.lock().unwrap().insert(CallId::new(0));
    let invoker = new_invoker(test_config(2, ""), &world, vec![handler.clone()]);
    let mut events = invoker.subscribe();

    let handles = invoker.run(job("A002", 3)).await.unwrap();
    wait_all(&handles).await;

    // One extra invoke for the rejected first attempt of call 00000.
    assert_eq!(handler.invocation_count(), 4);
    let activations: HashSet<String> = handles
        .iter()
        .map(|h| h.activation_id().expect("call was dispatched").to_string())
        .collect();
    assert_eq!(activations.len(), 3);

    let seen = drain_events(&mut events);
    assert!(seen.iter().any(|e| matches!(
        e,
        InvokerEvent::CallRequeued { call_id, attempt: 1, .. } if *call_id == CallId::new(0)
    )));
}

#[tokio::test]
async fn exhausted_dispatch_budget_fails_the_call_and_the_watcher_terminates() {
    let world = MockWorld::new(Some(Duration::from_millis(10)));
    let handler = MockHandler::new("main", &world);
    handler.reject_always.lock().unwrap().insert(CallId::new(1));
    // retries: 1 allows two dispatch attempts per call before it is failed.
    let invoker = new_invoker(test_config(5, "  retries: 1\n"), &world, vec![handler.clone()]);
    let mut events = invoker.subscribe();

    let handles = invoker.run(job("A011", 3)).await.unwrap();

    for surviving in [0usize, 2] {
        timeout(Duration::from_secs(5), handles[surviving].wait())
            .await
            .expect("surviving call did not resolve in time")
            .expect("surviving call failed");
    }
    let rejected = timeout(Duration::from_secs(5), handles[1].wait())
        .await
        .expect("rejected call did not resolve after its budget ran out");
    assert!(matches!(
        rejected,
        Err(CallError::CallFailed { call_id, .. }) if call_id == CallId::new(1)
    ));
    assert_eq!(handles[1].state(), CallState::Failed);
    assert!(handles[1].activation_id().is_none());

    // The failed call never writes a status record, yet the watcher must
    // still terminate once every call has reached a terminal state.
    let seen = timeout(Duration::from_secs(5), async {
        let mut seen = Vec::new();
        loop {
            match events.recv().await {
                Ok(InvokerEvent::JobCompleted { job_id }) if job_id == "A011" => break,
                Ok(event) => seen.push(event),
                Err(err) => panic!("event stream closed: {err}"),
            }
        }
        seen
    })
    .await
    .expect("watcher never terminated for a job with a failed call");

    assert!(seen.iter().any(|e| matches!(
        e,
        InvokerEvent::CallFailed { call_id, .. } if *call_id == CallId::new(1)
    )));
    // Two attempts for call 00001, one each for the others.
    assert_eq!(handler.invocation_count(), 4);
}

#[tokio::test]
async fn invocations_spread_across_regions() {
    let world = MockWorld::new(Some(Duration::from_millis(1)));
    let east = MockHandler::new("us-east", &world);
    let south = MockHandler::new("us-south", &world);
    let config = test_config(500, "  compute_backend_region: [us-east, us-south]\n");
    let invoker = new_invoker(config, &world, vec![east.clone(), south.clone()]);

    let mut spec = job("A003", 200);
    spec.invoke_pool_threads = 32;
    let handles = invoker.run(spec).await.unwrap();
    wait_all(&handles).await;

    let east_count = east.invocation_count();
    let south_count = south.invocation_count();
    assert_eq!(east_count + south_count, 200);
    // Uniform random selection: a heavy skew would mean a broken pool.
    assert!(east_count >= 40, "us-east saw only {east_count} invocations");
    assert!(south_count >= 40, "us-south saw only {south_count} invocations");
}

#[tokio::test]
async fn version_mismatch_aborts_before_any_dispatch() {
    let mut world = MockWorld::new(Some(Duration::from_millis(10)));
    Arc::get_mut(&mut world).unwrap().remote_version = "3.7".to_string();
    let handler = MockHandler::new("main", &world);
    let invoker = new_invoker(test_config(10, ""), &world, vec![handler.clone()]);

    let err = invoker.run(job("A004", 5)).await.unwrap_err();
    assert!(matches!(
        err,
        JobError::Runtime(RuntimeError::Incompatible { .. })
    ));
    assert_eq!(handler.invocation_count(), 0);
    assert_eq!(world.status_polls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_job_produces_no_handles_and_no_watcher() {
    let world = MockWorld::new(Some(Duration::from_millis(10)));
    let handler = MockHandler::new("main", &world);
    let invoker = new_invoker(test_config(10, ""), &world, vec![handler.clone()]);

    let handles = invoker.run(job("A005", 0)).await.unwrap();
    assert!(handles.is_empty());

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(handler.invocation_count(), 0);
    assert_eq!(world.status_polls.load(Ordering::SeqCst), 0);
    assert_eq!(invoker.ongoing_activations(), 0);
}

#[tokio::test]
async fn single_call_job_resolves_and_watcher_terminates() {
    let world = MockWorld::new(Some(Duration::from_millis(10)));
    let handler = MockHandler::new("main", &world);
    let invoker = new_invoker(test_config(8, ""), &world, vec![handler.clone()]);
    let mut events = invoker.subscribe();

    let handles = invoker.run(job("A006", 1)).await.unwrap();
    wait_all(&handles).await;
    assert_eq!(handler.invocation_count(), 1);

    // The watcher emits the completion event once it has seen the one call.
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(InvokerEvent::JobCompleted { job_id }) if job_id == "A006" => break,
                Ok(_) => continue,
                Err(err) => panic!("event stream closed: {err}"),
            }
        }
    })
    .await
    .expect("watcher never finished");
}

#[tokio::test]
async fn stale_tokens_are_drained_at_the_start_of_the_next_job() {
    let world = MockWorld::new(Some(Duration::from_millis(10)));
    let handler = MockHandler::new("main", &world);
    let invoker = new_invoker(test_config(10, ""), &world, vec![handler.clone()]);

    let first = invoker.run(job("A007", 3)).await.unwrap();
    wait_all(&first).await;
    assert_eq!(invoker.ongoing_activations(), 3);

    // Give the dispatcher time to claim its one token; the remaining stale
    // tokens sit in the bucket until the next job reclaims them.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = invoker.run(job("A008", 2)).await.unwrap();
    // 3 issued, 2 reclaimed by the drain (one token is already held by the
    // dispatcher), plus the new direct burst of 2.
    assert_eq!(invoker.ongoing_activations(), 3);
    wait_all(&second).await;
    assert_eq!(handler.invocation_count(), 5);
}

#[tokio::test]
async fn watcher_failure_is_surfaced_to_the_handles() {
    let mut world = MockWorld::new(None);
    Arc::get_mut(&mut world).unwrap().fail_status_polls = true;
    let handler = MockHandler::new("main", &world);
    let invoker = new_invoker(test_config(10, "  retries: 1\n"), &world, vec![handler.clone()]);
    let mut events = invoker.subscribe();

    let handles = invoker.run(job("A009", 2)).await.unwrap();
    for handle in &handles {
        let res = timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("handle did not resolve after the watcher gave up");
        assert!(matches!(res, Err(CallError::JobFailed { .. })));
        assert_eq!(handle.state(), CallState::Failed);
    }

    let seen = drain_events(&mut events);
    assert!(seen
        .iter()
        .any(|e| matches!(e, InvokerEvent::WatcherFailed { .. })));
}

#[tokio::test]
async fn stop_halts_the_dispatch_loop_promptly() {
    let world = MockWorld::new(Some(Duration::from_millis(10)));
    let handler = MockHandler::new("main", &world);
    let invoker = new_invoker(test_config(10, ""), &world, vec![handler]);
    let mut events = invoker.subscribe();

    invoker.stop();
    timeout(Duration::from_secs(1), async {
        loop {
            match events.recv().await {
                Ok(InvokerEvent::Stopped) => break,
                Ok(_) => continue,
                Err(err) => panic!("event stream closed: {err}"),
            }
        }
    })
    .await
    .expect("dispatch loop did not stop in time");
}

#[tokio::test]
async fn payload_carries_the_exact_wire_fields() {
    let world = MockWorld::new(Some(Duration::from_millis(5)));
    let handler = MockHandler::new("main", &world);
    let invoker = new_invoker(test_config(5, ""), &world, vec![handler]);

    let handles = invoker.run(job("A010", 1)).await.unwrap();
    wait_all(&handles).await;

    let payload = world.last_payload.lock().unwrap().clone().unwrap();
    let object = payload.as_object().unwrap();
    let mut keys: Vec<&str> = object.keys().map(String::as_str).collect();
    keys.sort_unstable();
    assert_eq!(
        keys,
        vec![
            "call_id",
            "config",
            "data_byte_range",
            "data_key",
            "execution_timeout",
            "executor_id",
            "extra_env",
            "func_key",
            "host_submit_time",
            "job_id",
            "log_level",
            "output_key",
            "pywren_version",
            "status_key",
        ]
    );
    assert_eq!(object["call_id"], "00000");
    assert_eq!(object["executor_id"], "ex1");
    assert_eq!(object["job_id"], "A010");
    assert_eq!(
        object["output_key"],
        "pywren.jobs/ex1/A010/00000/output.pickle"
    );
    assert_eq!(
        object["status_key"],
        "pywren.jobs/ex1/A010/00000/status.json"
    );
    assert_eq!(object["data_byte_range"], serde_json::json!([0, 99]));
    assert_eq!(object["config"]["pywren"]["workers"], 5);
    assert!(object["host_submit_time"].as_f64().unwrap() > 0.0);
    assert!(object["pywren_version"].is_string());
}
