//! In-process compute and storage collaborators for the simulation mode.
//!
//! A "call" here is a timer: the handler accepts the payload, waits the
//! configured duration on a background task, then writes the call into the
//! job status record exactly like a real runtime would.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use pywren_client_core::config::{ComputeConfig, Region};
use pywren_client_core::keys::CallId;
use pywren_client_engine::{
    ActivationId, ComputeHandler, InternalStorage, InvokePayload, RuntimeMeta,
};

/// Language version the loopback runtimes pretend to run.
pub const LOOPBACK_VERSION: &str = "3.8";

/// Shared state of the simulated cluster.
pub struct LoopbackWorld {
    call_duration: Duration,
    flaky_every: u32,
    status: Mutex<HashMap<(String, String), HashSet<CallId>>>,
    meta: Mutex<HashMap<String, RuntimeMeta>>,
    rejected_once: Mutex<HashSet<(String, CallId)>>,
    next_activation: AtomicU64,
}

impl LoopbackWorld {
    pub fn new(call_duration: Duration, flaky_every: u32) -> Arc<Self> {
        Arc::new(Self {
            call_duration,
            flaky_every,
            status: Mutex::new(HashMap::new()),
            meta: Mutex::new(HashMap::new()),
            rejected_once: Mutex::new(HashSet::new()),
            next_activation: AtomicU64::new(0),
        })
    }

    fn status_lock(&self) -> MutexGuard<'_, HashMap<(String, String), HashSet<CallId>>> {
        self.status.lock().expect("loopback status lock poisoned")
    }

    /// Whether this dispatch attempt should be transiently rejected: the
    /// first attempt of every `flaky_every`-th call is.
    fn should_reject(&self, job_id: &str, call_id: CallId) -> bool {
        if self.flaky_every == 0 {
            return false;
        }
        if (call_id.index() as u32) % self.flaky_every != 0 {
            return false;
        }
        self.rejected_once
            .lock()
            .expect("loopback reject lock poisoned")
            .insert((job_id.to_string(), call_id))
    }

    fn complete(&self, executor_id: &str, job_id: &str, call_id: CallId) {
        self.status_lock()
            .entry((executor_id.to_string(), job_id.to_string()))
            .or_default()
            .insert(call_id);
    }
}

/// One simulated region of the compute backend.
pub struct LoopbackHandler {
    region: String,
    world: Arc<LoopbackWorld>,
}

impl LoopbackHandler {
    /// Build the handler for one expanded region projection.
    pub fn create(compute: &ComputeConfig, world: Arc<LoopbackWorld>) -> Arc<dyn ComputeHandler> {
        let region = match &compute.region {
            Some(Region::One(region)) => region.clone(),
            _ => "local".to_string(),
        };
        Arc::new(Self { region, world })
    }
}

#[async_trait]
impl ComputeHandler for LoopbackHandler {
    async fn invoke(
        &self,
        _runtime_name: &str,
        _runtime_memory: u32,
        payload: &InvokePayload,
    ) -> anyhow::Result<Option<ActivationId>> {
        if self.world.should_reject(&payload.job_id, payload.call_id) {
            return Ok(None);
        }

        let world = self.world.clone();
        let executor_id = payload.executor_id.clone();
        let job_id = payload.job_id.clone();
        let call_id = payload.call_id;
        tokio::spawn(async move {
            tokio::time::sleep(world.call_duration).await;
            world.complete(&executor_id, &job_id, call_id);
        });

        let seq = self.world.next_activation.fetch_add(1, Ordering::Relaxed);
        Ok(Some(ActivationId(format!("sim-{}-{seq:08x}", self.region))))
    }

    async fn create_runtime(
        &self,
        _runtime_name: &str,
        _runtime_memory: u32,
        _timeout: Duration,
    ) -> anyhow::Result<RuntimeMeta> {
        Ok(RuntimeMeta {
            python_ver: Some(LOOPBACK_VERSION.to_string()),
            extra: serde_json::Map::new(),
        })
    }

    fn runtime_key(&self, runtime_name: &str, runtime_memory: u32) -> String {
        format!("{}/{runtime_name}_{runtime_memory}MB", self.region)
    }
}

/// Object-store facade backed by the simulated cluster state.
pub struct LoopbackStorage {
    world: Arc<LoopbackWorld>,
}

impl LoopbackStorage {
    pub fn new(world: Arc<LoopbackWorld>) -> Self {
        Self { world }
    }
}

#[async_trait]
impl InternalStorage for LoopbackStorage {
    async fn get_runtime_meta(&self, runtime_key: &str) -> anyhow::Result<RuntimeMeta> {
        self.world
            .meta
            .lock()
            .expect("loopback meta lock poisoned")
            .get(runtime_key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("runtime {runtime_key} is not deployed"))
    }

    async fn put_runtime_meta(&self, runtime_key: &str, meta: &RuntimeMeta) -> anyhow::Result<()> {
        self.world
            .meta
            .lock()
            .expect("loopback meta lock poisoned")
            .insert(runtime_key.to_string(), meta.clone());
        Ok(())
    }

    async fn get_job_status(
        &self,
        executor_id: &str,
        job_id: &str,
    ) -> anyhow::Result<HashSet<CallId>> {
        Ok(self
            .world
            .status_lock()
            .get(&(executor_id.to_string(), job_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}
