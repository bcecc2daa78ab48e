//! Contracts of the external collaborators: the per-region compute handlers
//! and the internal object store. The engine never talks to a concrete SDK;
//! the embedder supplies implementations of these traits.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use pywren_client_core::config::{ComputeConfig, Region};
use pywren_client_core::keys::CallId;

use crate::api::ByteRange;

/// Opaque backend-issued identifier for one activation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivationId(pub String);

impl fmt::Display for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Runtime metadata blob persisted in the object store.
///
/// Opaque to the engine apart from the remote language version, which gates
/// compatibility with the host that serialized the functions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeMeta {
    /// Language version the remote runtime executes.
    #[serde(default, alias = "language_ver", skip_serializing_if = "Option::is_none")]
    pub python_ver: Option<String>,
    /// Everything else the backend put in the blob.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl RuntimeMeta {
    /// The remote language version, when the blob carries one.
    pub fn language_version(&self) -> Option<&str> {
        self.python_ver.as_deref()
    }
}

/// JSON payload handed to the compute backend for one call.
///
/// The field names are a wire contract with the deployed runtimes.
#[derive(Debug, Clone, Serialize)]
pub struct InvokePayload {
    /// The resolved client configuration.
    pub config: Value,
    /// Log level the runtime should mirror.
    pub log_level: Option<String>,
    /// Object-store key of the serialized function.
    pub func_key: String,
    /// Object-store key of the serialized input data.
    pub data_key: String,
    /// Key the runtime writes its output under.
    pub output_key: String,
    /// Key the runtime writes its status record under.
    pub status_key: String,
    /// Extra environment variables for the runtime.
    pub extra_env: BTreeMap<String, String>,
    /// Execution timeout in seconds.
    pub execution_timeout: u64,
    /// Input byte range for this call.
    pub data_byte_range: ByteRange,
    /// Identifier of the owning executor.
    pub executor_id: String,
    /// Identifier of the job.
    pub job_id: String,
    /// Identifier of the call.
    pub call_id: CallId,
    /// Submission wall-clock time on the host, epoch seconds.
    pub host_submit_time: f64,
    /// Client version, for the runtime's compatibility checks.
    #[serde(rename = "pywren_version")]
    pub client_version: String,
}

/// Per-region client to a compute backend.
#[async_trait]
pub trait ComputeHandler: Send + Sync {
    /// Dispatch one call. `Ok(None)` is a transient rejection the engine may
    /// retry; `Err` is a hard failure surfaced to the call's handle. The
    /// handler applies its own internal retry policy before returning.
    async fn invoke(
        &self,
        runtime_name: &str,
        runtime_memory: u32,
        payload: &InvokePayload,
    ) -> anyhow::Result<Option<ActivationId>>;

    /// Deploy a runtime and return its metadata blob.
    async fn create_runtime(
        &self,
        runtime_name: &str,
        runtime_memory: u32,
        timeout: Duration,
    ) -> anyhow::Result<RuntimeMeta>;

    /// Storage key under which this handler's runtime metadata lives.
    fn runtime_key(&self, runtime_name: &str, runtime_memory: u32) -> String;
}

/// Object-store facade holding runtime metadata and job status records.
#[async_trait]
pub trait InternalStorage: Send + Sync {
    /// Fetch a runtime metadata blob. Any error means "not deployed".
    async fn get_runtime_meta(&self, runtime_key: &str) -> anyhow::Result<RuntimeMeta>;

    /// Persist a runtime metadata blob.
    async fn put_runtime_meta(&self, runtime_key: &str, meta: &RuntimeMeta) -> anyhow::Result<()>;

    /// The set of calls of a job that have written their status record.
    async fn get_job_status(
        &self,
        executor_id: &str,
        job_id: &str,
    ) -> anyhow::Result<HashSet<CallId>>;
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum BackendPoolError {
    #[error("no compute handlers configured")]
    Empty,
}

/// One compute handler per configured region, with uniform random selection
/// per invocation to spread load without coordination.
pub(crate) struct BackendPool {
    handlers: Vec<Arc<dyn ComputeHandler>>,
}

impl std::fmt::Debug for BackendPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendPool")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl BackendPool {
    pub(crate) fn from_config<F>(compute: &ComputeConfig, factory: F) -> anyhow::Result<Self>
    where
        F: Fn(ComputeConfig) -> anyhow::Result<Arc<dyn ComputeHandler>>,
    {
        let mut handlers = Vec::new();
        match &compute.region {
            Some(Region::Many(regions)) => {
                for region in regions {
                    handlers.push(factory(compute.with_region(region))?);
                }
            }
            _ => handlers.push(factory(compute.clone())?),
        }
        if handlers.is_empty() {
            return Err(BackendPoolError::Empty.into());
        }
        Ok(Self { handlers })
    }

    pub(crate) fn select(&self) -> &Arc<dyn ComputeHandler> {
        let idx = rand::rng().random_range(0..self.handlers.len());
        &self.handlers[idx]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<dyn ComputeHandler>> {
        self.handlers.iter()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pywren_client_core::config::{Config, extract_compute_config};

    struct NullHandler;

    #[async_trait]
    impl ComputeHandler for NullHandler {
        async fn invoke(
            &self,
            _runtime_name: &str,
            _runtime_memory: u32,
            _payload: &InvokePayload,
        ) -> anyhow::Result<Option<ActivationId>> {
            Ok(None)
        }

        async fn create_runtime(
            &self,
            _runtime_name: &str,
            _runtime_memory: u32,
            _timeout: Duration,
        ) -> anyhow::Result<RuntimeMeta> {
            anyhow::bail!("unused")
        }

        fn runtime_key(&self, runtime_name: &str, runtime_memory: u32) -> String {
            format!("{runtime_name}/{runtime_memory}")
        }
    }

    fn config(region_line: &str) -> Config {
        Config::from_yaml_str(&format!(
            "pywren:\n  workers: 10\n  runtime: python3.8\n  runtime_memory: 256\n  runtime_timeout: 600\n{region_line}"
        ))
        .unwrap()
    }

    #[test]
    fn region_list_expands_to_one_handler_each() {
        let cfg = config("  compute_backend_region: [us-east, us-south, eu-gb]\n");
        let compute = extract_compute_config(&cfg);
        let pool = BackendPool::from_config(&compute, |cc| {
            assert!(matches!(cc.region, Some(Region::One(_))));
            Ok(Arc::new(NullHandler) as Arc<dyn ComputeHandler>)
        })
        .unwrap();
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn single_region_yields_a_single_handler() {
        let cfg = config("  compute_backend_region: us-east\n");
        let compute = extract_compute_config(&cfg);
        let pool = BackendPool::from_config(&compute, |_| {
            Ok(Arc::new(NullHandler) as Arc<dyn ComputeHandler>)
        })
        .unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn empty_region_list_is_rejected() {
        let cfg = config("  compute_backend_region: []\n");
        let compute = extract_compute_config(&cfg);
        let err = BackendPool::from_config(&compute, |_| {
            Ok(Arc::new(NullHandler) as Arc<dyn ComputeHandler>)
        })
        .unwrap_err();
        assert!(err.to_string().contains("no compute handlers"));
    }
}
