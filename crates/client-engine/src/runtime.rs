use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use crate::backend::{ComputeHandler, InternalStorage, RuntimeMeta};

/// Errors raised while selecting or deploying a runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The remote runtime executes a different language version than the
    /// host that serialized the functions. Fatal for the job.
    #[error(
        "runtime {runtime:?} is running {remote} and is not compatible with the local {local} version"
    )]
    Incompatible {
        /// Runtime name.
        runtime: String,
        /// Remote language version.
        remote: String,
        /// Host language version.
        local: String,
    },
    /// Deploying the runtime on the backend failed.
    #[error("failed to deploy runtime {runtime:?}: {source}")]
    Deploy {
        /// Runtime name.
        runtime: String,
        /// Underlying backend error.
        #[source]
        source: anyhow::Error,
    },
    /// Persisting the runtime metadata failed.
    #[error("failed to persist runtime metadata under {runtime_key:?}: {source}")]
    PersistMeta {
        /// Storage key of the metadata blob.
        runtime_key: String,
        /// Underlying storage error.
        #[source]
        source: anyhow::Error,
    },
    /// The metadata blob carries no language version to check against.
    #[error("runtime metadata under {runtime_key:?} has no language version")]
    MissingVersion {
        /// Storage key of the metadata blob.
        runtime_key: String,
    },
}

/// Lazily deploys runtimes and validates language-version compatibility.
///
/// Deployment happens in the hot path of the first job to use a
/// (runtime, memory) pair, so each `runtime_key` is guarded by a
/// single-flight lock: concurrent first jobs install once.
pub(crate) struct RuntimeSelector {
    deployed: Mutex<HashMap<String, RuntimeMeta>>,
    flights: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RuntimeSelector {
    pub(crate) fn new() -> Self {
        Self {
            deployed: Mutex::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn ensure_deployed(
        &self,
        handler: &Arc<dyn ComputeHandler>,
        storage: &Arc<dyn InternalStorage>,
        runtime_name: &str,
        runtime_memory: u32,
        deploy_timeout: Duration,
        local_version: &str,
    ) -> Result<RuntimeMeta, RuntimeError> {
        let runtime_key = handler.runtime_key(runtime_name, runtime_memory);
        if let Some(meta) = self.deployed.lock().await.get(&runtime_key) {
            return Ok(meta.clone());
        }

        let flight = {
            let mut flights = self.flights.lock().await;
            flights
                .entry(runtime_key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = flight.lock().await;

        // A concurrent caller may have finished the install while we waited.
        if let Some(meta) = self.deployed.lock().await.get(&runtime_key) {
            return Ok(meta.clone());
        }

        let meta = match storage.get_runtime_meta(&runtime_key).await {
            Ok(meta) => meta,
            Err(_) => {
                debug!(
                    runtime = runtime_name,
                    memory = runtime_memory,
                    "runtime not yet installed, deploying"
                );
                let meta = handler
                    .create_runtime(runtime_name, runtime_memory, deploy_timeout)
                    .await
                    .map_err(|source| RuntimeError::Deploy {
                        runtime: runtime_name.to_string(),
                        source,
                    })?;
                storage
                    .put_runtime_meta(&runtime_key, &meta)
                    .await
                    .map_err(|source| RuntimeError::PersistMeta {
                        runtime_key: runtime_key.clone(),
                        source,
                    })?;
                meta
            }
        };

        let remote = meta
            .language_version()
            .ok_or_else(|| RuntimeError::MissingVersion {
                runtime_key: runtime_key.clone(),
            })?;
        if remote != local_version {
            return Err(RuntimeError::Incompatible {
                runtime: runtime_name.to_string(),
                remote: remote.to_string(),
                local: local_version.to_string(),
            });
        }

        self.deployed.lock().await.insert(runtime_key, meta.clone());
        Ok(meta)
    }
}
