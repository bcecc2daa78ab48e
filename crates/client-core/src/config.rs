//! Configuration loading, defaulting and projection.
//!
//! Resolution order: explicit data, then the `CB_CONFIG` environment variable
//! (inline JSON), then the `PYWREN_CONFIG_FILE` path override, then
//! `./.pywren_config`, then `~/.pywren_config`. Backend-specific sections are
//! carried opaquely so they round-trip into the invoke payload unchanged.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default compute backend name.
pub const COMPUTE_BACKEND_DEFAULT: &str = "ibm_cf";
/// Default storage backend name.
pub const STORAGE_BACKEND_DEFAULT: &str = "ibm_cos";
/// Default object-store prefix for job records.
pub const STORAGE_PREFIX_DEFAULT: &str = "pywren.jobs";
/// Default backoff schedule (seconds) forwarded to the compute handlers.
pub const RETRY_SLEEPS_DEFAULT: &[u64] = &[1, 2, 4, 8];
/// Default retry budget for one call's dispatch.
pub const RETRIES_DEFAULT: u32 = 5;

const CONFIG_FILENAME: &str = ".pywren_config";

fn user_agent() -> String {
    format!("pywren-client/{}", env!("CARGO_PKG_VERSION"))
}

/// Errors raised while resolving or validating the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No configuration file could be located.
    #[error("could not find a configuration file")]
    NotFound,
    /// The configuration file exists but could not be read.
    #[error("failed to read {path}: {source}")]
    Unreadable {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The configuration did not parse or did not match the expected shape.
    #[error("malformed configuration: {0}")]
    Malformed(String),
    /// A mandatory top-level section is missing.
    #[error("`{0}` section is mandatory in the configuration")]
    MissingSection(&'static str),
    /// A mandatory key is missing from the `pywren` section.
    #[error("`pywren.{0}` is mandatory in the configuration")]
    MissingKey(&'static str),
    /// `HOME` is unset or empty, so `~/.pywren_config` cannot be resolved.
    #[error("HOME is not set")]
    MissingHome,
}

/// One region name, or several for multi-region fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Region {
    /// A single region.
    One(String),
    /// Several regions, one compute handler each.
    Many(Vec<String>),
}

/// The mandatory `pywren` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PywrenSection {
    /// Storage backend name (selects the opaque section carried for it).
    #[serde(default = "default_storage_backend")]
    pub storage_backend: String,
    /// Bucket used by the storage backend, when it needs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_bucket: Option<String>,
    /// Object-store prefix for job records.
    #[serde(default = "default_storage_prefix")]
    pub storage_prefix: String,
    /// Whether the downstream result reader deletes job records.
    #[serde(default)]
    pub data_cleaner: bool,
    /// Whether transiently rejected dispatches are retried at all.
    #[serde(default = "default_true")]
    pub invocation_retry: bool,
    /// Backoff schedule (seconds) forwarded to the compute handlers.
    #[serde(default = "default_retry_sleeps")]
    pub retry_sleeps: Vec<u64>,
    /// Per-call dispatch retry budget.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Compute backend name (selects the opaque section carried for it).
    #[serde(default = "default_compute_backend")]
    pub compute_backend: String,
    /// Region(s) the compute backend is deployed in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_backend_region: Option<Region>,
    /// Maximum outstanding activations across all jobs of one invoker.
    pub workers: u32,
    /// Runtime name used for every call.
    pub runtime: String,
    /// Runtime memory in MB.
    pub runtime_memory: u32,
    /// Runtime deployment timeout in seconds.
    pub runtime_timeout: u64,
    /// Whether job completions arrive over the message broker.
    #[serde(default)]
    pub rabbitmq_monitor: bool,
    /// Unrecognized `pywren` keys, carried through untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// The optional `rabbitmq` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RabbitSection {
    /// AMQP connection URL; enables the broker completion watcher.
    #[serde(default)]
    pub amqp_url: Option<String>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The mandatory `pywren` section.
    pub pywren: PywrenSection,
    /// The `rabbitmq` section (always present once resolved).
    #[serde(default)]
    pub rabbitmq: RabbitSection,
    /// Backend-specific sections, keyed by backend name.
    #[serde(flatten)]
    pub sections: BTreeMap<String, Value>,
}

fn default_storage_backend() -> String {
    STORAGE_BACKEND_DEFAULT.to_string()
}

fn default_storage_prefix() -> String {
    STORAGE_PREFIX_DEFAULT.to_string()
}

fn default_compute_backend() -> String {
    COMPUTE_BACKEND_DEFAULT.to_string()
}

fn default_retry_sleeps() -> Vec<u64> {
    RETRY_SLEEPS_DEFAULT.to_vec()
}

fn default_retries() -> u32 {
    RETRIES_DEFAULT
}

fn default_true() -> bool {
    true
}

const MANDATORY_KEYS: &[&str] = &["workers", "runtime", "runtime_memory", "runtime_timeout"];

impl Config {
    /// Resolve the configuration: explicit data first, then `CB_CONFIG`,
    /// then the configuration file lookup.
    pub fn resolve(data: Option<Value>) -> Result<Self, ConfigError> {
        if let Some(value) = data {
            return Self::from_value(value);
        }
        if let Ok(inline) = std::env::var("CB_CONFIG") {
            let value = serde_json::from_str(&inline)
                .map_err(|err| ConfigError::Malformed(format!("CB_CONFIG: {err}")))?;
            return Self::from_value(value);
        }
        let path = default_config_path()?;
        if !path.exists() {
            return Err(ConfigError::NotFound);
        }
        Self::load_file(&path)
    }

    /// Load and validate a YAML configuration file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let value: Value =
            serde_yaml::from_str(raw).map_err(|err| ConfigError::Malformed(err.to_string()))?;
        Self::from_value(value)
    }

    /// Validate a raw configuration value and apply defaults.
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let Some(root) = value.as_object() else {
            return Err(ConfigError::Malformed(
                "configuration must be a mapping".to_string(),
            ));
        };
        let Some(pywren) = root.get("pywren") else {
            return Err(ConfigError::MissingSection("pywren"));
        };
        let Some(section) = pywren.as_object() else {
            return Err(ConfigError::Malformed(
                "`pywren` section must be a mapping".to_string(),
            ));
        };
        for key in MANDATORY_KEYS {
            if !section.contains_key(*key) {
                return Err(ConfigError::MissingKey(key));
            }
        }
        serde_json::from_value(value).map_err(|err| ConfigError::Malformed(err.to_string()))
    }

    /// The AMQP URL, when the broker section carries one.
    pub fn amqp_url(&self) -> Option<&str> {
        self.rabbitmq.amqp_url.as_deref()
    }

    /// The resolved configuration as a JSON value (embedded in every payload).
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Compute-backend projection of the configuration.
#[derive(Debug, Clone)]
pub struct ComputeConfig {
    /// Backend name.
    pub backend: String,
    /// Whether transiently rejected dispatches are retried.
    pub invocation_retry: bool,
    /// Backoff schedule (seconds) for the handler's internal retries.
    pub retry_sleeps: Vec<u64>,
    /// Handler-internal retry budget.
    pub retries: u32,
    /// Region(s) this projection targets.
    pub region: Option<Region>,
    /// The backend's own section, with `user_agent` stamped in.
    pub params: Value,
}

impl ComputeConfig {
    /// A copy of this projection pinned to a single region.
    pub fn with_region(&self, region: &str) -> ComputeConfig {
        let mut params = self.params.clone();
        if let Some(map) = params.as_object_mut() {
            map.insert("region".to_string(), Value::String(region.to_string()));
        }
        ComputeConfig {
            region: Some(Region::One(region.to_string())),
            params,
            ..self.clone()
        }
    }
}

/// Storage-backend projection of the configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Backend name.
    pub backend: String,
    /// Object-store prefix for job records.
    pub prefix: String,
    /// Bucket, when the backend needs one.
    pub bucket: Option<String>,
    /// The backend's own section, with `user_agent` stamped in.
    pub params: Value,
}

fn backend_params(config: &Config, backend: &str) -> Value {
    let mut params = config
        .sections
        .get(backend)
        .cloned()
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    if let Some(map) = params.as_object_mut() {
        map.insert("user_agent".to_string(), Value::String(user_agent()));
    }
    params
}

/// Project the compute-backend slice out of a resolved configuration.
pub fn extract_compute_config(config: &Config) -> ComputeConfig {
    let backend = config.pywren.compute_backend.clone();
    let params = backend_params(config, &backend);
    ComputeConfig {
        backend,
        invocation_retry: config.pywren.invocation_retry,
        retry_sleeps: config.pywren.retry_sleeps.clone(),
        retries: config.pywren.retries,
        region: config.pywren.compute_backend_region.clone(),
        params,
    }
}

/// Project the storage-backend slice out of a resolved configuration.
pub fn extract_storage_config(config: &Config) -> StorageConfig {
    let backend = config.pywren.storage_backend.clone();
    let params = backend_params(config, &backend);
    StorageConfig {
        backend,
        prefix: config.pywren.storage_prefix.clone(),
        bucket: config.pywren.storage_bucket.clone(),
        params,
    }
}

/// The configuration file the default lookup would use.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = std::env::var_os("PYWREN_CONFIG_FILE") {
        return Ok(PathBuf::from(path));
    }
    let local = Path::new(CONFIG_FILENAME);
    if local.exists() {
        return Ok(local.to_path_buf());
    }
    Ok(home_dir()?.join(CONFIG_FILENAME))
}

fn home_dir() -> Result<PathBuf, ConfigError> {
    let home = std::env::var_os("HOME").ok_or(ConfigError::MissingHome)?;
    if home.is_empty() {
        return Err(ConfigError::MissingHome);
    }
    Ok(PathBuf::from(home))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
pywren:
  workers: 100
  runtime: python3.8
  runtime_memory: 256
  runtime_timeout: 600
ibm_cf:
  endpoint: https://eu-gb.functions.example.com
  namespace: ns1
"#;

    #[test]
    fn defaults_are_applied() {
        let cfg = Config::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(cfg.pywren.storage_backend, "ibm_cos");
        assert_eq!(cfg.pywren.storage_prefix, "pywren.jobs");
        assert_eq!(cfg.pywren.compute_backend, "ibm_cf");
        assert!(cfg.pywren.invocation_retry);
        assert!(!cfg.pywren.data_cleaner);
        assert_eq!(cfg.pywren.retry_sleeps, vec![1, 2, 4, 8]);
        assert_eq!(cfg.pywren.retries, 5);
        assert!(!cfg.pywren.rabbitmq_monitor);
        assert!(cfg.amqp_url().is_none());
        assert_eq!(cfg.pywren.workers, 100);
    }

    #[test]
    fn pywren_section_is_mandatory() {
        let err = Config::from_yaml_str("ibm_cf:\n  namespace: ns1\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingSection("pywren")));
    }

    #[test]
    fn workers_is_mandatory() {
        let err = Config::from_yaml_str(
            "pywren:\n  runtime: python3.8\n  runtime_memory: 256\n  runtime_timeout: 600\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey("workers")));
    }

    #[test]
    fn region_accepts_string_or_list() {
        let one = Config::from_yaml_str(&format!("{MINIMAL}\n")).unwrap();
        assert!(one.pywren.compute_backend_region.is_none());

        let raw = MINIMAL.replace(
            "runtime_timeout: 600",
            "runtime_timeout: 600\n  compute_backend_region: [us-east, us-south]",
        );
        let many = Config::from_yaml_str(&raw).unwrap();
        assert_eq!(
            many.pywren.compute_backend_region,
            Some(Region::Many(vec![
                "us-east".to_string(),
                "us-south".to_string()
            ]))
        );
    }

    #[test]
    fn compute_projection_stamps_user_agent() {
        let cfg = Config::from_yaml_str(MINIMAL).unwrap();
        let compute = extract_compute_config(&cfg);
        assert_eq!(compute.backend, "ibm_cf");
        assert_eq!(compute.retries, 5);
        let agent = compute.params["user_agent"].as_str().unwrap();
        assert!(agent.starts_with("pywren-client/"));
        assert_eq!(compute.params["namespace"], "ns1");
    }

    #[test]
    fn with_region_pins_the_params() {
        let cfg = Config::from_yaml_str(MINIMAL).unwrap();
        let compute = extract_compute_config(&cfg).with_region("us-east");
        assert_eq!(compute.region, Some(Region::One("us-east".to_string())));
        assert_eq!(compute.params["region"], "us-east");
    }

    #[test]
    fn storage_projection_carries_prefix_and_bucket() {
        let raw = MINIMAL.replace("runtime_timeout: 600", "runtime_timeout: 600\n  storage_bucket: my-data");
        let cfg = Config::from_yaml_str(&raw).unwrap();
        let storage = extract_storage_config(&cfg);
        assert_eq!(storage.backend, "ibm_cos");
        assert_eq!(storage.prefix, "pywren.jobs");
        assert_eq!(storage.bucket.as_deref(), Some("my-data"));
    }

    #[test]
    fn config_round_trips_into_a_payload_value() {
        let cfg = Config::from_yaml_str(MINIMAL).unwrap();
        let value = cfg.to_value();
        assert_eq!(value["pywren"]["workers"], 100);
        assert_eq!(value["pywren"]["storage_backend"], "ibm_cos");
        assert_eq!(value["ibm_cf"]["namespace"], "ns1");
    }
}
