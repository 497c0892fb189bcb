// Loading and saving master/worker settings from JSON files on disk.

use crate::constants::{self, env_vars};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// MasterSettings
// ---------------------------------------------------------------------------

/// Persisted master configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterSettings {
    /// Address:port for worker connections.
    #[serde(default = "default_worker_bind", rename = "WorkerBind")]
    pub worker_bind: String,

    /// Address:port for trigger submissions.
    #[serde(default = "default_trigger_bind", rename = "TriggerBind")]
    pub trigger_bind: String,

    /// SHA-256 hex digest of the worker registration token.
    #[serde(rename = "TokenDigest")]
    pub token_digest: String,

    /// Seconds without a heartbeat before a worker is marked offline.
    #[serde(default = "default_heartbeat_timeout", rename = "HeartbeatTimeoutSecs")]
    pub heartbeat_timeout_secs: u64,

    /// Times a request is re-queued after losing its worker.
    #[serde(default = "default_retry_limit", rename = "RetryLimit")]
    pub retry_limit: u32,

    /// Seconds to wait for an abort acknowledgement before force-disconnect.
    #[serde(default = "default_abort_grace", rename = "AbortGraceSecs")]
    pub abort_grace_secs: u64,

    /// Directory where finalized build runs are persisted.
    #[serde(default = "default_store_dir", rename = "StoreDirectory")]
    pub store_directory: PathBuf,
}

fn default_worker_bind() -> String {
    format!("127.0.0.1:{}", constants::DEFAULT_WORKER_PORT)
}

fn default_trigger_bind() -> String {
    format!("127.0.0.1:{}", constants::DEFAULT_TRIGGER_PORT)
}

fn default_heartbeat_timeout() -> u64 {
    constants::DEFAULT_HEARTBEAT_TIMEOUT.as_secs()
}

fn default_retry_limit() -> u32 {
    constants::DEFAULT_RETRY_LIMIT
}

fn default_abort_grace() -> u64 {
    constants::DEFAULT_ABORT_GRACE.as_secs()
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("_store")
}

// ---------------------------------------------------------------------------
// WorkerSettings
// ---------------------------------------------------------------------------

/// Persisted worker agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Master address:port to connect to.
    #[serde(rename = "MasterAddress")]
    pub master_address: String,

    /// Display name; must be unique among live workers. Defaults to the
    /// hostname when empty.
    #[serde(default, rename = "WorkerName")]
    pub worker_name: String,

    /// Raw registration token.
    #[serde(rename = "Token")]
    pub token: String,

    /// Capability tags this worker declares (platform, toolchain...).
    #[serde(default, rename = "Capabilities")]
    pub capabilities: Vec<String>,

    /// Maximum parallel build runs.
    #[serde(default = "default_capacity", rename = "Capacity")]
    pub capacity: u32,

    /// Working directory for build step execution.
    #[serde(default = "default_work_dir", rename = "WorkDirectory")]
    pub work_directory: PathBuf,
}

fn default_capacity() -> u32 {
    1
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("_work")
}

impl WorkerSettings {
    /// The effective worker name: the configured one, or the hostname.
    pub fn effective_name(&self) -> String {
        if !self.worker_name.is_empty() {
            return self.worker_name.clone();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "worker".to_string())
    }
}

// ---------------------------------------------------------------------------
// ConfigurationStore
// ---------------------------------------------------------------------------

/// Loads and saves settings files, honoring env-var path overrides.
pub struct ConfigurationStore;

impl ConfigurationStore {
    /// Resolve the master settings path: explicit arg, env override, or
    /// `.master.json` in the current directory.
    pub fn master_settings_path(explicit: Option<&Path>) -> PathBuf {
        Self::resolve(explicit, env_vars::MASTER_SETTINGS, ".master.json")
    }

    /// Resolve the worker settings path: explicit arg, env override, or
    /// `.worker.json` in the current directory.
    pub fn worker_settings_path(explicit: Option<&Path>) -> PathBuf {
        Self::resolve(explicit, env_vars::WORKER_SETTINGS, ".worker.json")
    }

    fn resolve(explicit: Option<&Path>, env_var: &str, default_name: &str) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        if let Ok(path) = std::env::var(env_var) {
            if !path.is_empty() {
                return PathBuf::from(path);
            }
        }
        PathBuf::from(default_name)
    }

    /// Load master settings from the given file.
    pub fn load_master(path: &Path) -> Result<MasterSettings> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read master settings from {:?}", path))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse master settings from {:?}", path))
    }

    /// Load worker settings from the given file.
    pub fn load_worker(path: &Path) -> Result<WorkerSettings> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read worker settings from {:?}", path))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse worker settings from {:?}", path))
    }

    /// Save settings (either kind) as pretty-printed JSON.
    pub fn save<T: Serialize>(path: &Path, settings: &T) -> Result<()> {
        let contents = serde_json::to_string_pretty(settings)
            .context("Failed to serialize settings")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write settings to {:?}", path))
    }
}
