//! Configuration management for the monitoring control plane.
//!
//! TOML-backed, with a process-global cache refreshed on explicit
//! load/save — the same shape the teacher crate uses for its own
//! configuration (see DESIGN.md).

use std::path::PathBuf;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

use crate::core::error::{MonitorError, Result};

static CONFIG: Lazy<RwLock<Option<MonitorConfig>>> = Lazy::new(|| RwLock::new(None));

/// Complete monitor-core configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub storage: StorageConfig,
    pub coordination: CoordinationConfig,
    pub allocator: AllocatorConfig,
    pub notifier: DispatchConfig,
    pub lock: LockConfig,
}

/// §4.1 / §6 storage engine options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory housing the embedded KV store.
    pub data_dir: PathBuf,
    /// Positive: retention window in days. <=0: no retention.
    pub retention_days: i64,
    /// Interval between local collector ticks (collector concern).
    pub collect_interval_secs: u64,
}

/// Coordination store connection + key prefixes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    pub endpoints: Vec<String>,
    pub etcd_alert_prefix: String,
    pub etcd_notifier_prefix: String,
    /// Whether the notifier manager subscribes to config changes.
    pub enable_watcher: bool,
}

/// Node allocator / service registry options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    pub aio_service_name: String,
    pub heartbeat_ttl_secs: u64,
}

/// Notification dispatch defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Per-channel send deadline, default 30s.
    pub send_timeout_secs: u64,
}

/// Distributed advisory lock defaults (§5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    pub default_ttl_secs: u64,
    pub try_acquire_budget_ms: u64,
    pub backoff_initial_secs: u64,
    pub backoff_max_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let base = get_data_dir();
        Self {
            storage: StorageConfig {
                data_dir: base.join("metrics"),
                retention_days: 30,
                collect_interval_secs: 15,
            },
            coordination: CoordinationConfig {
                endpoints: vec!["127.0.0.1:2379".to_string()],
                etcd_alert_prefix: "/monitor/alerts/rules".to_string(),
                etcd_notifier_prefix: "/monitor/notifiers".to_string(),
                enable_watcher: true,
            },
            allocator: AllocatorConfig {
                aio_service_name: "aio".to_string(),
                heartbeat_ttl_secs: 30,
            },
            notifier: DispatchConfig {
                send_timeout_secs: 30,
            },
            lock: LockConfig {
                default_ttl_secs: 30,
                try_acquire_budget_ms: 50,
                backoff_initial_secs: 1,
                backoff_max_secs: 30,
            },
        }
    }
}

/// Base data directory: `$MONITOR_HOME` or `~/.monitor-core`.
pub fn get_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("MONITOR_HOME") {
        PathBuf::from(home)
    } else if let Some(home) = dirs::home_dir() {
        home.join(".monitor-core")
    } else {
        PathBuf::from(".monitor-core")
    }
}

fn config_path() -> PathBuf {
    get_data_dir().join("config.toml")
}

/// Load configuration from file, falling back to defaults, and refresh the
/// process-global cache.
pub async fn load_config() -> Result<MonitorConfig> {
    let path = config_path();

    let config = if path.exists() {
        let contents = fs::read_to_string(&path).await?;
        toml::from_str(&contents)?
    } else {
        MonitorConfig::default()
    };

    let mut global = CONFIG.write().await;
    *global = Some(config.clone());
    Ok(config)
}

/// Read the cached configuration, loading it first if needed.
pub async fn get_config() -> Result<MonitorConfig> {
    let guard = CONFIG.read().await;
    if let Some(ref config) = *guard {
        Ok(config.clone())
    } else {
        drop(guard);
        load_config().await
    }
}

/// Persist configuration to disk and refresh the process-global cache.
pub async fn save_config(config: &MonitorConfig) -> Result<()> {
    let dir = get_data_dir();
    fs::create_dir_all(&dir)
        .await
        .map_err(|_| MonitorError::ConfigDirCreation { path: dir.clone() })?;

    let toml_str = toml::to_string_pretty(config)?;
    fs::write(config_path(), toml_str).await?;

    let mut global = CONFIG.write().await;
    *global = Some(config.clone());
    Ok(())
}

/// Ensure the data directory exists and the config cache is populated.
pub async fn init_config() -> Result<()> {
    let dir = get_data_dir();
    fs::create_dir_all(&dir)
        .await
        .map_err(|_| MonitorError::ConfigDirCreation { path: dir })?;
    load_config().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_retention() {
        let config = MonitorConfig::default();
        assert_eq!(config.storage.retention_days, 30);
        assert!(config.coordination.enable_watcher);
        assert_eq!(config.notifier.send_timeout_secs, 30);
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        std::env::set_var("MONITOR_HOME", tmp.path());

        let mut config = MonitorConfig::default();
        config.storage.retention_days = 7;
        save_config(&config).await.unwrap();

        let loaded = load_config().await.unwrap();
        assert_eq!(loaded.storage.retention_days, 7);

        std::env::remove_var("MONITOR_HOME");
    }
}
