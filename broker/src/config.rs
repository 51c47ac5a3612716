use std::fs;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::Duration;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub etcd: EtcdSettings,
    pub agent: AgentSettings,
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub lock: LockSettings,
    #[serde(default)]
    pub backup: BackupSettings,
    #[serde(default)]
    pub restore: RestoreSettings,
    #[serde(default)]
    pub watch: WatchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EtcdSettings {
    pub endpoints: Vec<String>,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_agent_port")]
    pub port: u16,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSettings {
    pub base_url: String,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockSettings {
    #[serde(default = "default_lock_ttl_secs")]
    pub backup_ttl_secs: i64,
    #[serde(default = "default_lock_ttl_secs")]
    pub restore_ttl_secs: i64,
    #[serde(default = "default_unlock_max_retries")]
    pub unlock_max_retries: u32,
    #[serde(default = "default_unlock_retry_delay_millis")]
    pub unlock_retry_delay_millis: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        LockSettings {
            backup_ttl_secs: default_lock_ttl_secs(),
            restore_ttl_secs: default_lock_ttl_secs(),
            unlock_max_retries: default_unlock_max_retries(),
            unlock_retry_delay_millis: default_unlock_retry_delay_millis(),
        }
    }
}

impl From<LockSettings> for liblock::LockConfig {
    fn from(settings: LockSettings) -> Self {
        liblock::LockConfig {
            backup_ttl: Duration::seconds(settings.backup_ttl_secs),
            restore_ttl: Duration::seconds(settings.restore_ttl_secs),
            unlock_max_retries: settings.unlock_max_retries,
            unlock_retry_delay: StdDuration::from_millis(settings.unlock_retry_delay_millis),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupSettings {
    #[serde(default = "default_status_check_secs")]
    pub status_check_interval_secs: u64,
    #[serde(default = "default_abort_timeout_secs")]
    pub abort_timeout_secs: i64,
    #[serde(default = "default_reschedule_delay_minutes")]
    pub reschedule_delay_minutes: i64,
    #[serde(default = "default_schedule_retry_attempts")]
    pub schedule_retry_attempts: u32,
    #[serde(default = "default_schedule_retry_delay_millis")]
    pub schedule_retry_delay_millis: u64,
}

impl Default for BackupSettings {
    fn default() -> Self {
        BackupSettings {
            status_check_interval_secs: default_status_check_secs(),
            abort_timeout_secs: default_abort_timeout_secs(),
            reschedule_delay_minutes: default_reschedule_delay_minutes(),
            schedule_retry_attempts: default_schedule_retry_attempts(),
            schedule_retry_delay_millis: default_schedule_retry_delay_millis(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestoreSettings {
    #[serde(default = "default_status_check_secs")]
    pub status_check_interval_secs: u64,
    #[serde(default = "default_abort_timeout_secs")]
    pub abort_timeout_secs: i64,
}

impl Default for RestoreSettings {
    fn default() -> Self {
        RestoreSettings {
            status_check_interval_secs: default_status_check_secs(),
            abort_timeout_secs: default_abort_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    /// Bounded lifetime of one watch connection; the stream is dropped and
    /// re-established after this.
    #[serde(default = "default_watch_refresh_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_watch_error_delay_secs")]
    pub error_delay_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        WatchConfig {
            refresh_interval_secs: default_watch_refresh_secs(),
            error_delay_secs: default_watch_error_delay_secs(),
        }
    }
}

fn default_prefix() -> String {
    "/servicefabrik".to_string()
}

fn default_agent_port() -> u16 {
    2718
}

fn default_http_timeout_secs() -> u64 {
    10
}

fn default_lock_ttl_secs() -> i64 {
    14400
}

fn default_unlock_max_retries() -> u32 {
    3
}

fn default_unlock_retry_delay_millis() -> u64 {
    2000
}

fn default_status_check_secs() -> u64 {
    120
}

fn default_abort_timeout_secs() -> i64 {
    300
}

fn default_reschedule_delay_minutes() -> i64 {
    10
}

fn default_schedule_retry_attempts() -> u32 {
    3
}

fn default_schedule_retry_delay_millis() -> u64 {
    500
}

fn default_watch_refresh_secs() -> u64 {
    120
}

fn default_watch_error_delay_secs() -> u64 {
    30
}

pub fn load_config(path: &str) -> Result<Config> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    let cfg: Config = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    Ok(cfg)
}
