//! Configuration loading from TOML files
//!
//! The file is named by `--config` (default `config/dev.toml`). A missing
//! or invalid file falls back to defaults.
//!
//! The shared secret may be supplied out of band through
//! `MACHINETIME_API_KEY`, which overrides the file value.

use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Environment variable that overrides `[server] api_key`
pub const API_KEY_ENV: &str = "MACHINETIME_API_KEY";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    /// Unique site identifier, used as the metrics label
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "machinetime".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_api_key_enabled")]
    pub api_key_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            api_key: String::new(),
            api_key_enabled: default_api_key_enabled(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_api_key_enabled() -> bool {
    true
}

/// Base URL and request timeout of a REST collaborator
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    3000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub group: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Number of upcoming events inspected per lookup
    #[serde(default = "default_lookahead")]
    pub lookahead: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            group: String::new(),
            timeout_ms: default_timeout_ms(),
            lookahead: default_lookahead(),
        }
    }
}

fn default_lookahead() -> usize {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_pct")]
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_pct: default_jitter_pct(),
        }
    }
}

fn default_max_attempts() -> usize {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    1000
}

fn default_jitter_pct() -> f64 {
    0.2
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    /// Non-members need a pocket_store above this during open hours
    #[serde(default = "default_open_hours_min_balance")]
    pub open_hours_min_balance: i64,
    /// Automatic re-reads after a stale-balance rejection
    #[serde(default = "default_max_stale_retries")]
    pub max_stale_retries: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            open_hours_min_balance: default_open_hours_min_balance(),
            max_stale_retries: default_max_stale_retries(),
        }
    }
}

fn default_open_hours_min_balance() -> i64 {
    2000
}

fn default_max_stale_retries() -> usize {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub server: ServerConfig,
    pub ledger: ServiceConfig,
    pub directory: ServiceConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    bind_address: String,
    port: u16,
    api_key: String,
    api_key_enabled: bool,
    ledger_url: String,
    ledger_timeout_ms: u64,
    directory_url: String,
    directory_timeout_ms: u64,
    schedule_enabled: bool,
    schedule_url: String,
    schedule_group: String,
    schedule_timeout_ms: u64,
    schedule_lookahead: usize,
    retry: RetryConfig,
    open_hours_min_balance: i64,
    max_stale_retries: usize,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: default_site_id(),
            bind_address: default_bind_address(),
            port: default_port(),
            api_key: String::new(),
            api_key_enabled: true,
            ledger_url: "http://127.0.0.1:8089".to_string(),
            ledger_timeout_ms: default_timeout_ms(),
            directory_url: "http://127.0.0.1:8089".to_string(),
            directory_timeout_ms: default_timeout_ms(),
            schedule_enabled: false,
            schedule_url: String::new(),
            schedule_group: String::new(),
            schedule_timeout_ms: default_timeout_ms(),
            schedule_lookahead: default_lookahead(),
            retry: RetryConfig::default(),
            open_hours_min_balance: default_open_hours_min_balance(),
            max_stale_retries: default_max_stale_retries(),
            metrics_interval_secs: default_metrics_interval(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        if toml_config.schedule.enabled && toml_config.schedule.url.is_empty() {
            anyhow::bail!("schedule.enabled requires schedule.url in {}", path.display());
        }

        let api_key = env::var(API_KEY_ENV).unwrap_or(toml_config.server.api_key);

        Ok(Self {
            site_id: toml_config.site.id,
            bind_address: toml_config.server.bind_address,
            port: toml_config.server.port,
            api_key,
            api_key_enabled: toml_config.server.api_key_enabled,
            ledger_url: toml_config.ledger.url,
            ledger_timeout_ms: toml_config.ledger.timeout_ms,
            directory_url: toml_config.directory.url,
            directory_timeout_ms: toml_config.directory.timeout_ms,
            schedule_enabled: toml_config.schedule.enabled,
            schedule_url: toml_config.schedule.url,
            schedule_group: toml_config.schedule.group,
            schedule_timeout_ms: toml_config.schedule.timeout_ms,
            schedule_lookahead: toml_config.schedule.lookahead.max(1),
            retry: toml_config.retry,
            open_hours_min_balance: toml_config.policy.open_hours_min_balance,
            max_stale_retries: toml_config.policy.max_stale_retries,
            metrics_interval_secs: toml_config.metrics.interval_secs.max(1),
            config_file: path.display().to_string(),
        })
    }

    /// Load configuration from a path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn api_key_enabled(&self) -> bool {
        self.api_key_enabled
    }

    pub fn ledger_url(&self) -> &str {
        &self.ledger_url
    }

    pub fn ledger_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger_timeout_ms)
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    pub fn directory_timeout(&self) -> Duration {
        Duration::from_millis(self.directory_timeout_ms)
    }

    pub fn schedule_enabled(&self) -> bool {
        self.schedule_enabled
    }

    pub fn schedule_url(&self) -> &str {
        &self.schedule_url
    }

    pub fn schedule_group(&self) -> &str {
        &self.schedule_group
    }

    pub fn schedule_timeout(&self) -> Duration {
        Duration::from_millis(self.schedule_timeout_ms)
    }

    pub fn schedule_lookahead(&self) -> usize {
        self.schedule_lookahead
    }

    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn open_hours_min_balance(&self) -> i64 {
        self.open_hours_min_balance
    }

    pub fn max_stale_retries(&self) -> usize {
        self.max_stale_retries
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to toggle open hours gating
    pub fn with_schedule_enabled(mut self, enabled: bool) -> Self {
        self.schedule_enabled = enabled;
        self
    }

    /// Builder method for tests to set the shared secret
    pub fn with_api_key(mut self, key: &str) -> Self {
        self.api_key = key.to_string();
        self
    }

    pub fn with_api_key_enabled(mut self, enabled: bool) -> Self {
        self.api_key_enabled = enabled;
        self
    }

    /// Builder method for tests to set the stale-balance retry bound
    pub fn with_max_stale_retries(mut self, retries: usize) -> Self {
        self.max_stale_retries = retries;
        self
    }
}
