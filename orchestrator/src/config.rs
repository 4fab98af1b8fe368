//! fwrebuild configuration loading and parsing

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{OrchestratorError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/fwrebuild/config.toml";
pub const CONFIG_ENV_VAR: &str = "FWREBUILD_CONFIG";

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub rebuild: RebuildConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default = "default_rules_file")]
    pub rules_file: String,
    /// Server inventory keyed by server id
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            logging: LoggingConfig::default(),
            rebuild: RebuildConfig::default(),
            executor: ExecutorConfig::default(),
            storage: StorageConfig::default(),
            rules_file: default_rules_file(),
            servers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RebuildConfig {
    /// Allow several in-flight rebuilds for the same server
    #[serde(default)]
    pub allow_concurrent: bool,
    #[serde(default = "default_base_timeout")]
    pub base_timeout_secs: u64,
    #[serde(default = "default_per_rule_timeout")]
    pub per_rule_timeout_secs: u64,
    /// How long a cancelled worker waits for the executor to stop
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_secs: u64,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            allow_concurrent: false,
            base_timeout_secs: default_base_timeout(),
            per_rule_timeout_secs: default_per_rule_timeout(),
            cancel_grace_secs: default_cancel_grace(),
        }
    }
}

impl RebuildConfig {
    /// Wall-clock budget for a rebuild of `total_rules` rules
    pub fn budget(&self, total_rules: u32) -> Duration {
        Duration::from_secs(
            self.base_timeout_secs
                .saturating_add(self.per_rule_timeout_secs.saturating_mul(total_rules as u64)),
        )
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorKind {
    #[default]
    DryRun,
    Ssh,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub kind: ExecutorKind,
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: String,
    #[serde(default = "default_ssh_options")]
    pub ssh_options: Vec<String>,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default)]
    pub dry_run_delay_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::default(),
            ssh_binary: default_ssh_binary(),
            ssh_options: default_ssh_options(),
            command_timeout_secs: default_command_timeout(),
            dry_run_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// SQLite path for task history; in-memory when absent
    pub task_db: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    pub ssh_target: Option<String>,
}

// Default value functions
fn default_listen() -> String { "0.0.0.0:9090".into() }
fn default_log_level() -> String { "info".into() }
fn default_rules_file() -> String { "/etc/fwrebuild/rules.toml".into() }
fn default_base_timeout() -> u64 { 30 }
fn default_per_rule_timeout() -> u64 { 2 }
fn default_cancel_grace() -> u64 { 5 }
fn default_ssh_binary() -> String { "ssh".into() }
fn default_ssh_options() -> Vec<String> {
    vec!["-o".into(), "BatchMode=yes".into(), "-o".into(), "ConnectTimeout=10".into()]
}
fn default_command_timeout() -> u64 { 10 }

impl Config {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)
            .map_err(|e| OrchestratorError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rebuild.base_timeout_secs == 0 {
            return Err(OrchestratorError::Config(
                "rebuild.base_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.executor.command_timeout_secs == 0 {
            return Err(OrchestratorError::Config(
                "executor.command_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.executor.kind == ExecutorKind::Ssh {
            if let Some((id, _)) = self.servers.iter().find(|(_, s)| s.ssh_target.is_none()) {
                return Err(OrchestratorError::Config(format!(
                    "server '{id}' has no ssh_target but executor.kind is ssh"
                )));
            }
        }
        Ok(())
    }

    /// server id → ssh target for servers that have one
    pub fn ssh_targets(&self) -> std::collections::HashMap<String, String> {
        self.servers
            .iter()
            .filter_map(|(id, s)| s.ssh_target.clone().map(|t| (id.clone(), t)))
            .collect()
    }
}

/// Resolve the config path: explicit argument, then `FWREBUILD_CONFIG`, then the default
pub fn resolve_path(arg: Option<String>) -> String {
    arg.or_else(|| std::env::var(CONFIG_ENV_VAR).ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}

/// Load configuration from `path`; a missing file yields the defaults
pub fn load_config(path: &str) -> Result<Config> {
    if Path::new(path).exists() {
        let content = fs::read_to_string(path)?;
        Config::from_toml_str(&content)
    } else {
        tracing::warn!("Config file not found at {path}, using defaults");
        Ok(Config::default())
    }
}
