//! Daemon configuration.
//!
//! Layers, lowest first: built-in defaults, an optional TOML file
//! (`VIDFORGE_CONFIG`, default `vidforge.toml`), then environment variables
//! of the form `VIDFORGE_<SECTION>__<KEY>`.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;
use vidforge_api_rpc::RpcServerConfig;
use vidforge_core::application::worker::constants::{
    DEFAULT_CONSUME_BLOCK, DEFAULT_DOWNLOAD_CONCURRENCY, DEFAULT_GENERATE_CONCURRENCY,
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_PARSE_CONCURRENCY, DEFAULT_PROBE_TIMEOUT,
};
use vidforge_core::application::{Concurrency, EngineConfig, RetryPolicy, StallConfig, WorkerConfig};
use vidforge_infra_redis::RedisBrokerConfig;
use vidforge_infra_system::WorkerCommands;

const ENV_PREFIX: &str = "VIDFORGE";
const CONFIG_PATH_VAR: &str = "VIDFORGE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "vidforge.toml";
const DEFAULT_DB_PATH: &str = "~/.vidforge/jobs.db";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// File path or full `sqlite:` url
    pub path: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: DEFAULT_DB_PATH.to_string(),
        }
    }
}

impl DatabaseSettings {
    pub fn url(&self) -> String {
        if self.path.starts_with("sqlite:") {
            self.path.clone()
        } else {
            format!("sqlite://{}", shellexpand::tilde(&self.path))
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// No url means inline mode without probing
    pub url: Option<String>,
    pub key_prefix: String,
    pub consumer_group: String,
    pub probe_timeout_ms: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        let redis = RedisBrokerConfig::default();
        Self {
            url: None,
            key_prefix: redis.key_prefix,
            consumer_group: redis.consumer_group,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl BrokerSettings {
    pub fn redis_config(&self) -> Option<RedisBrokerConfig> {
        let url = self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())?;
        Some(RedisBrokerConfig {
            url: url.to_string(),
            key_prefix: self.key_prefix.clone(),
            consumer_group: self.consumer_group.clone(),
        })
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub download: usize,
    pub parse: usize,
    pub generate: usize,
    pub consume_block_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Variables passed through to worker processes
    pub env_allowlist: Vec<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            download: DEFAULT_DOWNLOAD_CONCURRENCY,
            parse: DEFAULT_PARSE_CONCURRENCY,
            generate: DEFAULT_GENERATE_CONCURRENCY,
            consume_block_ms: DEFAULT_CONSUME_BLOCK.as_millis() as u64,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64,
            env_allowlist: vec![
                "PATH".to_string(),
                "HOME".to_string(),
                "USER".to_string(),
                "LANG".to_string(),
            ],
        }
    }
}

impl From<&WorkerSettings> for WorkerConfig {
    fn from(s: &WorkerSettings) -> Self {
        WorkerConfig {
            consume_block: Duration::from_millis(s.consume_block_ms),
            heartbeat_interval: Duration::from_millis(s.heartbeat_interval_ms.max(1)),
            concurrency: Concurrency {
                download: s.download,
                parse: s.parse,
                generate: s.generate,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub format: LogFormat,
    /// EnvFilter directive, overridden by RUST_LOG
    pub filter: String,
    /// Daily rolling file output next to stdout when set
    pub directory: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            filter: "vidforge=info".to_string(),
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub broker: BrokerSettings,
    pub workers: WorkerSettings,
    pub retry: RetryPolicy,
    pub stall: StallConfig,
    pub executables: WorkerCommands,
    pub rpc: RpcServerConfig,
    pub log: LogSettings,
    pub shutdown_grace_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseSettings::default(),
            broker: BrokerSettings::default(),
            workers: WorkerSettings::default(),
            retry: RetryPolicy::default(),
            stall: StallConfig::default(),
            executables: WorkerCommands::default(),
            rpc: RpcServerConfig::default(),
            log: LogSettings::default(),
            shutdown_grace_ms: 10_000,
        }
    }
}

impl Settings {
    /// Load from the config file named by `VIDFORGE_CONFIG` and the process environment
    pub fn load() -> Result<Self, ConfigError> {
        let path =
            std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = shellexpand::tilde(&path).into_owned();
        let builder = Config::builder().add_source(File::with_name(&path).required(false));
        Self::build(builder.add_source(env_source()))
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        builder.build()?.try_deserialize()
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            retry: self.retry.clone(),
            stall: self.stall,
            workers: WorkerConfig::from(&self.workers),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("workers.env_allowlist")
        .with_list_parse_key("rpc.elevated_users")
}

/// Parse an inline TOML document, used by tests
#[cfg(test)]
fn from_toml(toml: &str, env: Option<config::Map<String, String>>) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::from_str(toml, config::FileFormat::Toml))
        .add_source(env_source().source(env));
    Settings::build(builder)
}
