//! # Cicero Config
//!
//! Unified single-file configuration for the Cicero scheduling engine.
//! A single `cicero.yaml` configures storage, the broker, the job runner
//! endpoint, the definition evaluator command, invoker rate control, log
//! shipping and observability.

mod loader;

pub use loader::{load_config, ConfigError};

use serde::Deserialize;

/// Top-level configuration schema for Cicero.
#[derive(Debug, Clone, Deserialize)]
pub struct CiceroConfig {
    /// Config schema version.
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    #[serde(default)]
    pub invoker: InvokerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for CiceroConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            app: AppConfig::default(),
            db: DbConfig::default(),
            broker: BrokerConfig::default(),
            runner: RunnerConfig::default(),
            evaluator: EvaluatorConfig::default(),
            invoker: InvokerConfig::default(),
            logging: LoggingConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_env")]
    pub environment: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            environment: default_env(),
        }
    }
}

fn default_app_name() -> String {
    "cicero".to_string()
}

fn default_env() -> String {
    "development".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    /// Storage backend: `memory` or `postgres`.
    #[serde(default = "default_db_backend")]
    pub backend: String,
    /// Connection URL; required for the postgres backend.
    #[serde(default)]
    pub connection_url: Option<String>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            backend: default_db_backend(),
            connection_url: None,
        }
    }
}

fn default_db_backend() -> String {
    "memory".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Channel capacity of the in-process broker.
    #[serde(default = "default_broker_capacity")]
    pub capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            capacity: default_broker_capacity(),
        }
    }
}

fn default_broker_capacity() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RunnerConfig {
    /// Job runner API endpoint. Absent means the embedder injects its own
    /// runner client (development mode).
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvaluatorConfig {
    /// Definition evaluator command.
    #[serde(default = "default_evaluator_command")]
    pub command: String,
    /// Arguments prepended before the evaluator protocol arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Kill evaluations running longer than this, in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            command: default_evaluator_command(),
            args: Vec::new(),
            timeout_ms: None,
        }
    }
}

fn default_evaluator_command() -> String {
    "cicero-evaluator".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvokerConfig {
    /// Concurrent invocation slots.
    #[serde(default = "default_invoker_slots")]
    pub slots: usize,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            slots: default_invoker_slots(),
        }
    }
}

fn default_invoker_slots() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Endpoint the job log sidecars push to.
    #[serde(default = "default_loki_url")]
    pub loki_url: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            loki_url: default_loki_url(),
        }
    }
}

fn default_loki_url() -> String {
    "http://127.0.0.1:3100/loki/api/v1/push".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level filter, e.g. `info` or `cicero=debug`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format: `text` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}
