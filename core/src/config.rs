use std::env;
use std::path::Path;
use std::time::Duration;

use config::{Config, File};
use serde::Deserialize;

use crate::error::OrchestratorError;

/// Full engine configuration, built once at startup and handed by value into
/// each component constructor. No component reads ambient state afterwards.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub nonce: NonceConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    /// Present when nonce/pending state is shared across processes.
    pub redis: Option<RedisConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub group_id: String,
    pub job_topic: String,
    pub notification_topic: String,
    /// Concurrent in-flight messages per consumer.
    pub concurrency: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            group_id: "tx-sender".into(),
            job_topic: "topic-tx-sender".into(),
            notification_topic: "topic-tx-decoded".into(),
            concurrency: 16,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub url: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8081".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NonceConfig {
    pub max_recovery: u32,
    pub ttl_secs: u64,
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            max_recovery: crate::constants::DEFAULT_MAX_RECOVERY,
            ttl_secs: crate::constants::DEFAULT_NONCE_TTL.as_secs(),
        }
    }
}

impl NonceConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_resends: u32,
    pub default_interval_secs: u64,
    /// Bounded resend attempts on transient broadcast failures.
    pub broadcast_attempts: u32,
    pub broadcast_backoff_millis: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_resends: crate::constants::DEFAULT_MAX_RESENDS,
            default_interval_secs: crate::constants::DEFAULT_RETRY_INTERVAL.as_secs(),
            broadcast_attempts: 3,
            broadcast_backoff_millis: 1000,
        }
    }
}

impl RetryConfig {
    pub fn default_interval(&self) -> Duration {
        Duration::from_secs(self.default_interval_secs)
    }

    pub fn broadcast_backoff(&self) -> Duration {
        Duration::from_millis(self.broadcast_backoff_millis)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Interval between chain-registry refreshes.
    pub refresh_interval_secs: u64,
    pub default_depth: u64,
    pub default_backoff_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 5,
            default_depth: 0,
            default_backoff_secs: 1,
        }
    }
}

impl ListenerConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn default_backoff(&self) -> Duration {
        Duration::from_secs(self.default_backoff_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub namespace: Option<String>,
}

impl OrchestratorConfig {
    /// Load from an optional yaml file plus `RELAYER__`-prefixed environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, OrchestratorError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        } else {
            let base = env::current_dir().map_err(|e| OrchestratorError::InternalError {
                message: format!("Failed to determine the current directory: {e}"),
            })?;
            let default_path = base.join("configuration").join("relayer.yaml");
            if default_path.exists() {
                builder = builder.add_source(File::from(default_path));
            }
        }

        let config = builder
            .add_source(config::Environment::with_prefix("relayer").separator("__"))
            .build()
            .map_err(|e| OrchestratorError::ValidationError {
                message: format!("Configuration error: {e}"),
            })?;

        config
            .try_deserialize::<OrchestratorConfig>()
            .map_err(|e| OrchestratorError::ValidationError {
                message: format!("Configuration error: {e}"),
            })
    }
}
