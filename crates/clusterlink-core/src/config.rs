//! Agent configuration.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::circuitbreaker::CircuitBreakerConfig;
use crate::error::{CoreError, Result};
use crate::http::HttpConfig;
use crate::orphan::OrphanLogConfig;
use crate::pool::PoolConfig;
use crate::retry::RetryConfig;
use crate::topology::{BootstrapMode, TopologyConfig};

/// Everything the agent needs besides credentials and a tracer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Sent as the HTTP `User-Agent`.
    pub user_agent: String,
    /// KV bootstrap addresses, `host:port`.
    pub kv_seeds: Vec<String>,
    /// Management bootstrap addresses, `host:port`.
    pub http_seeds: Vec<String>,
    /// Bucket selected on KV connections and polled for configs.
    pub bucket: Option<String>,
    /// Default retry strategy.
    pub retry: RetryConfig,
    /// Per-(node, service) breakers.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Config polling.
    pub topology: TopologyConfig,
    /// KV connections.
    pub pool: PoolConfig,
    /// HTTP client.
    pub http: HttpConfig,
    /// Orphaned response reporting.
    pub orphan_log: OrphanLogConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("clusterlink/{}", env!("CARGO_PKG_VERSION")),
            kv_seeds: Vec::new(),
            http_seeds: Vec::new(),
            bucket: None,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            topology: TopologyConfig::default(),
            pool: PoolConfig::default(),
            http: HttpConfig::default(),
            orphan_log: OrphanLogConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Builds a config from connection-string options applied in order, so
    /// the last value of a repeated key wins.
    pub fn from_options<'a, I>(options: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = Self::default();
        for (key, value) in options {
            config.apply_option(key, value)?;
        }
        Ok(config)
    }

    /// Applies one connection-string option.
    ///
    /// Returns `Ok(false)` for keys this crate does not know; those belong
    /// to other layers and are ignored. Durations are milliseconds, or a
    /// number with an `us`, `ms`, `s`, `m` or `h` suffix.
    pub fn apply_option(&mut self, key: &str, value: &str) -> Result<bool> {
        match key {
            "bootstrap_on" => {
                self.topology.bootstrap = match value {
                    "cccp" => BootstrapMode::Cccp,
                    "http" => BootstrapMode::Http,
                    "both" => BootstrapMode::Both,
                    other => return Err(invalid(key, other)),
                }
            }
            "kv_connect_timeout" => self.pool.kv_connect_timeout_ms = duration_ms(key, value)?,
            "config_poll_timeout" => self.topology.poll_timeout_ms = duration_ms(key, value)?,
            "config_poll_interval" => self.topology.poll_interval_ms = duration_ms(key, value)?,
            "max_idle_http_connections" => self.http.max_idle_connections = number(key, value)?,
            "max_perhost_idle_http_connections" => {
                self.http.max_idle_connections_per_host = number(key, value)?
            }
            "idle_http_connection_timeout" => self.http.idle_timeout_ms = duration_ms(key, value)?,
            "orphaned_response_logging" => self.orphan_log.enabled = boolean(key, value)?,
            "orphaned_response_logging_interval" => {
                self.orphan_log.interval_ms = duration_ms(key, value)?
            }
            "orphaned_response_logging_sample_size" => {
                self.orphan_log.sample_size = number(key, value)?
            }
            "http_redial_period" => self.topology.http_redial_period_ms = duration_ms(key, value)?,
            "http_retry_delay" => self.topology.http_retry_delay_ms = duration_ms(key, value)?,
            "kv_pool_size" => self.pool.kv_pool_size = number(key, value)?,
            "max_queue_size" => self.pool.max_queue_size = number(key, value)?,
            _ => {
                debug!(key, "ignoring unknown option");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Copy safe to log: seed hosts and the bucket name are masked, ports kept.
    pub fn redacted(&self) -> Self {
        let mask = |seeds: &[String]| -> Vec<String> {
            seeds
                .iter()
                .map(|seed| match seed.rsplit_once(':') {
                    Some((_, port)) => format!("<redacted>:{}", port),
                    None => "<redacted>".to_string(),
                })
                .collect()
        };
        Self {
            kv_seeds: mask(&self.kv_seeds),
            http_seeds: mask(&self.http_seeds),
            bucket: self.bucket.as_ref().map(|_| "<redacted>".to_string()),
            ..self.clone()
        }
    }

    /// Checks the config for values the agent cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.kv_seeds.is_empty() && self.http_seeds.is_empty() {
            return Err(CoreError::config("at least one seed address is required"));
        }
        match self.topology.bootstrap {
            BootstrapMode::Cccp if self.kv_seeds.is_empty() => {
                return Err(CoreError::config(
                    "bootstrap_on=cccp requires at least one kv seed",
                ));
            }
            BootstrapMode::Http if self.http_seeds.is_empty() => {
                return Err(CoreError::config(
                    "bootstrap_on=http requires at least one http seed",
                ));
            }
            _ => {}
        }
        if self.pool.kv_pool_size == 0 {
            return Err(CoreError::config("kv_pool_size must be at least 1"));
        }
        if self.pool.max_queue_size == 0 {
            return Err(CoreError::config("max_queue_size must be at least 1"));
        }
        if self.topology.poll_interval_ms == 0 {
            return Err(CoreError::config("config_poll_interval must be positive"));
        }
        if self.http.row_buffer_size == 0 {
            return Err(CoreError::config("row_buffer_size must be at least 1"));
        }
        if self.bucket.as_deref() == Some("") {
            return Err(CoreError::config("bucket name cannot be empty"));
        }
        Ok(())
    }
}

fn invalid(key: &str, value: &str) -> CoreError {
    CoreError::config(format!("invalid value '{}' for option {}", value, key))
}

fn number(key: &str, value: &str) -> Result<usize> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

fn boolean(key: &str, value: &str) -> Result<bool> {
    match value.trim() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn duration_ms(key: &str, value: &str) -> Result<u64> {
    let value_trimmed = value.trim();
    if let Ok(ms) = value_trimmed.parse::<u64>() {
        return Ok(ms);
    }
    let split = value_trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .ok_or_else(|| invalid(key, value))?;
    let (amount, unit) = value_trimmed.split_at(split);
    let amount: f64 = amount.parse().map_err(|_| invalid(key, value))?;
    let scale = match unit {
        "us" => 0.001,
        "ms" => 1.0,
        "s" => 1_000.0,
        "m" => 60_000.0,
        "h" => 3_600_000.0,
        _ => return Err(invalid(key, value)),
    };
    Ok((amount * scale).round() as u64)
}
