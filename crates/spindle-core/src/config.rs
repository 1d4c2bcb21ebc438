//! Typed configuration.
//!
//! `Config::from_env` loads once at startup and fails fast on bad values.
//! The Redis URL may carry a password, so it is kept in a `SecretString`.

use std::collections::BTreeMap;
use std::time::Duration;

use secrecy::SecretString;

use crate::app::priority::PriorityMode;
use crate::domain::ConfigError;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/0";

/// Settings for one dispatch server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum handlers running at once in this process.
    pub concurrency: usize,
    /// Queue name -> weight (>= 1).
    pub queues: BTreeMap<String, u32>,
    pub priority: PriorityMode,
    /// Pause after a dequeue attempt finds nothing (or fails).
    pub empty_queue_backoff: Duration,
    /// How long shutdown waits for in-flight handlers before detaching them.
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            queues: BTreeMap::from([("default".to_string(), 1)]),
            priority: PriorityMode::Weighted,
            empty_queue_backoff: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(8),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::invalid("concurrency", "must be at least 1"));
        }
        if self.queues.is_empty() {
            return Err(ConfigError::invalid("queues", "at least one queue is required"));
        }
        if let Some((name, _)) = self.queues.iter().find(|(_, weight)| **weight == 0) {
            return Err(ConfigError::invalid(
                "queues",
                format!("weight of queue {name} must be at least 1"),
            ));
        }
        Ok(())
    }
}

/// Process configuration read from `SPINDLE_*` environment variables.
#[derive(Debug)]
pub struct Config {
    pub redis_url: SecretString,
    pub server: ServerConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = ServerConfig::default();

        let server = ServerConfig {
            concurrency: match optional_var("SPINDLE_CONCURRENCY") {
                Some(raw) => parse_number("SPINDLE_CONCURRENCY", &raw)?,
                None => defaults.concurrency,
            },
            queues: match optional_var("SPINDLE_QUEUES") {
                Some(raw) => parse_queues(&raw)?,
                None => defaults.queues,
            },
            priority: match optional_var("SPINDLE_STRICT_PRIORITY") {
                Some(raw) if parse_bool("SPINDLE_STRICT_PRIORITY", &raw)? => PriorityMode::Strict,
                _ => PriorityMode::Weighted,
            },
            ..defaults
        };
        server.validate()?;

        Ok(Self {
            redis_url: SecretString::from(
                optional_var("SPINDLE_REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            ),
            server,
            log_level: optional_var("SPINDLE_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_number(name: &str, raw: &str) -> Result<usize, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|e| ConfigError::invalid(name, format!("{raw:?}: {e}")))
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::invalid(name, format!("{other:?} is not a boolean"))),
    }
}

/// Parse `critical:6,default:3,low:1`. A bare name gets weight 1.
pub fn parse_queues(raw: &str) -> Result<BTreeMap<String, u32>, ConfigError> {
    let mut queues = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, weight) = match entry.split_once(':') {
            Some((name, weight)) => {
                let weight = weight.trim().parse::<u32>().map_err(|e| {
                    ConfigError::invalid("queues", format!("weight in {entry:?}: {e}"))
                })?;
                (name.trim(), weight)
            }
            None => (entry, 1),
        };
        if name.is_empty() {
            return Err(ConfigError::invalid("queues", format!("empty queue name in {entry:?}")));
        }
        if weight == 0 {
            return Err(ConfigError::invalid(
                "queues",
                format!("weight of queue {name} must be at least 1"),
            ));
        }
        if queues.insert(name.to_string(), weight).is_some() {
            return Err(ConfigError::invalid("queues", format!("queue {name} listed twice")));
        }
    }
    if queues.is_empty() {
        return Err(ConfigError::invalid("queues", "at least one queue is required"));
    }
    Ok(queues)
}
