//! Fetch settings loaded from a TOML file.
//!
//! Every key is optional; a missing file section means defaults.
//!
//! ```toml
//! [http]
//! timeout_secs = 20
//! user_agent = "barvault"
//!
//! [retry]
//! max_attempts = 5
//! base_delay_ms = 1000
//! max_delay_ms = 30000
//! jitter = 0.25
//!
//! [rate_limit]
//! min_interval_ms = 100
//!
//! [runner]
//! max_concurrent_keys = 4
//!
//! [exchanges.binance]
//! base_url = "https://api.binance.com"
//! ```

use barvault_core::data::{HttpOptions, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchSettings {
    pub http: HttpSettings,
    pub retry: RetrySettings,
    pub rate_limit: RateLimitSettings,
    pub runner: RunnerSettings,
    pub exchanges: BTreeMap<String, ExchangeSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpSettings {
    pub timeout_secs: u64,
    pub user_agent: Option<String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            jitter: policy.jitter,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitSettings {
    /// Overrides each exchange's default request spacing.
    pub min_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerSettings {
    pub max_concurrent_keys: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_keys: 4,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExchangeSettings {
    pub base_url: Option<String>,
}

impl FetchSettings {
    /// Load settings from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate settings from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let settings: FetchSettings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "http.timeout_secs",
                reason: "must be at least 1".into(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.max_attempts",
                reason: "must be at least 1".into(),
            });
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid {
                field: "retry.base_delay_ms",
                reason: format!(
                    "{} exceeds retry.max_delay_ms {}",
                    self.retry.base_delay_ms, self.retry.max_delay_ms
                ),
            });
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::Invalid {
                field: "retry.jitter",
                reason: format!("{} is outside 0.0..=1.0", self.retry.jitter),
            });
        }
        if self.runner.max_concurrent_keys == 0 {
            return Err(ConfigError::Invalid {
                field: "runner.max_concurrent_keys",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            jitter: self.retry.jitter,
        }
    }

    /// HTTP options for one exchange, with its base URL override applied.
    pub fn http_options(&self, exchange: &str) -> HttpOptions {
        let mut options = HttpOptions {
            timeout: Duration::from_secs(self.http.timeout_secs),
            base_url: self
                .exchanges
                .get(&exchange.to_ascii_lowercase())
                .and_then(|e| e.base_url.clone()),
            min_request_interval: self.rate_limit.min_interval_ms.map(Duration::from_millis),
            ..HttpOptions::default()
        };
        if let Some(agent) = &self.http.user_agent {
            options.user_agent = agent.clone();
        }
        options
    }
}
