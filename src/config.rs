//! JSON configuration.
//!
//! ```json
//! {
//!   "providers": {
//!     "fx_primary": { "profile": "CRITICAL", "retry": "DEFAULT", "base_url": "https://v6.exchangerate-api.com" },
//!     "fx_fallback": { "profile": "FAST", "retry": "CONSERVATIVE", "timeout_ms": 3000 }
//!   },
//!   "dispatcher": { "interval_ms": 5000, "max_retries": 5, "batch_size": 50, "retention_hours": 24 },
//!   "idempotency": { "ttl_minutes": 30, "skip_fields": ["clientTime"], "sweep_interval_secs": 60 },
//!   "data_classes": { "fx_rates": { "ttl_secs": 86400, "stale_ceiling_secs": 604800 } }
//! }
//! ```
//!
//! Every section and field is optional; omitted values take the defaults shown above.

use crate::backoff::BackoffPolicy;
use crate::cache::DataClass;
use crate::circuit_breaker::{CircuitProfile, ProfileName};
use crate::idempotency::{EndpointPolicy, IdempotencyKeyStore};
use crate::outbox::DispatcherConfig;
use crate::store::IdempotencyStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
    #[error("data class '{class}' has no providers")]
    NoProviders { class: String },
    #[error("provider '{0}' registered twice")]
    DuplicateProvider(String),
}

impl ConfigError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid { field: field.into(), reason: reason.into() }
    }
}

/// Named retry preset, as selected in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryPreset {
    #[default]
    Default,
    Conservative,
    Aggressive,
}

impl RetryPreset {
    pub fn policy(self) -> BackoffPolicy {
        match self {
            RetryPreset::Default => BackoffPolicy::default_policy(),
            RetryPreset::Conservative => BackoffPolicy::conservative(),
            RetryPreset::Aggressive => BackoffPolicy::aggressive(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    crate::http::DEFAULT_TIMEOUT.as_millis() as u64
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub profile: ProfileName,
    pub retry: RetryPreset,
    pub base_url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            profile: ProfileName::default(),
            retry: RetryPreset::default(),
            base_url: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl ProviderConfig {
    pub fn circuit_profile(&self) -> CircuitProfile {
        self.profile.profile()
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.retry.policy()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSection {
    pub interval_ms: u64,
    pub max_retries: u32,
    pub batch_size: usize,
    pub retention_hours: u64,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self { interval_ms: 5_000, max_retries: 5, batch_size: 50, retention_hours: 24 }
    }
}

impl DispatcherSection {
    pub fn to_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            interval: Duration::from_millis(self.interval_ms),
            max_retries: self.max_retries,
            batch_size: self.batch_size,
            retention: Duration::from_secs(self.retention_hours.saturating_mul(3600)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencySection {
    pub ttl_minutes: u64,
    /// Volatile fields ignored in addition to the built-in ones.
    pub skip_fields: Vec<String>,
    pub sweep_interval_secs: u64,
}

impl Default for IdempotencySection {
    fn default() -> Self {
        Self { ttl_minutes: 30, skip_fields: Vec::new(), sweep_interval_secs: 60 }
    }
}

impl IdempotencySection {
    pub fn policy(&self) -> EndpointPolicy {
        EndpointPolicy {
            ttl: Duration::from_secs(self.ttl_minutes.saturating_mul(60)),
            skip_fields: self.skip_fields.clone(),
        }
    }

    /// Key store over `store` with these defaults.
    pub fn build(&self, store: Arc<dyn IdempotencyStore>) -> IdempotencyKeyStore {
        IdempotencyKeyStore::new(store)
            .with_defaults(self.policy())
            .with_sweep_interval(Duration::from_secs(self.sweep_interval_secs))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataClassSection {
    pub ttl_secs: u64,
    pub stale_ceiling_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulwarkConfig {
    pub providers: BTreeMap<String, ProviderConfig>,
    pub dispatcher: DispatcherSection,
    pub idempotency: IdempotencySection,
    pub data_classes: BTreeMap<String, DataClassSection>,
}

impl BulwarkConfig {
    /// Parse and validate.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: BulwarkConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, provider) in &self.providers {
            if provider.timeout_ms == 0 {
                return Err(ConfigError::invalid(format!("providers.{name}.timeout_ms"), "must be positive"));
            }
            if let Some(url) = &provider.base_url {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(ConfigError::invalid(
                        format!("providers.{name}.base_url"),
                        format!("'{url}' is not an http(s) URL"),
                    ));
                }
            }
        }

        let dispatcher = &self.dispatcher;
        if dispatcher.interval_ms == 0 {
            return Err(ConfigError::invalid("dispatcher.interval_ms", "must be positive"));
        }
        if dispatcher.max_retries == 0 {
            return Err(ConfigError::invalid("dispatcher.max_retries", "must be positive"));
        }
        if dispatcher.batch_size == 0 {
            return Err(ConfigError::invalid("dispatcher.batch_size", "must be positive"));
        }
        if self.idempotency.ttl_minutes == 0 {
            return Err(ConfigError::invalid("idempotency.ttl_minutes", "must be positive"));
        }

        for (name, class) in &self.data_classes {
            if class.ttl_secs == 0 {
                return Err(ConfigError::invalid(format!("data_classes.{name}.ttl_secs"), "must be positive"));
            }
            if class.stale_ceiling_secs < class.ttl_secs {
                return Err(ConfigError::invalid(
                    format!("data_classes.{name}.stale_ceiling_secs"),
                    "must be >= ttl_secs",
                ));
            }
        }
        Ok(())
    }

    /// Provider settings, defaulted when the provider is not listed.
    pub fn provider(&self, name: &str) -> ProviderConfig {
        self.providers.get(name).cloned().unwrap_or_default()
    }

    /// A configured data class, falling back to the built-in presets by name.
    pub fn data_class(&self, name: &str) -> Option<DataClass> {
        if let Some(section) = self.data_classes.get(name) {
            return Some(DataClass::new(
                name,
                Duration::from_secs(section.ttl_secs),
                Duration::from_secs(section.stale_ceiling_secs),
            ));
        }
        match name {
            "fx_rates" => Some(DataClass::fx_rates()),
            "flight_schedule" => Some(DataClass::flight_schedule()),
            "flight_status" => Some(DataClass::flight_status()),
            _ => None,
        }
    }
}
