//! Configuration management for the contract registry
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (contracts.toml)
//! - Environment variables (CONTRACTS__*)
//!
//! ## Example config file (contracts.toml):
//! ```toml
//! [proposals]
//! expiration_days = 30
//! auto_expire_enabled = true
//!
//! [webhooks]
//! url = "https://hooks.example.com/contracts"
//! secret = "change-me"
//! allowed_domains = ["example.com"]
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! cooldown_secs = 60
//!
//! [dead_letter]
//! path = "./dead_letters.jsonl"
//! state_path = "./deliveries.json"
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use config_crate::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::delivery::{BreakerPolicy, DispatcherSettings, RetryPolicy, Subscription};
use crate::error::{RegistryError, Result};
use crate::schema::SchemaLimits;

/// Id of the subscription built from `[webhooks].url`
pub const GLOBAL_SUBSCRIPTION_ID: &str = "global";

const MAX_EXPIRATION_DAYS: i64 = 3650;
const MAX_TIMEOUT_SECS: f64 = 3600.0;
const MAX_ATTEMPTS: u32 = 100;
const MAX_BACKOFF_MS: u64 = 86_400_000;
const MAX_COOLDOWN_SECS: u64 = 604_800;

/// Main configuration for the contract registry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub proposals: ProposalConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub webhooks: WebhookConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub dead_letter: DeadLetterConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Proposal lifecycle settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalConfig {
    /// Days a proposal stays pending before the sweep expires it
    #[serde(default = "default_expiration_days")]
    pub expiration_days: i64,

    #[serde(default = "default_true")]
    pub auto_expire_enabled: bool,
}

/// Input size bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_schema_size")]
    pub max_schema_size_bytes: usize,

    #[serde(default = "default_max_properties")]
    pub max_schema_properties: usize,

    /// Longest accepted asset name
    #[serde(default = "default_max_fqn_length")]
    pub max_fqn_length: usize,
}

/// Webhook delivery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Global destination receiving every event
    #[serde(default)]
    pub url: Option<String>,

    /// HMAC secret for the global destination and unsigned subscriptions
    #[serde(default)]
    pub secret: Option<String>,

    /// Empty allows every host
    #[serde(default)]
    pub allowed_domains: Vec<String>,

    #[serde(default = "default_dns_timeout")]
    pub dns_timeout_secs: f64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: f64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    /// JSON-lines file; dead letters stay in memory when unset
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Delivery records and breaker state; defaults to a file beside `path`
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}

impl DeadLetterConfig {
    /// Where delivery state is kept between runs, if anywhere
    pub fn delivery_state_path(&self) -> Option<PathBuf> {
        self.state_path
            .clone()
            .or_else(|| self.path.as_ref().map(|p| p.with_extension("state.json")))
    }
}

/// Where the CLI keeps governance state between runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by RUST_LOG
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_expiration_days() -> i64 {
    30
}

fn default_max_schema_size() -> usize {
    1_000_000
}

fn default_max_properties() -> usize {
    1000
}

fn default_max_fqn_length() -> usize {
    1000
}

fn default_dns_timeout() -> f64 {
    5.0
}

fn default_request_timeout() -> f64 {
    10.0
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    1000
}

fn default_backoff_max() -> u64 {
    30_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown() -> u64 {
    60
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("contracts-state.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ProposalConfig {
    fn default() -> Self {
        Self {
            expiration_days: default_expiration_days(),
            auto_expire_enabled: true,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_schema_size_bytes: default_max_schema_size(),
            max_schema_properties: default_max_properties(),
            max_fqn_length: default_max_fqn_length(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            secret: None,
            allowed_domains: Vec::new(),
            dns_timeout_secs: default_dns_timeout(),
            request_timeout_secs: default_request_timeout(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

impl RegistryConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration, layering an explicit file over the default locations
    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        let config_locations = ["contracts.toml", ".contracts.toml", "config/contracts.toml"];
        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        // Load from XDG config directory
        if let Some(xdg_config) = Self::user_config_path() {
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path).required(true));
        }

        // CONTRACTS__WEBHOOKS__URL, CONTRACTS__PROPOSALS__EXPIRATION_DAYS, ...
        builder = builder.add_source(
            Environment::with_prefix("CONTRACTS")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("webhooks.allowed_domains"),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// `contracts.toml` under the platform config directory
    pub fn user_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "contracts", "contract-registry")
            .map(|dirs| dirs.config_dir().join("contracts.toml"))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| RegistryError::Config(ConfigError::Message(e.to_string())))
    }

    /// Save configuration to a file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut problems: Vec<String> = Vec::new();
        if !(1..=MAX_EXPIRATION_DAYS).contains(&self.proposals.expiration_days) {
            problems.push(format!("proposals.expiration_days must be between 1 and {}", MAX_EXPIRATION_DAYS));
        }
        if self.limits.max_schema_size_bytes == 0 {
            problems.push("limits.max_schema_size_bytes must be positive".into());
        }
        if self.limits.max_schema_properties == 0 {
            problems.push("limits.max_schema_properties must be positive".into());
        }
        if self.limits.max_fqn_length == 0 {
            problems.push("limits.max_fqn_length must be positive".into());
        }
        for (name, secs) in [
            ("webhooks.dns_timeout_secs", self.webhooks.dns_timeout_secs),
            ("webhooks.request_timeout_secs", self.webhooks.request_timeout_secs),
        ] {
            if !(secs.is_finite() && secs > 0.0 && secs <= MAX_TIMEOUT_SECS) {
                problems.push(format!("{} must be positive and at most {}", name, MAX_TIMEOUT_SECS));
            }
        }
        if !(1..=MAX_ATTEMPTS).contains(&self.webhooks.max_attempts) {
            problems.push(format!("webhooks.max_attempts must be between 1 and {}", MAX_ATTEMPTS));
        }
        if self.webhooks.backoff_max_ms > MAX_BACKOFF_MS {
            problems.push(format!("webhooks.backoff_max_ms must be at most {}", MAX_BACKOFF_MS));
        }
        if self.webhooks.backoff_max_ms < self.webhooks.backoff_base_ms {
            problems.push("webhooks.backoff_max_ms must not be below backoff_base_ms".into());
        }
        if self.circuit_breaker.failure_threshold == 0 {
            problems.push("circuit_breaker.failure_threshold must be at least 1".into());
        }
        if !(1..=MAX_COOLDOWN_SECS).contains(&self.circuit_breaker.cooldown_secs) {
            problems.push(format!("circuit_breaker.cooldown_secs must be between 1 and {}", MAX_COOLDOWN_SECS));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::Validation(problems.join("; ")))
        }
    }

    pub fn schema_limits(&self) -> SchemaLimits {
        SchemaLimits {
            max_size_bytes: self.limits.max_schema_size_bytes,
            max_properties: self.limits.max_schema_properties,
        }
    }

    pub fn proposal_window(&self) -> Result<chrono::Duration> {
        chrono::Duration::try_days(self.proposals.expiration_days)
            .ok_or_else(|| out_of_range("proposals.expiration_days"))
    }

    pub fn dispatcher_settings(&self) -> Result<DispatcherSettings> {
        let request_timeout = Duration::try_from_secs_f64(self.webhooks.request_timeout_secs)
            .map_err(|_| out_of_range("webhooks.request_timeout_secs"))?;
        let dns_timeout = Duration::try_from_secs_f64(self.webhooks.dns_timeout_secs)
            .map_err(|_| out_of_range("webhooks.dns_timeout_secs"))?;
        let cooldown = i64::try_from(self.circuit_breaker.cooldown_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .ok_or_else(|| out_of_range("circuit_breaker.cooldown_secs"))?;
        // A trial is a single attempt, bounded by the request timeout
        let trial_timeout = request_timeout
            .checked_mul(2)
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .ok_or_else(|| out_of_range("webhooks.request_timeout_secs"))?;

        Ok(DispatcherSettings {
            retry: RetryPolicy {
                max_attempts: self.webhooks.max_attempts,
                base_delay: Duration::from_millis(self.webhooks.backoff_base_ms),
                max_delay: Duration::from_millis(self.webhooks.backoff_max_ms),
            },
            breaker: BreakerPolicy {
                failure_threshold: self.circuit_breaker.failure_threshold,
                cooldown,
                trial_timeout,
            },
            request_timeout,
            dns_timeout,
            allowed_domains: self.webhooks.allowed_domains.clone(),
            default_secret: self.webhooks.secret.clone(),
        })
    }

    /// The `[webhooks].url` destination as a global subscription
    pub fn global_subscription(&self) -> Option<Subscription> {
        let url = self.webhooks.url.as_deref()?.trim();
        if url.is_empty() {
            return None;
        }
        Some(Subscription::new(GLOBAL_SUBSCRIPTION_ID, url))
    }
}

fn out_of_range(key: &str) -> RegistryError {
    RegistryError::Validation(format!("{} is out of range", key))
}
