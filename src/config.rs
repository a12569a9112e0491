//! Configuration management for Gatekeeper.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::EndpointRules;
use crate::security::ReputationTarget;

/// Prefix for environment variable overrides, e.g.
/// `GATEKEEPER__RATE_LIMITING__PER_IP_RPS=10`.
const ENV_PREFIX: &str = "GATEKEEPER";

/// Longest accepted duration, in seconds, for bans, TTLs, windows and the
/// cleanup interval (ten years).
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Admission policy
    #[serde(default)]
    pub rate_limiting: RateLimitPolicy,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Take the client IP from `X-Forwarded-For` / `X-Real-IP`.
    /// Only enable behind a proxy that overwrites these headers.
    #[serde(default)]
    pub trust_forwarded_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            trust_forwarded_headers: false,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Throughput and reputation policy applied to every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Sustained requests per second across all clients
    #[serde(default = "default_global_rps")]
    pub global_rps: f64,

    /// Burst capacity of the global bucket
    #[serde(default = "default_global_burst")]
    pub global_burst: f64,

    /// Sustained requests per second for a single client IP
    #[serde(default = "default_per_ip_rps")]
    pub per_ip_rps: f64,

    /// Burst capacity of each per-IP bucket
    #[serde(default = "default_per_ip_burst")]
    pub per_ip_burst: f64,

    /// Stricter limits for individual endpoints
    #[serde(default)]
    pub endpoint_limits: Vec<EndpointLimit>,

    /// How often the cleanup sweeper runs, in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Buckets idle for this many cleanup intervals are evicted
    #[serde(default = "default_bucket_idle_intervals")]
    pub bucket_idle_intervals: u32,

    /// Automatic temporary banning
    #[serde(default)]
    pub auto_ban: AutoBanConfig,

    /// IPs or CIDR networks whitelisted permanently at startup
    #[serde(default)]
    pub whitelist: Vec<String>,

    /// IPs or CIDR networks blacklisted permanently at startup
    #[serde(default)]
    pub blacklist: Vec<String>,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            global_rps: default_global_rps(),
            global_burst: default_global_burst(),
            per_ip_rps: default_per_ip_rps(),
            per_ip_burst: default_per_ip_burst(),
            endpoint_limits: Vec::new(),
            cleanup_interval_secs: default_cleanup_interval(),
            bucket_idle_intervals: default_bucket_idle_intervals(),
            auto_ban: AutoBanConfig::default(),
            whitelist: Vec::new(),
            blacklist: Vec::new(),
        }
    }
}

fn default_global_rps() -> f64 {
    1000.0
}

fn default_global_burst() -> f64 {
    2000.0
}

fn default_per_ip_rps() -> f64 {
    10.0
}

fn default_per_ip_burst() -> f64 {
    20.0
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_bucket_idle_intervals() -> u32 {
    3
}

/// A per-endpoint override, e.g. `POST /auth/login` at 2 rps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointLimit {
    /// HTTP method, case-insensitive
    pub method: String,
    /// Path pattern; `:id`, `{id}` and a trailing `*rest` are parameters
    pub path: String,
    pub rps: f64,
    pub burst: f64,
}

/// Auto-ban configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoBanConfig {
    #[serde(default = "default_auto_ban_enabled")]
    pub enabled: bool,

    /// Violations within the window that trigger a ban
    #[serde(default = "default_auto_ban_threshold")]
    pub threshold: u32,

    /// Violation counting window in seconds
    #[serde(default = "default_auto_ban_window")]
    pub window_secs: u64,

    /// Ban length in seconds
    #[serde(default = "default_ban_duration")]
    pub ban_duration_secs: u64,
}

impl Default for AutoBanConfig {
    fn default() -> Self {
        Self {
            enabled: default_auto_ban_enabled(),
            threshold: default_auto_ban_threshold(),
            window_secs: default_auto_ban_window(),
            ban_duration_secs: default_ban_duration(),
        }
    }
}

fn default_auto_ban_enabled() -> bool {
    true
}

fn default_auto_ban_threshold() -> u32 {
    10
}

fn default_auto_ban_window() -> u64 {
    60
}

fn default_ban_duration() -> u64 {
    900
}

impl AutoBanConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_duration_secs)
    }
}

impl RateLimitPolicy {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// How long a per-IP or endpoint bucket may sit untouched before eviction.
    pub fn bucket_idle_timeout(&self) -> Duration {
        self.cleanup_interval()
            .saturating_mul(self.bucket_idle_intervals.max(1))
    }

    /// Check the policy for values that can never work.
    pub fn validate(&self) -> Result<()> {
        check_rate("global", self.global_rps, self.global_burst)?;
        check_rate("per_ip", self.per_ip_rps, self.per_ip_burst)?;

        if self.cleanup_interval_secs == 0 {
            return Err(GatekeeperError::Config(
                "cleanup_interval_secs must be positive".to_string(),
            ));
        }

        check_duration("cleanup_interval_secs", self.cleanup_interval_secs)?;
        check_duration("auto_ban.window_secs", self.auto_ban.window_secs)?;
        check_duration("auto_ban.ban_duration_secs", self.auto_ban.ban_duration_secs)?;

        if self.auto_ban.enabled {
            if self.auto_ban.threshold == 0 {
                return Err(GatekeeperError::Config(
                    "auto_ban.threshold must be at least 1".to_string(),
                ));
            }
            if self.auto_ban.window_secs == 0 || self.auto_ban.ban_duration_secs == 0 {
                return Err(GatekeeperError::Config(
                    "auto_ban.window_secs and auto_ban.ban_duration_secs must be positive"
                        .to_string(),
                ));
            }
        }

        for limit in &self.endpoint_limits {
            let scope = format!("{} {}", limit.method, limit.path);
            check_rate(&scope, limit.rps, limit.burst)?;
            if limit.rps > self.per_ip_rps || limit.burst > self.per_ip_burst {
                warn!(
                    endpoint = %scope,
                    rps = limit.rps,
                    burst = limit.burst,
                    "Endpoint limit is looser than the per-IP default; per-IP limit still applies"
                );
            }
        }
        EndpointRules::from_limits(&self.endpoint_limits)?;

        for entry in self.whitelist.iter().chain(self.blacklist.iter()) {
            entry.parse::<ReputationTarget>().map_err(|e| {
                GatekeeperError::Config(format!("Invalid reputation entry '{}': {}", entry, e))
            })?;
        }

        Ok(())
    }
}

fn check_duration(field: &str, secs: u64) -> Result<()> {
    if secs > MAX_DURATION_SECS {
        return Err(GatekeeperError::Config(format!(
            "{} must be at most {} seconds, got {}",
            field, MAX_DURATION_SECS, secs
        )));
    }
    Ok(())
}

fn check_rate(scope: &str, rps: f64, burst: f64) -> Result<()> {
    if !rps.is_finite() || rps <= 0.0 {
        return Err(GatekeeperError::Config(format!(
            "{} rps must be a positive number, got {}",
            scope, rps
        )));
    }
    if !burst.is_finite() || burst < 1.0 {
        return Err(GatekeeperError::Config(format!(
            "{} burst must be at least 1, got {}",
            scope, burst
        )));
    }
    Ok(())
}

impl GatekeeperConfig {
    /// Load configuration from an optional YAML file layered under
    /// `GATEKEEPER__*` environment variables, then validate it.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path, "Loading configuration file");
            builder = builder.add_source(config::File::new(path, config::FileFormat::Yaml));
        }

        let config: GatekeeperConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatekeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.rate_limiting.validate()
    }
}
