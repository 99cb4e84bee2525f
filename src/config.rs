use std::collections::HashMap;
use std::time::Duration;

use crate::error::ConfigError;
use crate::types::MerchantId;

/// Runtime mode of the hosting process.
///
/// Outside production, test sends and broadcasts never reach providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeMode {
    #[default]
    Production,
    Test,
}

impl RuntimeMode {
    pub fn is_production(&self) -> bool {
        matches!(self, RuntimeMode::Production)
    }
}

/// Per-merchant requests-per-second budget. `0` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateBudget {
    pub default_rps: u32,
    pub per_merchant: HashMap<MerchantId, u32>,
}

impl RateBudget {
    pub fn new(default_rps: u32) -> Self {
        Self {
            default_rps,
            per_merchant: HashMap::new(),
        }
    }

    pub fn with_override(mut self, merchant_id: impl Into<String>, rps: u32) -> Self {
        self.per_merchant.insert(MerchantId(merchant_id.into()), rps);
        self
    }

    pub fn rps_for(&self, merchant_id: &MerchantId) -> u32 {
        self.per_merchant
            .get(merchant_id)
            .copied()
            .unwrap_or(self.default_rps)
    }

    /// Parse `merchant=rps` pairs separated by commas.
    pub fn parse_overrides(raw: &str) -> Result<HashMap<MerchantId, u32>, ConfigError> {
        let mut overrides = HashMap::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((merchant, rps)) = part.split_once('=') else {
                return Err(ConfigError::new(ENV_RPS_BY_MERCHANT, part, "expected merchant=rps"));
            };
            let merchant = merchant.trim();
            if merchant.is_empty() {
                return Err(ConfigError::new(ENV_RPS_BY_MERCHANT, part, "empty merchant id"));
            }
            let rps = rps
                .trim()
                .parse::<u32>()
                .map_err(|e| ConfigError::new(ENV_RPS_BY_MERCHANT, part, e.to_string()))?;
            overrides.insert(MerchantId(merchant.to_string()), rps);
        }
        Ok(overrides)
    }
}

const ENV_ENABLED: &str = "WORKERS_ENABLED";
const ENV_INTERVAL_MS: &str = "NOTIFY_WORKER_INTERVAL_MS";
const ENV_BATCH: &str = "NOTIFY_WORKER_BATCH";
const ENV_MAX_RETRIES: &str = "NOTIFY_MAX_RETRIES";
const ENV_BACKOFF_BASE_MS: &str = "NOTIFY_BACKOFF_BASE_MS";
const ENV_BACKOFF_CAP_MS: &str = "NOTIFY_BACKOFF_CAP_MS";
const ENV_RPS_DEFAULT: &str = "NOTIFY_RPS_DEFAULT";
const ENV_RPS_BY_MERCHANT: &str = "NOTIFY_RPS_BY_MERCHANT";
const ENV_SENDING_STALE_MS: &str = "NOTIFY_SENDING_STALE_MS";
const ENV_APP_ENV: &str = "APP_ENV";

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// When false the scheduler is never spawned.
    pub enabled: bool,
    /// Name of the cluster-wide lock serializing ticks.
    pub worker_name: String,
    /// Event type prefix handled by this dispatcher.
    pub namespace: String,
    pub tick_interval: Duration,
    pub batch_size: usize,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Fixed delay applied to throttled events.
    pub throttle_delay: Duration,
    /// Rows stuck in `SENDING` longer than this are returned to `PENDING`.
    pub sending_stale_after: Option<Duration>,
    pub rate_limits: RateBudget,
    pub runtime: RuntimeMode,
    /// Upper bound on waiting for the in-flight tick during shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_name: "worker:notification_dispatcher".to_string(),
            namespace: "notify.".to_string(),
            tick_interval: Duration::from_millis(3_000),
            batch_size: 10,
            max_retries: 8,
            backoff_base: Duration::from_millis(60_000),
            backoff_cap: Duration::from_millis(3_600_000),
            throttle_delay: Duration::from_secs(1),
            sending_stale_after: Some(Duration::from_millis(300_000)),
            rate_limits: RateBudget::default(),
            runtime: RuntimeMode::Production,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl DispatcherConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key/value source.
    ///
    /// Unset keys keep their defaults, except `WORKERS_ENABLED`, which must be
    /// set explicitly to run the dispatcher.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        config.enabled = match lookup(ENV_ENABLED) {
            Some(raw) => parse_flag(ENV_ENABLED, &raw)?,
            None => false,
        };
        if let Some(ms) = read_number::<u64>(&lookup, ENV_INTERVAL_MS)? {
            if ms == 0 {
                return Err(ConfigError::new(ENV_INTERVAL_MS, "0", "must be positive"));
            }
            config.tick_interval = Duration::from_millis(ms);
        }
        if let Some(batch) = read_number::<usize>(&lookup, ENV_BATCH)? {
            config.batch_size = batch;
        }
        if let Some(max) = read_number::<u32>(&lookup, ENV_MAX_RETRIES)? {
            config.max_retries = max;
        }
        if let Some(ms) = read_number::<u64>(&lookup, ENV_BACKOFF_BASE_MS)? {
            config.backoff_base = Duration::from_millis(ms);
        }
        if let Some(ms) = read_number::<u64>(&lookup, ENV_BACKOFF_CAP_MS)? {
            config.backoff_cap = Duration::from_millis(ms);
        }
        if let Some(rps) = read_number::<u32>(&lookup, ENV_RPS_DEFAULT)? {
            config.rate_limits.default_rps = rps;
        }
        if let Some(raw) = lookup(ENV_RPS_BY_MERCHANT) {
            config.rate_limits.per_merchant = RateBudget::parse_overrides(&raw)?;
        }
        if let Some(ms) = read_number::<u64>(&lookup, ENV_SENDING_STALE_MS)? {
            config.sending_stale_after = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(env) = lookup(ENV_APP_ENV) {
            config.runtime = if env.trim().eq_ignore_ascii_case("test") {
                RuntimeMode::Test
            } else {
                RuntimeMode::Production
            };
        }

        Ok(config)
    }
}

fn parse_flag(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::new(key, raw, "expected a boolean flag")),
    }
}

fn read_number<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<T>()
        .map(Some)
        .map_err(|e| ConfigError::new(key, &raw, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_keeps_defaults_but_stays_disabled() {
        let config = DispatcherConfig::from_lookup(lookup_from(&[])).unwrap();
        assert!(!config.enabled);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.max_retries, 8);
        assert_eq!(config.backoff_base, Duration::from_secs(60));
        assert_eq!(config.runtime, RuntimeMode::Production);
    }

    #[test]
    fn reads_every_recognized_option() {
        let config = DispatcherConfig::from_lookup(lookup_from(&[
            ("WORKERS_ENABLED", "1"),
            ("NOTIFY_WORKER_INTERVAL_MS", "500"),
            ("NOTIFY_WORKER_BATCH", "25"),
            ("NOTIFY_MAX_RETRIES", "3"),
            ("NOTIFY_BACKOFF_BASE_MS", "1000"),
            ("NOTIFY_BACKOFF_CAP_MS", "8000"),
            ("NOTIFY_RPS_DEFAULT", "5"),
            ("NOTIFY_RPS_BY_MERCHANT", "m-1=2, m-2=0"),
            ("NOTIFY_SENDING_STALE_MS", "0"),
            ("APP_ENV", "test"),
        ]))
        .unwrap();

        assert!(config.enabled);
        assert_eq!(config.tick_interval, Duration::from_millis(500));
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.backoff_cap, Duration::from_secs(8));
        assert_eq!(config.rate_limits.rps_for(&MerchantId("m-1".into())), 2);
        assert_eq!(config.rate_limits.rps_for(&MerchantId("m-2".into())), 0);
        assert_eq!(config.rate_limits.rps_for(&MerchantId("other".into())), 5);
        assert_eq!(config.sending_stale_after, None);
        assert_eq!(config.runtime, RuntimeMode::Test);
    }

    #[test]
    fn malformed_numbers_name_the_variable() {
        let err = DispatcherConfig::from_lookup(lookup_from(&[("NOTIFY_WORKER_BATCH", "ten")]))
            .unwrap_err();
        assert_eq!(err.key, "NOTIFY_WORKER_BATCH");
    }

    #[test]
    fn malformed_override_is_rejected() {
        assert!(RateBudget::parse_overrides("m-1").is_err());
        assert!(RateBudget::parse_overrides("m-1=x").is_err());
        assert!(RateBudget::parse_overrides("").unwrap().is_empty());
    }
}
