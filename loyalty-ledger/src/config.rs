//! Configuration for the jewels ledger

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Longest default lot lifetime accepted (100 years)
pub const MAX_LOT_LIFETIME_DAYS: i64 = 36_500;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Earn/redeem rules
    pub loyalty: LoyaltyConfig,

    /// Per-user lock configuration
    pub locking: LockingConfig,

    /// Expiration sweeper configuration
    pub sweeper: SweeperConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/loyalty"),
            service_name: "loyalty-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            rocksdb: RocksDBConfig::default(),
            loyalty: LoyaltyConfig::default(),
            locking: LockingConfig::default(),
            sweeper: SweeperConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Target file size (MB)
    pub target_file_size_mb: u64,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            target_file_size_mb: 64,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

/// Earn and redemption rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoyaltyConfig {
    /// Smallest redemption accepted (jewels)
    pub min_redemption: i64,

    /// Currency value of one jewel
    pub jewel_to_currency_rate: Decimal,

    /// ISO 4217 code of discounts
    pub currency: String,

    /// Lifetime of an earn lot under `ExpiryPolicy::Default`
    pub default_lot_lifetime_days: i64,
}

impl Default for LoyaltyConfig {
    fn default() -> Self {
        Self {
            min_redemption: 100,
            jewel_to_currency_rate: Decimal::ONE,
            currency: "INR".to_string(),
            default_lot_lifetime_days: 365,
        }
    }
}

/// Per-user lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    /// Max wait for a user's lock before `RetryableConflict`
    pub lock_timeout_ms: u64,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 2_000,
        }
    }
}

/// Expiration sweeper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    /// Run the periodic sweep
    pub enabled: bool,

    /// Seconds between sweeps
    pub interval_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3_600,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("LOYALTY_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(value) = std::env::var("LOYALTY_MIN_REDEMPTION") {
            config.loyalty.min_redemption = parse_env("LOYALTY_MIN_REDEMPTION", &value)?;
        }

        if let Ok(value) = std::env::var("LOYALTY_JEWEL_RATE") {
            config.loyalty.jewel_to_currency_rate = Decimal::from_str(&value).map_err(|e| {
                crate::Error::Config(format!("LOYALTY_JEWEL_RATE '{}': {}", value, e))
            })?;
        }

        if let Ok(currency) = std::env::var("LOYALTY_CURRENCY") {
            config.loyalty.currency = currency;
        }

        if let Ok(value) = std::env::var("LOYALTY_LOT_LIFETIME_DAYS") {
            config.loyalty.default_lot_lifetime_days =
                parse_env("LOYALTY_LOT_LIFETIME_DAYS", &value)?;
        }

        if let Ok(value) = std::env::var("LOYALTY_LOCK_TIMEOUT_MS") {
            config.locking.lock_timeout_ms = parse_env("LOYALTY_LOCK_TIMEOUT_MS", &value)?;
        }

        if let Ok(value) = std::env::var("LOYALTY_SWEEP_INTERVAL_SECS") {
            config.sweeper.interval_secs = parse_env("LOYALTY_SWEEP_INTERVAL_SECS", &value)?;
        }

        Ok(config)
    }

    /// Reject settings the ledger cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.loyalty.min_redemption <= 0 {
            return Err(crate::Error::Config(
                "min_redemption must be positive".to_string(),
            ));
        }
        if self.loyalty.jewel_to_currency_rate <= Decimal::ZERO {
            return Err(crate::Error::Config(
                "jewel_to_currency_rate must be positive".to_string(),
            ));
        }
        if self.loyalty.default_lot_lifetime_days <= 0
            || self.loyalty.default_lot_lifetime_days > MAX_LOT_LIFETIME_DAYS
        {
            return Err(crate::Error::Config(format!(
                "default_lot_lifetime_days must be in 1..={}",
                MAX_LOT_LIFETIME_DAYS
            )));
        }
        if self.sweeper.interval_secs == 0 {
            return Err(crate::Error::Config(
                "sweeper.interval_secs must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T>(name: &str, value: &str) -> crate::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| crate::Error::Config(format!("{} '{}': {}", name, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "loyalty-ledger");
        assert_eq!(config.loyalty.min_redemption, 100);
        assert_eq!(config.loyalty.jewel_to_currency_rate, Decimal::ONE);
        assert_eq!(config.loyalty.default_lot_lifetime_days, 365);
        assert!(config.sweeper.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            data_dir = "/var/lib/loyalty"

            [loyalty]
            min_redemption = 250
            jewel_to_currency_rate = "0.5"
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/loyalty"));
        assert_eq!(config.loyalty.min_redemption, 250);
        assert_eq!(config.loyalty.jewel_to_currency_rate, Decimal::new(5, 1));
        assert_eq!(config.loyalty.currency, "INR");
        assert_eq!(config.locking.lock_timeout_ms, 2_000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.loyalty.min_redemption = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.loyalty.jewel_to_currency_rate = Decimal::ZERO;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.sweeper.interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.loyalty.default_lot_lifetime_days = MAX_LOT_LIFETIME_DAYS;
        assert!(config.validate().is_ok());
        config.loyalty.default_lot_lifetime_days = i64::MAX;
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));
    }
}
