use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::models::ScoreWeights;

/// Errors raised while loading or validating the configuration.
///
/// These are the only errors in the crate that are fatal: they can
/// occur at startup and never mid-run.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Configuration for the banwatch daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log tailing configuration
    pub input: InputConfig,
    /// Persistent cache configuration
    pub cache: CacheConfig,
    /// fail2ban history import configuration
    pub import: ImportConfig,
    /// Aggregation policy
    pub aggregation: AggregationConfig,
    /// ASN enrichment configuration
    pub asn: AsnConfig,
}

/// Log tailing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Path to the sshd auth log
    pub auth_log: PathBuf,
    /// Path to the fail2ban activity log
    pub fail2ban_log: PathBuf,
    /// Jail name attributed to sshd auth events
    pub jail: String,
    /// Count accepted-login (OK) events in the persistent cache
    pub show_ok: bool,
    /// Tailer poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Capacity of the in-memory recent-events ring
    pub recent_events: usize,
}

/// Persistent cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Path of the cache sqlite database
    pub path: PathBuf,
    /// Seed the realtime view with the N most recently seen cached
    /// IPs at startup (0 disables seeding)
    pub bootstrap_rows: usize,
}

/// fail2ban history import configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Path of fail2ban's own sqlite database
    pub fail2ban_db: PathBuf,
    /// Run the importer once at startup
    pub on_start: bool,
    /// Re-run the importer every N seconds (0 = startup only)
    pub interval_secs: u64,
}

/// Aggregation policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Subnet prefix length for IPv4 addresses
    pub subnet_prefix_v4: u8,
    /// Subnet prefix length for IPv6 addresses
    pub subnet_prefix_v6: u8,
    /// Number of subnets kept in the top-subnets view
    pub top_subnets: usize,
    /// Score weights for ranking IPs and subnets
    pub weights: ScoreWeights,
}

/// ASN enrichment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsnConfig {
    /// Enable provider lookups
    pub enable: bool,
    /// Minimum interval between bulk requests, in seconds
    pub refresh_interval_secs: u64,
    /// TTL of a resolved record, in seconds
    pub ttl_secs: i64,
    /// TTL of a negative (unresolvable) record, in seconds
    pub negative_ttl_secs: i64,
    /// Maximum IPs per bulk request
    pub batch_size: usize,
    /// Provider connect/read timeout, in seconds
    pub timeout_secs: u64,
    /// Bulk whois host
    pub whois_host: String,
    /// Bulk whois TCP port
    pub whois_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            input: InputConfig {
                auth_log: PathBuf::from("/var/log/auth.log"),
                fail2ban_log: PathBuf::from("/var/log/fail2ban.log"),
                jail: "sshd".to_string(),
                show_ok: false,
                poll_interval_ms: 250,
                recent_events: 500,
            },
            cache: CacheConfig {
                path: PathBuf::from("banwatch_cache.sqlite3"),
                bootstrap_rows: 100,
            },
            import: ImportConfig {
                fail2ban_db: PathBuf::from("/var/lib/fail2ban/fail2ban.sqlite3"),
                on_start: true,
                interval_secs: 0,
            },
            aggregation: AggregationConfig {
                subnet_prefix_v4: 24,
                subnet_prefix_v6: 64,
                top_subnets: 10,
                weights: ScoreWeights::default(),
            },
            asn: AsnConfig {
                enable: true,
                refresh_interval_secs: 10,
                ttl_secs: 24 * 3600,
                negative_ttl_secs: 3600,
                batch_size: 20,
                timeout_secs: 4,
                whois_host: "whois.cymru.com".to_string(),
                whois_port: 43,
            },
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file(&self, path: &PathBuf) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject configurations the pipeline cannot run with. Called
    /// once at startup; nothing here can fail mid-run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.aggregation.subnet_prefix_v4 > 32 {
            return Err(ConfigError::Invalid(format!(
                "subnet_prefix_v4 must be 0..=32, got {}",
                self.aggregation.subnet_prefix_v4
            )));
        }
        if self.aggregation.subnet_prefix_v6 > 128 {
            return Err(ConfigError::Invalid(format!(
                "subnet_prefix_v6 must be 0..=128, got {}",
                self.aggregation.subnet_prefix_v6
            )));
        }
        if self.input.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.input.recent_events == 0 {
            return Err(ConfigError::Invalid(
                "recent_events must be greater than zero".to_string(),
            ));
        }
        if self.input.auth_log.as_os_str().is_empty()
            || self.input.fail2ban_log.as_os_str().is_empty()
        {
            return Err(ConfigError::Invalid(
                "log paths must not be empty".to_string(),
            ));
        }
        if self.cache.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "cache path must not be empty".to_string(),
            ));
        }
        if self.asn.enable {
            if self.asn.batch_size == 0 {
                return Err(ConfigError::Invalid(
                    "asn batch_size must be greater than zero".to_string(),
                ));
            }
            if self.asn.refresh_interval_secs == 0 {
                return Err(ConfigError::Invalid(
                    "asn refresh_interval_secs must be greater than zero".to_string(),
                ));
            }
            if self.asn.ttl_secs <= 0 || self.asn.negative_ttl_secs <= 0 {
                return Err(ConfigError::Invalid(
                    "asn TTLs must be greater than zero".to_string(),
                ));
            }
            if self.asn.whois_host.is_empty() {
                return Err(ConfigError::Invalid(
                    "asn whois_host must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}
