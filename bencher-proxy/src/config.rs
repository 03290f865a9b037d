//! Configuration management for bencher-proxy.
//!
//! The proxy reads a single YAML file (by convention `config.yaml` in the
//! working directory). Key names mirror the fleet's deployed configuration,
//! so they are camelCase rather than the usual serde defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Main configuration structure for the proxy.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Miner-facing listen address
    #[serde(rename = "listenAddress")]
    pub listen_address: String,

    /// Stats listener address; stats are disabled when absent
    #[serde(default, rename = "statsListenAddr")]
    pub stats_listen_addr: Option<String>,

    /// Distinct account ids accepted per source address
    #[serde(default = "default_miners_per_ip", rename = "minersPerIP")]
    pub miners_per_ip: usize,

    /// Primary upstream base URL; a `wss` scheme selects the push transport
    #[serde(rename = "primarySubmitURL")]
    pub primary_submit_url: String,

    /// Optional secondary upstream base URL
    #[serde(default, rename = "secondarySubmitURL")]
    pub secondary_submit_url: Option<String>,

    #[serde(default, rename = "primaryPassphrase")]
    pub primary_passphrase: String,

    #[serde(default, rename = "secondaryPassphrase")]
    pub secondary_passphrase: String,

    /// Forward the miner's source address upstream via X-Forwarded-For
    #[serde(default, rename = "primaryIpForwarding")]
    pub primary_ip_forwarding: bool,

    #[serde(default, rename = "secondaryIpForwarding")]
    pub secondary_ip_forwarding: bool,

    /// Drop submissions worse than the best one seen this round
    #[serde(default, rename = "primaryIgnoreWorseDeadlines")]
    pub primary_ignore_worse_deadlines: bool,

    #[serde(default, rename = "secondaryIgnoreWorseDeadlines")]
    pub secondary_ignore_worse_deadlines: bool,

    /// Account key sent upstream in the X-Account header / push handshake
    #[serde(default, rename = "primaryAccountKey")]
    pub primary_account_key: String,

    #[serde(default, rename = "secondaryAccountKey")]
    pub secondary_account_key: String,

    /// Deadline ceiling in seconds; anything above is filtered locally
    #[serde(default = "default_target_deadline", rename = "primaryTargetDeadline")]
    pub primary_target_deadline: u64,

    #[serde(default = "default_target_deadline", rename = "secondaryTargetDeadline")]
    pub secondary_target_deadline: u64,

    /// Upper bound, in seconds, on how long miners scan one block
    #[serde(default, rename = "scanTime")]
    pub scan_time: u64,

    /// Requests per second allowed per path
    #[serde(default = "default_rate_limit", rename = "rateLimit")]
    pub rate_limit: u32,

    /// Burst allowance on top of `rateLimit`
    #[serde(default = "default_burst_rate", rename = "burstRate")]
    pub burst_rate: u32,

    /// Quarantine sources whose reported deadline disagrees with ours
    #[serde(default, rename = "lieDetector")]
    pub lie_detector: bool,

    /// Name reported to push upstreams
    #[serde(default, rename = "minerName")]
    pub miner_name: String,

    /// Alias sent upstream in the X-MinerAlias header
    #[serde(default, rename = "minerAlias")]
    pub miner_alias: String,

    /// Log the known-miner table on every block transition
    #[serde(default, rename = "displayMiners")]
    pub display_miners: bool,

    /// Mirror log output to log.txt
    #[serde(default, rename = "fileLogging")]
    pub file_logging: bool,

    /// TLS material, accepted for fleet config compatibility; termination
    /// happens in the fronting proxy
    #[serde(default, rename = "certFile")]
    pub cert_file: Option<PathBuf>,

    #[serde(default, rename = "keyFile")]
    pub key_file: Option<PathBuf>,
}

fn default_miners_per_ip() -> usize {
    1
}

fn default_target_deadline() -> u64 {
    u64::MAX
}

fn default_rate_limit() -> u32 {
    100
}

fn default_burst_rate() -> u32 {
    100
}

fn is_push_url(url: &str) -> bool {
    url.starts_with("wss")
}

impl Config {
    /// Load and validate configuration from `path`.
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.primary_push() && self.secondary_push() {
            return Err(Error::Config(
                "at most one upstream may be a websocket (wss) endpoint".to_string(),
            ));
        }
        if self.miners_per_ip == 0 {
            return Err(Error::Config("minersPerIP must be at least 1".to_string()));
        }
        if self.rate_limit == 0 {
            return Err(Error::Config("rateLimit must be at least 1".to_string()));
        }
        Ok(())
    }

    /// The secondary upstream URL, with an empty string meaning "none".
    pub fn secondary_submit_url(&self) -> Option<&str> {
        self.secondary_submit_url
            .as_deref()
            .filter(|url| !url.is_empty())
    }

    pub fn primary_push(&self) -> bool {
        is_push_url(&self.primary_submit_url)
    }

    pub fn secondary_push(&self) -> bool {
        self.secondary_submit_url().is_some_and(is_push_url)
    }
}
