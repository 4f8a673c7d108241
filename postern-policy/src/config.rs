//! Admission policy configuration.

use serde::Deserialize;

/// Sliding-window rate limit configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RateConfig {
    /// Window length in seconds.
    #[serde(default = "default_rate_window")]
    pub window_s: u64,

    /// Maximum transaction commits per peer address per window.
    #[serde(default = "default_rate_per_ip")]
    pub per_ip: u32,

    /// Maximum transaction commits per authenticated user per window.
    #[serde(default = "default_rate_per_user")]
    pub per_user: u32,

    /// How often the background sweep drops empty counters, in seconds.
    #[serde(default = "default_rate_cleanup_interval")]
    pub cleanup_interval_s: u64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            window_s: default_rate_window(),
            per_ip: default_rate_per_ip(),
            per_user: default_rate_per_user(),
            cleanup_interval_s: default_rate_cleanup_interval(),
        }
    }
}

const fn default_rate_window() -> u64 {
    60
}

const fn default_rate_per_ip() -> u32 {
    30
}

const fn default_rate_per_user() -> u32 {
    120
}

const fn default_rate_cleanup_interval() -> u64 {
    300
}

/// Greylisting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GreylistConfig {
    #[serde(default)]
    pub enabled: bool,

    /// How long a first-seen triplet is deferred, in seconds.
    #[serde(default = "default_greylist_delay")]
    pub delay_s: u64,

    /// Rows older than this are evicted, in seconds.
    #[serde(default = "default_greylist_ttl")]
    pub ttl_s: u64,

    /// Accepted deliveries before a triplet is whitelisted outright.
    #[serde(default = "default_whitelist_threshold")]
    pub whitelist_threshold: u32,
}

impl Default for GreylistConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            delay_s: default_greylist_delay(),
            ttl_s: default_greylist_ttl(),
            whitelist_threshold: default_whitelist_threshold(),
        }
    }
}

const fn default_greylist_delay() -> u64 {
    300
}

const fn default_greylist_ttl() -> u64 {
    // 36 days, the customary greylist retention horizon
    86_400 * 36
}

const fn default_whitelist_threshold() -> u32 {
    3
}

/// Process-wide admission policy. Immutable after construction.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    /// Total live session cap across all listeners.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Live session cap per peer address.
    #[serde(default = "default_max_per_ip")]
    pub max_per_ip: u32,

    /// Recipients accepted per transaction.
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,

    /// Message size cap in bytes, enforced against both the declared SIZE
    /// parameter and the actual ingested byte count. 0 means unlimited.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: u64,

    #[serde(default)]
    pub rate: RateConfig,

    #[serde(default)]
    pub greylist: GreylistConfig,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_per_ip: default_max_per_ip(),
            max_recipients: default_max_recipients(),
            max_message_size: default_max_message_size(),
            rate: RateConfig::default(),
            greylist: GreylistConfig::default(),
        }
    }
}

const fn default_max_connections() -> usize {
    512
}

const fn default_max_per_ip() -> u32 {
    16
}

const fn default_max_recipients() -> usize {
    100
}

const fn default_max_message_size() -> u64 {
    // 25 MiB
    26_214_400
}
