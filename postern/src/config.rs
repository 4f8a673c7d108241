//! Process configuration, loaded from a TOML file.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
};

use postern_policy::PolicyConfig;
use postern_smtp::SmtpTimeouts;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub certificate: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// username -> password. A fixed table; real deployments implement the
    /// credential verifier contract against their own directory.
    #[serde(default)]
    pub users: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// Seconds in-flight sessions get to finish after the shutdown signal.
    #[serde(default = "default_drain")]
    pub drain_s: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_s: default_drain(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// EHLO identity and banner hostname. Falls back to $HOSTNAME.
    #[serde(default)]
    pub hostname: String,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub strict_esmtp_params: bool,

    #[serde(default)]
    pub timeouts: SmtpTimeouts,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,

    #[serde(default)]
    pub tls: Option<TlsConfig>,

    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            strict_esmtp_params: false,
            timeouts: SmtpTimeouts::default(),
            policy: PolicyConfig::default(),
            shutdown: ShutdownConfig::default(),
            tls: None,
            auth: None,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|err| {
            anyhow::anyhow!("Unable to read {}: {err}", path.as_ref().display())
        })?;
        Ok(toml::from_str(&raw)?)
    }

    pub const fn socket(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

const fn default_enabled() -> bool {
    true
}

const fn default_drain() -> u64 {
    30
}

fn default_bind_addr() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

const fn default_port() -> u16 {
    25
}
