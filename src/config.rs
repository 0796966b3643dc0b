//! Configuration for the S-CSCF core (spec §4.7, grounded on `x402-rs::config`).
//!
//! Same shape as the teacher: a `clap::Parser` CLI struct carrying a `--config`/
//! `env = "CONFIG"` path to a JSON file, deserialized into a config struct whose
//! fields fall back to `#[serde(default = "...")]` functions when absent from the
//! file.

use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::auth::NonRegisterAuthMode;

#[derive(Parser, Debug)]
#[command(name = "scscf-core")]
#[command(about = "IMS Serving-CSCF core: auth, registrar, subscription manager, proxy-tsx")]
pub struct CliArgs {
    /// Path to the JSON configuration file.
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    pub config: PathBuf,
}

/// Node configuration (spec §4.7). Everything here is read once at startup and handed
/// to components as an `Arc<NodeConfig>` constructor dependency (spec §9 "global-ish
/// services ... passed explicitly").
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "config_defaults::default_admin_port")]
    pub admin_port: u16,
    #[serde(default = "config_defaults::default_admin_host")]
    pub admin_host: IpAddr,

    #[serde(default = "config_defaults::default_scscf_uri")]
    pub scscf_uri: String,
    #[serde(default = "config_defaults::default_realm")]
    pub realm: String,

    #[serde(default)]
    pub non_register_auth_mode: NonRegisterAuthMode,

    #[serde(default = "config_defaults::default_min_expires")]
    pub min_expires_seconds: u32,
    #[serde(default = "config_defaults::default_max_expires")]
    pub max_expires_seconds: u32,
    #[serde(default = "config_defaults::default_min_sub_expires")]
    pub min_sub_expires_seconds: u32,
    #[serde(default = "config_defaults::default_max_sub_expires")]
    pub max_sub_expires_seconds: u32,

    #[serde(default = "config_defaults::default_nonce_ttl_slack")]
    pub nonce_ttl_slack_seconds: u64,

    #[serde(default = "config_defaults::default_session_continued_timeout_ms")]
    pub session_continued_timeout_ms: u64,
    #[serde(default = "config_defaults::default_session_terminated_timeout_ms")]
    pub session_terminated_timeout_ms: u64,

    #[serde(default = "config_defaults::default_max_forking")]
    pub max_forking: usize,

    #[serde(default = "config_defaults::default_cas_retry_deadline_ms")]
    pub cas_retry_deadline_ms: u64,

    #[serde(default)]
    pub remote_store_endpoints: Vec<String>,

    #[serde(default = "config_defaults::default_auto_reg")]
    pub auto_reg: bool,
}

impl NodeConfig {
    /// `av` record TTL per spec §4.1/§9(c): challenge response window plus the
    /// longest expected binding refresh period, not a bare constant.
    pub fn nonce_ttl_seconds(&self) -> u64 {
        let response_window = self.session_continued_timeout_ms.max(self.session_terminated_timeout_ms) / 1000;
        response_window + self.max_expires_seconds as u64 + self.nonce_ttl_slack_seconds
    }

    /// `aor` record TTL (spec §6): long enough to outlive the longest binding or
    /// subscription refresh period this node can grant, plus slack, so the store
    /// never reaps an AoR the registrar or subscription manager still considers live.
    pub fn aor_ttl_seconds(&self) -> u64 {
        self.max_expires_seconds.max(self.max_sub_expires_seconds) as u64 + self.nonce_ttl_slack_seconds
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        serde_json::from_str("{}").expect("all fields have defaults")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path} as JSON: {source}")]
    JsonParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl NodeConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let args = CliArgs::parse();
        Self::load_from_path(&args.config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::JsonParse {
            path: path.to_path_buf(),
            source,
        })
    }
}

mod config_defaults {
    use std::net::IpAddr;

    pub fn default_admin_port() -> u16 {
        8080
    }

    pub fn default_admin_host() -> IpAddr {
        "0.0.0.0".parse().unwrap()
    }

    pub fn default_scscf_uri() -> String {
        "sip:scscf.home.net:5060".to_string()
    }

    pub fn default_realm() -> String {
        "home.net".to_string()
    }

    pub fn default_min_expires() -> u32 {
        60
    }

    pub fn default_max_expires() -> u32 {
        7_200_u32.max(600)
    }

    pub fn default_min_sub_expires() -> u32 {
        60
    }

    pub fn default_max_sub_expires() -> u32 {
        3_600
    }

    pub fn default_nonce_ttl_slack() -> u64 {
        30
    }

    pub fn default_session_continued_timeout_ms() -> u64 {
        2_000
    }

    pub fn default_session_terminated_timeout_ms() -> u64 {
        2_000
    }

    pub fn default_max_forking() -> usize {
        10
    }

    pub fn default_cas_retry_deadline_ms() -> u64 {
        2_000
    }

    pub fn default_auto_reg() -> bool {
        false
    }
}

impl<'de> Deserialize<'de> for NonRegisterAuthMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct Raw {
            if_proxy_authorization_present: bool,
            always: bool,
            initial: bool,
        }
        let raw = Raw::deserialize(deserializer)?;
        Ok(NonRegisterAuthMode {
            if_proxy_authorization_present: raw.if_proxy_authorization_present,
            always: raw.always,
            initial: raw.initial,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_resolves_all_defaults() {
        let config: NodeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.admin_port, 8080);
        assert_eq!(config.max_forking, 10);
    }

    #[test]
    fn nonce_ttl_covers_response_window_plus_max_expires() {
        let config = NodeConfig::for_tests();
        let ttl = config.nonce_ttl_seconds();
        assert!(ttl >= config.max_expires_seconds as u64);
    }
}
