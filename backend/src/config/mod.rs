//! Central module for application-wide configuration settings.
//!
//! Settings are read once at startup from a TOML file (path taken from
//! `NODESCOPE_CONFIG`, default `nodescope.toml`; a missing file means all
//! defaults), then a handful of environment variables override the connection
//! details, and finally the whole thing is validated. Nothing mutates the
//! settings afterwards.

use std::path::{Path, PathBuf};
use std::time::Duration;

use adapters::directory::{DEFAULT_SNAPSHOT_PATH, DirectoryOptions};
use adapters::LndConnection;
use serde::Deserialize;
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::services::data_aggregator::AggregationOptions;
use crate::services::health::HealthOptions;

pub const CONFIG_PATH_ENV: &str = "NODESCOPE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "nodescope.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    /// Local LND node; absent means no local node is configured.
    #[serde(default)]
    pub lnd: Option<LndSettings>,
    /// Identity of the local node. Learned from the node itself when unset.
    #[serde(default)]
    pub node_pubkey: Option<String>,
    #[serde(default)]
    pub directory: DirectorySettings,
    /// Network aggregator; absent means it is not configured.
    #[serde(default)]
    pub aggregator: Option<AggregatorSettings>,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub aggregation: AggregationSettings,
    #[serde(default)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LndSettings {
    /// `host:port` of LND's REST listener
    #[serde(default = "default_lnd_host")]
    pub host: String,
    #[serde(default = "default_tls_cert_path")]
    pub tls_cert_path: PathBuf,
    #[serde(default = "default_macaroon_path")]
    pub macaroon_path: PathBuf,
    #[serde(default = "default_lnd_timeout")]
    pub request_timeout_secs: u64,
}

fn default_lnd_host() -> String {
    "localhost:8080".to_string()
}
fn default_tls_cert_path() -> PathBuf {
    PathBuf::from("tls.cert")
}
fn default_macaroon_path() -> PathBuf {
    PathBuf::from("admin.macaroon")
}
fn default_lnd_timeout() -> u64 {
    30
}

impl Default for LndSettings {
    fn default() -> Self {
        Self {
            host: default_lnd_host(),
            tls_cert_path: default_tls_cert_path(),
            macaroon_path: default_macaroon_path(),
            request_timeout_secs: default_lnd_timeout(),
        }
    }
}

impl LndSettings {
    pub fn connection(&self) -> LndConnection {
        LndConnection {
            address: self.host.clone(),
            macaroon: self.macaroon_path.to_string_lossy().into_owned(),
            cert: self.tls_cert_path.to_string_lossy().into_owned(),
            request_timeout_secs: self.request_timeout_secs,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectorySettings {
    #[serde(default = "default_directory_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_graph_ttl")]
    pub graph_ttl_secs: u64,
    /// Durable graph snapshot; an empty string disables it.
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
    #[serde(default = "default_snapshot_max_age")]
    pub snapshot_max_age_secs: u64,
    #[serde(default = "default_remote_timeout")]
    pub timeout_secs: u64,
}

fn default_directory_url() -> String {
    "https://lnrouter.app/api/v1".to_string()
}
fn default_graph_ttl() -> u64 {
    6 * 60 * 60
}
fn default_snapshot_path() -> String {
    DEFAULT_SNAPSHOT_PATH.to_string()
}
fn default_snapshot_max_age() -> u64 {
    24 * 60 * 60
}
fn default_remote_timeout() -> u64 {
    60
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self {
            api_url: default_directory_url(),
            api_key: None,
            graph_ttl_secs: default_graph_ttl(),
            snapshot_path: default_snapshot_path(),
            snapshot_max_age_secs: default_snapshot_max_age(),
            timeout_secs: default_remote_timeout(),
        }
    }
}

impl DirectorySettings {
    pub fn options(&self) -> DirectoryOptions {
        DirectoryOptions {
            graph_ttl: Duration::from_secs(self.graph_ttl_secs),
            snapshot_path: (!self.snapshot_path.trim().is_empty()).then(|| PathBuf::from(&self.snapshot_path)),
            snapshot_max_age: Duration::from_secs(self.snapshot_max_age_secs),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorSettings {
    pub api_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_remote_timeout")]
    pub timeout_secs: u64,
}

impl AggregatorSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    /// Consecutive failures before a source is reported as `error`
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

fn default_health_interval() -> u64 {
    60
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_probe_timeout() -> u64 {
    10
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
            failure_threshold: default_failure_threshold(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

impl HealthSettings {
    pub fn options(&self) -> HealthOptions {
        HealthOptions {
            interval: Duration::from_secs(self.interval_secs),
            failure_threshold: self.failure_threshold,
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregationSettings {
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_forwarding_days")]
    pub forwarding_days: u32,
    #[serde(default = "default_max_forwarding_events")]
    pub max_forwarding_events: u32,
}

fn default_cache_ttl() -> u64 {
    60 * 60
}
fn default_forwarding_days() -> u32 {
    30
}
fn default_max_forwarding_events() -> u32 {
    1000
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl(),
            forwarding_days: default_forwarding_days(),
            max_forwarding_events: default_max_forwarding_events(),
        }
    }
}

impl AggregationSettings {
    pub fn options(&self) -> AggregationOptions {
        AggregationOptions {
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            forwarding_days: self.forwarding_days,
            max_forwarding_events: self.max_forwarding_events,
        }
    }
}

impl Settings {
    /// Loads settings from the file named by `NODESCOPE_CONFIG` (or the
    /// default path), applies environment overrides and validates the result.
    pub fn load() -> AppResult<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut settings = Self::from_file(Path::new(&path))?;
        settings.apply_overrides(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> AppResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content)
                .map_err(|err| AppError::Config(format!("{}: {}", path.display(), err))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("No configuration at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(err) => Err(AppError::Config(format!(
                "Cannot read {}: {}",
                path.display(),
                err
            ))),
        }
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        toml::from_str(content).map_err(|err| AppError::Config(err.to_string()))
    }

    /// Applies environment overrides through `lookup` so callers (and tests)
    /// control where values come from.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(host) = get("LND_REST_HOST") {
            self.lnd.get_or_insert_with(LndSettings::default).host = host;
        }
        if let Some(cert) = get("LND_TLS_CERT_PATH") {
            self.lnd.get_or_insert_with(LndSettings::default).tls_cert_path = PathBuf::from(cert);
        }
        if let Some(macaroon) = get("LND_MACAROON_PATH") {
            self.lnd.get_or_insert_with(LndSettings::default).macaroon_path = PathBuf::from(macaroon);
        }
        if let Some(pubkey) = get("NODE_PUBKEY") {
            self.node_pubkey = Some(pubkey);
        }
        if let Some(url) = get("DIRECTORY_API_URL") {
            self.directory.api_url = url;
        }
        if let Some(key) = get("DIRECTORY_API_KEY") {
            self.directory.api_key = Some(key);
        }
        if let Some(url) = get("AGGREGATOR_API_URL") {
            match &mut self.aggregator {
                Some(aggregator) => aggregator.api_url = url,
                None => {
                    self.aggregator = Some(AggregatorSettings {
                        api_url: url,
                        api_key: None,
                        timeout_secs: default_remote_timeout(),
                    })
                }
            }
        }
        if let (Some(key), Some(aggregator)) = (get("AGGREGATOR_API_KEY"), self.aggregator.as_mut()) {
            aggregator.api_key = Some(key);
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.health.failure_threshold == 0 {
            return Err(AppError::Config("health.failure_threshold must be at least 1".to_string()));
        }
        if self.health.interval_secs == 0 {
            return Err(AppError::Config("health.interval_secs must be positive".to_string()));
        }
        if self.health.probe_timeout_secs == 0 {
            return Err(AppError::Config("health.probe_timeout_secs must be positive".to_string()));
        }
        check_url("directory.api_url", &self.directory.api_url)?;
        if let Some(aggregator) = &self.aggregator {
            check_url("aggregator.api_url", &aggregator.api_url)?;
        }
        if let Some(lnd) = &self.lnd {
            if lnd.host.trim().is_empty() {
                return Err(AppError::Config("lnd.host must not be empty".to_string()));
            }
        }
        if let Some(pubkey) = &self.node_pubkey {
            adapters::utils::parse_node_id(pubkey)
                .map_err(|err| AppError::Config(format!("node_pubkey: {}", err)))?;
        }
        Ok(())
    }
}

fn check_url(field: &str, url: &str) -> AppResult<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(AppError::Config(format!("{} must be an http(s) URL, got {:?}", field, url)))
    }
}
