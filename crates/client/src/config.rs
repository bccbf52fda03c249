// Client configuration.
//
// Global config: `~/.workshop-sync/config.toml`. Every key has a default, so a
// missing or partial file still yields a working client.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::store::{ensure_owner_only_dir, ensure_owner_only_file};

/// Root directory for client state: `~/.workshop-sync/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".workshop-sync"))
}

/// Path to the global config file: `~/.workshop-sync/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// REST base URL (e.g. `https://workshop.example.com`).
    pub server_url: String,
    /// Path of the push-channel endpoint, relative to `server_url`.
    pub ws_path: String,
    pub http: HttpConfig,
    pub channel: ChannelConfig,
    pub auth: AuthConfig,
    pub presence: PresenceConfig,
    pub records: RecordsConfig,
    pub polling: PollingConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            ws_path: "/ws".into(),
            http: HttpConfig::default(),
            channel: ChannelConfig::default(),
            auth: AuthConfig::default(),
            presence: PresenceConfig::default(),
            records: RecordsConfig::default(),
            polling: PollingConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Load from `~/.workshop-sync/config.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
            ensure_owner_only_dir(parent)
                .map_err(|error| ConfigError::Io(std::io::Error::other(error.to_string())))?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io).and_then(|_| {
            ensure_owner_only_file(path)
                .map_err(|error| ConfigError::Io(std::io::Error::other(error.to_string())))
        })
    }

    /// Validated REST base URL.
    pub fn api_base(&self) -> Result<Url, ConfigError> {
        let parsed = Url::parse(&self.server_url).map_err(|error| {
            ConfigError::Invalid(format!("invalid server_url `{}`: {error}", self.server_url))
        })?;
        match parsed.scheme() {
            "https" => Ok(parsed),
            "http" if is_loopback_host(parsed.host_str()) => Ok(parsed),
            _ => Err(ConfigError::Invalid(
                "server_url must use https (http is allowed only for localhost testing)".into(),
            )),
        }
    }

    /// Push-channel URL derived from `server_url` and `ws_path`.
    pub fn ws_url(&self) -> Result<Url, ConfigError> {
        let mut url = self.api_base()?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| ConfigError::Invalid(format!("cannot derive {scheme} url")))?;
        url.set_path(&self.ws_path);
        Ok(url)
    }
}

/// REST client tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    /// Whole-request deadline, connect through body.
    pub request_timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { request_timeout_ms: 15_000 }
    }
}

impl HttpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }
}

/// Push-channel liveness and reconnection tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
    pub heartbeat_interval_ms: u64,
    /// Consecutive unanswered pings before the channel is force-reopened.
    pub missed_heartbeat_limit: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 25_000,
            missed_heartbeat_limit: 3,
            reconnect_base_delay_ms: 250,
            reconnect_max_delay_ms: 30_000,
        }
    }
}

impl ChannelConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

/// Credential refresh scheduling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// Refresh this long before the access token expires.
    pub refresh_headroom_sec: u64,
    /// Never arm the refresh timer for less than this.
    pub min_refresh_delay_sec: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { refresh_headroom_sec: 120, min_refresh_delay_sec: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PresenceConfig {
    pub pull_interval_sec: u64,
    pub typing_ttl_ms: u64,
    pub typing_sweep_ms: u64,
    pub read_receipt_limit: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            pull_interval_sec: 20,
            typing_ttl_ms: 4_000,
            typing_sweep_ms: 1_000,
            read_receipt_limit: 100,
        }
    }
}

impl PresenceConfig {
    pub fn pull_interval(&self) -> Duration {
        Duration::from_secs(self.pull_interval_sec.max(1))
    }

    /// A session seen within this window counts as online.
    pub fn freshness_window(&self) -> Duration {
        self.pull_interval() * 2
    }

    pub fn typing_ttl(&self) -> Duration {
        Duration::from_millis(self.typing_ttl_ms)
    }

    pub fn typing_sweep(&self) -> Duration {
        Duration::from_millis(self.typing_sweep_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecordsConfig {
    /// Pending-edit locks older than this are ignored by the merge.
    pub lock_ttl_ms: u64,
}

impl Default for RecordsConfig {
    fn default() -> Self {
        Self { lock_ttl_ms: 8_000 }
    }
}

impl RecordsConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }
}

/// Fallback polling cadence per view while the push channel is down.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollingConfig {
    pub orders_sec: u64,
    pub tasks_sec: u64,
    pub chat_sec: u64,
    pub presence_sec: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self { orders_sec: 15, tasks_sec: 10, chat_sec: 4, presence_sec: 20 }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
            Self::Serialize(e) => write!(f, "config serialize error: {e}"),
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().is_ok_and(|addr| addr.is_loopback())
}
