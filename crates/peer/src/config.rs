// Local configuration for a collaborating peer.
//
// File: `~/.coedit/peer.toml` (or an explicit path).

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::relay_client::{ReconnectPolicy, RelayIdentity};
use crate::sync::DebounceConfig;

/// Root directory for coedit client state: `~/.coedit/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".coedit"))
}

/// Path to the peer config file: `~/.coedit/peer.toml`.
pub fn peer_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("peer.toml"))
}

/// Peer configuration at `~/.coedit/peer.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PeerConfig {
    /// Signaling relay endpoint (e.g. `wss://relay.example.com/ws`).
    pub relay_url: String,
    /// Stable identifier to register with. The relay assigns one if unset.
    pub client_id: Option<String>,
    /// Display name others can address this peer by.
    pub display_name: Option<String>,
    /// Fixed delay between relay reconnection attempts.
    pub reconnect_interval_ms: u64,
    /// Give up after this many consecutive failures (unset = retry forever).
    pub max_reconnect_attempts: Option<u32>,
    /// Time allowed for a direct channel to open before restarting negotiation.
    pub negotiation_timeout_ms: u64,
    /// Quiet period before local updates are flushed to the peer.
    pub debounce_ms: u64,
    /// Upper bound on how long a burst of updates may be held back.
    pub debounce_max_wait_ms: u64,
    /// Name of the shared text type in the document.
    pub text_name: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:4444/ws".into(),
            client_id: None,
            display_name: None,
            reconnect_interval_ms: 5_000,
            max_reconnect_attempts: None,
            negotiation_timeout_ms: 15_000,
            debounce_ms: 50,
            debounce_max_wait_ms: 500,
            text_name: "shared".into(),
        }
    }
}

impl PeerConfig {
    /// Load from `~/.coedit/peer.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        peer_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    /// Load from a specific path and validate it.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        let config: Self = toml::from_str(&contents).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_relay_url(&self.relay_url)
    }

    pub fn identity(&self) -> RelayIdentity {
        RelayIdentity { client_id: self.client_id.clone(), display_name: self.display_name.clone() }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            interval: Duration::from_millis(self.reconnect_interval_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms.max(1))
    }

    pub fn debounce(&self) -> DebounceConfig {
        DebounceConfig::with_millis(self.debounce_ms, self.debounce_max_wait_ms)
    }
}

/// Relay URLs must be `wss`, except `ws` against a loopback host.
pub fn validate_relay_url(value: &str) -> Result<(), ConfigError> {
    let parsed = Url::parse(value)
        .map_err(|error| ConfigError::InvalidRelayUrl(format!("`{value}`: {error}")))?;
    match parsed.scheme() {
        "wss" => Ok(()),
        "ws" if is_loopback_host(parsed.host_str()) => Ok(()),
        _ => Err(ConfigError::InvalidRelayUrl(
            "relay_url must use wss (ws is allowed only for localhost testing)".into(),
        )),
    }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.parse::<IpAddr>().is_ok_and(|addr| addr.is_loopback())
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
    InvalidRelayUrl(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
            Self::Serialize(e) => write!(f, "config serialize error: {e}"),
            Self::InvalidRelayUrl(reason) => write!(f, "invalid relay_url {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}
