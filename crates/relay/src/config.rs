// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development.

use std::net::SocketAddr;
use std::time::Duration;

use crate::registry::PendingLimits;

const DEFAULT_PORT: u16 = 4444;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
const DEFAULT_MAX_PENDING_PER_TARGET: usize = 64;
const DEFAULT_MAX_PENDING_TARGETS: usize = 10_000;
const DEFAULT_PENDING_TTL_SECS: u64 = 300;
const DEFAULT_REGISTRATION_TIMEOUT_MS: u64 = 30_000;

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Interval between liveness sweeps (ping / evict).
    pub heartbeat_interval: Duration,
    /// Sockets that have not sent `register` by then are closed.
    pub registration_timeout: Duration,
    /// Bounds on buffered handshake messages for offline receivers.
    pub pending: PendingLimits,
    /// Send `requestUsername` after registering a client without a name.
    pub request_username: bool,
    /// Log filter directive (e.g. `info`, `coedit_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_env_fn(|_| Err(std::env::VarError::NotPresent))
    }
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `COEDIT_RELAY_HOST` | `0.0.0.0` |
    /// | `COEDIT_RELAY_PORT` | `4444` |
    /// | `COEDIT_RELAY_HEARTBEAT_INTERVAL_MS` | `30000` |
    /// | `COEDIT_RELAY_REGISTRATION_TIMEOUT_MS` | `30000` |
    /// | `COEDIT_RELAY_MAX_PENDING_PER_TARGET` | `64` |
    /// | `COEDIT_RELAY_MAX_PENDING_TARGETS` | `10000` |
    /// | `COEDIT_RELAY_PENDING_TTL_SECS` | `300` |
    /// | `COEDIT_RELAY_REQUEST_USERNAME` | `true` |
    /// | `COEDIT_RELAY_LOG_FILTER` | `info` |
    /// | `COEDIT_RELAY_LOG_FORMAT` | `text` (`json` for structured output) |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("COEDIT_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = parse_or(&env, "COEDIT_RELAY_PORT", DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let heartbeat_ms = parse_or(&env, "COEDIT_RELAY_HEARTBEAT_INTERVAL_MS", DEFAULT_HEARTBEAT_INTERVAL_MS)
            .max(1);
        let registration_ms = parse_or(
            &env,
            "COEDIT_RELAY_REGISTRATION_TIMEOUT_MS",
            DEFAULT_REGISTRATION_TIMEOUT_MS,
        )
        .max(1);

        let pending = PendingLimits {
            max_per_target: parse_or(
                &env,
                "COEDIT_RELAY_MAX_PENDING_PER_TARGET",
                DEFAULT_MAX_PENDING_PER_TARGET,
            )
            .max(1),
            max_targets: parse_or(&env, "COEDIT_RELAY_MAX_PENDING_TARGETS", DEFAULT_MAX_PENDING_TARGETS)
                .max(1),
            ttl: Duration::from_secs(parse_or(
                &env,
                "COEDIT_RELAY_PENDING_TTL_SECS",
                DEFAULT_PENDING_TTL_SECS,
            )
            .max(1)),
        };

        let request_username = env("COEDIT_RELAY_REQUEST_USERNAME")
            .ok()
            .map(|value| !matches!(value.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"))
            .unwrap_or(true);

        let log_filter = env("COEDIT_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("COEDIT_RELAY_LOG_FORMAT").ok().as_deref() {
            Some(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Self {
            listen_addr,
            heartbeat_interval: Duration::from_millis(heartbeat_ms),
            registration_timeout: Duration::from_millis(registration_ms),
            pending,
            request_username,
            log_filter,
            log_format,
        }
    }
}

fn parse_or<F, T>(env: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr,
{
    env(key).ok().and_then(|value| value.trim().parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key)
                .map(|v| v.to_string())
                .ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = RelayConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.port(), 4444);
        assert_eq!(cfg.listen_addr.ip().to_string(), "0.0.0.0");
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cfg.registration_timeout, Duration::from_secs(30));
        assert_eq!(cfg.pending.max_per_target, 64);
        assert_eq!(cfg.pending.max_targets, 10_000);
        assert_eq!(cfg.pending.ttl, Duration::from_secs(300));
        assert!(cfg.request_username);
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.log_format, LogFormat::Text);
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("COEDIT_RELAY_HOST", "127.0.0.1");
        m.insert("COEDIT_RELAY_PORT", "9090");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:9090");
    }

    #[test]
    fn invalid_port_uses_default() {
        let mut m = HashMap::new();
        m.insert("COEDIT_RELAY_PORT", "not_a_number");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 4444);
    }

    #[test]
    fn heartbeat_and_pending_overrides() {
        let mut m = HashMap::new();
        m.insert("COEDIT_RELAY_HEARTBEAT_INTERVAL_MS", "500");
        m.insert("COEDIT_RELAY_MAX_PENDING_PER_TARGET", "8");
        m.insert("COEDIT_RELAY_MAX_PENDING_TARGETS", "100");
        m.insert("COEDIT_RELAY_PENDING_TTL_SECS", "60");
        m.insert("COEDIT_RELAY_REGISTRATION_TIMEOUT_MS", "2500");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.heartbeat_interval, Duration::from_millis(500));
        assert_eq!(cfg.registration_timeout, Duration::from_millis(2500));
        assert_eq!(cfg.pending.max_per_target, 8);
        assert_eq!(cfg.pending.max_targets, 100);
        assert_eq!(cfg.pending.ttl, Duration::from_secs(60));
    }

    #[test]
    fn zero_bounds_are_raised_to_one() {
        let mut m = HashMap::new();
        m.insert("COEDIT_RELAY_MAX_PENDING_PER_TARGET", "0");
        m.insert("COEDIT_RELAY_HEARTBEAT_INTERVAL_MS", "0");
        m.insert("COEDIT_RELAY_PENDING_TTL_SECS", "0");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.pending.max_per_target, 1);
        assert_eq!(cfg.pending.ttl, Duration::from_secs(1));
        assert_eq!(cfg.heartbeat_interval, Duration::from_millis(1));
    }

    #[test]
    fn request_username_can_be_disabled() {
        let mut m = HashMap::new();
        m.insert("COEDIT_RELAY_REQUEST_USERNAME", "false");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert!(!cfg.request_username);
    }

    #[test]
    fn json_log_format() {
        let mut m = HashMap::new();
        m.insert("COEDIT_RELAY_LOG_FORMAT", "JSON");
        m.insert("COEDIT_RELAY_LOG_FILTER", "debug,tower_http=trace");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.log_filter, "debug,tower_http=trace");
    }
}
