//! Konfiguration aus Umgebungsvariablen

use std::time::Duration;
use thiserror::Error;
use url::{Host, Url};

use crate::media::AudioConstraints;
use crate::signaling::SignalingConfig;

pub const DEFAULT_BROKER_URL: &str = "ws://127.0.0.1:9000/broker";

pub const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_HEARTBEAT_SECS: u64 = 25;

const ENV_BROKER_URL: &str = "INTERCOM_BROKER_URL";
const ENV_ICE_SERVERS: &str = "INTERCOM_ICE_SERVERS";
const ENV_REQUEST_TIMEOUT: &str = "INTERCOM_REQUEST_TIMEOUT_SECS";
const ENV_HEARTBEAT: &str = "INTERCOM_HEARTBEAT_SECS";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid broker URL {0:?}: {1}")]
    InvalidUrl(String, String),

    #[error("Invalid value for {0}: {1:?}")]
    InvalidValue(&'static str, String),
}

#[derive(Debug, Clone)]
pub struct IntercomConfig {
    pub broker_url: Url,
    pub ice_servers: Vec<String>,
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub audio: AudioConstraints,
}

impl IntercomConfig {
    /// Liest die Konfiguration aus der Prozessumgebung
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Wie `from_env`, mit beliebiger Quelle für die Werte
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let broker_url = get(ENV_BROKER_URL);
        let broker_url = broker_url.as_deref().unwrap_or(DEFAULT_BROKER_URL);
        let mut config = Self {
            broker_url: parse_broker_url(broker_url.trim())?,
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            audio: AudioConstraints::voice(),
        };

        if let Some(raw) = get(ENV_ICE_SERVERS) {
            let servers: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if servers.is_empty() {
                return Err(ConfigError::InvalidValue(ENV_ICE_SERVERS, raw));
            }
            config.ice_servers = servers;
        }

        if let Some(raw) = get(ENV_REQUEST_TIMEOUT) {
            config.request_timeout = parse_secs(ENV_REQUEST_TIMEOUT, raw)?;
        }
        if let Some(raw) = get(ENV_HEARTBEAT) {
            config.heartbeat_interval = parse_secs(ENV_HEARTBEAT, raw)?;
        }

        if is_plaintext_remote(&config.broker_url) {
            tracing::warn!(
                "Broker {} is reached without TLS, use wss:// outside of local setups",
                config.broker_url
            );
        }

        tracing::debug!(
            "Config: broker={}, {} ICE server(s)",
            config.broker_url,
            config.ice_servers.len()
        );
        Ok(config)
    }

    /// Einstellungen für den Broker-Client
    pub fn signaling(&self) -> SignalingConfig {
        SignalingConfig {
            url: self.broker_url.clone(),
            ice_servers: self.ice_servers.clone(),
            request_timeout: self.request_timeout,
            heartbeat_interval: self.heartbeat_interval,
        }
    }
}

fn parse_broker_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl(raw.to_string(), e.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ConfigError::InvalidUrl(
            raw.to_string(),
            format!("unsupported scheme {}", other),
        )),
    }
}

/// Unverschlüsseltes `ws` zu einem Host außerhalb dieser Maschine
fn is_plaintext_remote(url: &Url) -> bool {
    if url.scheme() != "ws" {
        return false;
    }
    match url.host() {
        Some(Host::Domain(domain)) => !domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => !ip.is_loopback(),
        Some(Host::Ipv6(ip)) => !ip.is_loopback(),
        None => true,
    }
}

fn parse_secs(key: &'static str, raw: String) -> Result<Duration, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::InvalidValue(key, raw)),
    }
}
