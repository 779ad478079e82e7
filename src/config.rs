#![forbid(unsafe_code)]

// Environment configuration. All knobs are read once at startup; a missing
// SERVER_SECRET is a hard error, a missing ADMIN_SECRET disables the admin
// path entirely (fails closed).

use anyhow::{bail, Context, Result};
use std::net::IpAddr;
use std::time::Duration;

/// Server configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Shared secret every client must present. Mandatory.
    pub server_secret: String,
    /// Admin key. `None` means adminAuthenticate always fails.
    pub admin_secret: Option<String>,
    pub media_listen_ip: IpAddr,
    /// Public IP announced in ICE candidates.
    pub media_announced_ip: Option<IpAddr>,
    pub media_port_min: u16,
    pub media_port_max: u16,
    pub signaling_port: u16,
    pub log_level: LogLevel,
    /// Per-request handler deadline.
    pub request_timeout: Duration,
    /// ICE/DTLS establishment watchdog per transport.
    pub ice_timeout: Duration,
    /// Active-speaker detection threshold in dBFS.
    pub speaking_threshold: i8,
    /// Active-speaker observer sampling interval.
    pub speaking_interval: Duration,
    /// Hold-off before a quiet producer is reported as stopped speaking.
    pub speaking_hold_off: Duration,
    pub max_connections: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            other => bail!("invalid LOG_LEVEL: {other} (expected error|warn|info|debug)"),
        }
    }

    /// Default directive for the tracing EnvFilter.
    pub fn filter_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "partyline=error,mediasoup=error",
            LogLevel::Warn => "partyline=warn,mediasoup=warn",
            LogLevel::Info => "partyline=info,mediasoup=warn",
            LogLevel::Debug => "partyline=debug,mediasoup=info",
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid {name}: {raw}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Loads configuration from the environment.
    ///
    /// # Errors
    /// Returns an error if SERVER_SECRET is absent or any value fails to parse.
    pub fn from_env() -> Result<Self> {
        let server_secret =
            std::env::var("SERVER_SECRET").context("SERVER_SECRET must be set")?;
        if server_secret.is_empty() {
            bail!("SERVER_SECRET must not be empty");
        }

        let admin_secret = std::env::var("ADMIN_SECRET").ok().filter(|s| !s.is_empty());

        let media_listen_ip: IpAddr = env_parse("MEDIA_LISTEN_IP", "0.0.0.0".parse().unwrap())?;
        let media_announced_ip = match std::env::var("MEDIA_ANNOUNCED_IP") {
            Ok(raw) => Some(
                raw.parse()
                    .map_err(|_| anyhow::anyhow!("invalid MEDIA_ANNOUNCED_IP: {raw}"))?,
            ),
            Err(_) => None,
        };

        let media_port_min: u16 = env_parse("MEDIA_PORT_MIN", 10_000)?;
        let media_port_max: u16 = env_parse("MEDIA_PORT_MAX", 59_999)?;
        if media_port_min >= media_port_max {
            bail!("MEDIA_PORT_MIN ({media_port_min}) must be below MEDIA_PORT_MAX ({media_port_max})");
        }

        let log_level = match std::env::var("LOG_LEVEL") {
            Ok(raw) => LogLevel::parse(&raw)?,
            Err(_) => LogLevel::Info,
        };

        Ok(Self {
            server_secret,
            admin_secret,
            media_listen_ip,
            media_announced_ip,
            media_port_min,
            media_port_max,
            signaling_port: env_parse("SIGNALING_PORT", 5000)?,
            log_level,
            request_timeout: Duration::from_secs(10),
            ice_timeout: Duration::from_secs(env_parse("ICE_TIMEOUT_SECS", 20u64)?),
            speaking_threshold: env_parse("SPEAKING_THRESHOLD_DB", -70)?,
            speaking_interval: Duration::from_millis(env_parse("SPEAKING_INTERVAL_MS", 800u64)?),
            speaking_hold_off: Duration::from_millis(env_parse("SPEAKING_HOLD_OFF_MS", 800u64)?),
            max_connections: env_parse("MAX_CONNECTIONS", 10_000)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_parses_known_values() {
        assert_eq!(LogLevel::parse("debug").unwrap(), LogLevel::Debug);
        assert_eq!(LogLevel::parse("error").unwrap(), LogLevel::Error);
        assert!(LogLevel::parse("trace").is_err());
    }

    #[test]
    fn filter_directive_scopes_to_crate() {
        assert!(LogLevel::Info.filter_directive().starts_with("partyline=info"));
    }
}
