//! Relay configuration, loaded from environment variables.
//!
//! The JWT secret is mandatory: the relay must verify tokens with the same
//! secret the auth service signs them with, so starting without one would
//! accept nobody (or worse, a fallback everybody knows). Everything else has
//! the defaults clients were built against.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("JWT_SECRET_KEY is not set; it must match the auth service's signing secret")]
    MissingJwtSecret,
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub jwt_secret: String,
    pub host: String,
    pub port: u16,
    /// Upper bound on bytes pulled from a socket per read.
    pub buffer_size: usize,
    /// Upper bound on one control frame, in bytes.
    pub max_message_size: usize,
    pub file_transfer_timeout: Duration,
    pub db_api_url: String,
    pub db_api_timeout: Duration,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; `from_env` wires in the process
    /// environment, tests pass a map.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let jwt_secret = lookup("JWT_SECRET_KEY")
            .filter(|secret| !secret.trim().is_empty())
            .ok_or(ConfigError::MissingJwtSecret)?;
        Ok(Self {
            jwt_secret,
            host: lookup("CHAT_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse(&lookup, "CHAT_PORT", 5050)?,
            buffer_size: parse(&lookup, "BUFFER_SIZE", 4096)?,
            max_message_size: parse(&lookup, "MAX_MESSAGE_SIZE", 10240)?,
            file_transfer_timeout: Duration::from_secs(parse(&lookup, "FILE_TRANSFER_TIMEOUT", 300)?),
            db_api_url: lookup("DB_API_URL").unwrap_or_else(|| "http://localhost:5001/api".into()),
            db_api_timeout: Duration::from_secs(parse(&lookup, "DB_API_TIMEOUT", 5)?),
        })
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
    }
}
