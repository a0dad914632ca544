//! Configuration management for the server.

use std::env;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Bearer token devices must present; open access when unset
    pub auth_token: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let auth_token = match env::var("AUTH_TOKEN") {
            Ok(token) if token.trim().is_empty() => return Err(ConfigError::EmptyAuthToken),
            Ok(token) => Some(token),
            Err(_) => None,
        };

        Ok(Self {
            host,
            port,
            auth_token,
        })
    }

    /// Configuration for tests and embedding: loopback, any free port.
    pub fn local(auth_token: Option<String>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            auth_token,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("AUTH_TOKEN is set but empty")]
    EmptyAuthToken,
}
