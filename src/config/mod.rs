//! Configuration module - environment variable parsing

pub mod flags;

pub use flags::FeatureFlags;

use std::env;
use std::net::SocketAddr;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Advertise the SFU transport mode at admission
    pub sfu_enabled: bool,

    /// Static relay-server list, JSON-encoded
    pub ice_servers_json: Option<String>,

    /// Credential endpoint key id for ephemeral relay credentials
    pub turn_token_id: Option<String>,
    /// Bearer token for the credential endpoint
    pub turn_api_token: Option<String>,
    /// Credential endpoint override; derived from the key id when unset
    pub turn_api_url: Option<String>,
    /// Cache TTL fallback when the endpoint response carries none
    pub turn_cache_ttl_seconds: Option<u64>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Hosting platforms provide PORT; fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),

            sfu_enabled: env::var("FEATURE_SFU_ENABLED")
                .map(|v| flags::parse_bool(&v))
                .unwrap_or(false),

            ice_servers_json: env::var("ICE_SERVERS_JSON").ok(),

            turn_token_id: env::var("TURN_TOKEN_ID").ok(),
            turn_api_token: env::var("TURN_API_TOKEN").ok(),
            turn_api_url: env::var("TURN_API_URL").ok(),
            turn_cache_ttl_seconds: env::var("TURN_CACHE_TTL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok()),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_level: "info".to_string(),
            sfu_enabled: false,
            ice_servers_json: None,
            turn_token_id: None,
            turn_api_token: None,
            turn_api_url: None,
            turn_cache_ttl_seconds: None,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}
