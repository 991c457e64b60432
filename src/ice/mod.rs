//! Relay-server (STUN/TURN) resolution
//!
//! Admission responses carry a list of ICE-style relay servers for the media
//! transport. The list comes from the first source in this chain that yields
//! a non-empty validated result: ephemeral credentials fetched from a
//! configured endpoint (cached), a static JSON list from the environment,
//! or the built-in STUN default. Resolution never fails admission.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::Config;

/// Fallback STUN entry when no other source yields servers
pub const DEFAULT_STUN_URL: &str = "stun:stun.cloudflare.com:3478";

/// TTL requested for ephemeral relay credentials
const CREDENTIAL_REQUEST_TTL_SECS: u64 = 86_400;

/// Bounds applied to the credential cache lifetime
const CACHE_TTL_MIN: Duration = Duration::from_secs(5);
const CACHE_TTL_MAX: Duration = Duration::from_secs(3_600);
const CACHE_TTL_FALLBACK: Duration = Duration::from_secs(60);

/// `urls` may be a single string or an array of strings on the wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum IceUrls {
    Single(String),
    Many(Vec<String>),
}

impl IceUrls {
    fn is_valid(&self) -> bool {
        match self {
            IceUrls::Single(url) => !url.is_empty(),
            IceUrls::Many(urls) => !urls.is_empty() && urls.iter().all(|u| !u.is_empty()),
        }
    }
}

/// One relay-server entry handed to the media transport
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IceServer {
    pub urls: IceUrls,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun_default() -> Self {
        Self {
            urls: IceUrls::Single(DEFAULT_STUN_URL.to_string()),
            username: None,
            credential: None,
        }
    }
}

/// Parse and filter relay-server entries from untyped JSON. Accepts a single
/// object or an array; entries without usable `urls` are dropped.
pub fn validate_servers(raw: &serde_json::Value) -> Vec<IceServer> {
    let entries: Vec<&serde_json::Value> = match raw {
        serde_json::Value::Array(items) => items.iter().collect(),
        serde_json::Value::Object(_) => vec![raw],
        _ => Vec::new(),
    };

    entries
        .into_iter()
        .filter_map(|entry| serde_json::from_value::<IceServer>(entry.clone()).ok())
        .filter(|server| server.urls.is_valid())
        .collect()
}

/// Credential endpoint configuration, resolved once at startup
struct TurnApi {
    url: String,
    api_token: String,
    configured_ttl: Option<u64>,
}

struct CachedServers {
    servers: Vec<IceServer>,
    expires_at: Instant,
}

/// Response shape of the credential endpoint
#[derive(Deserialize)]
struct TurnCredentialsResponse {
    #[serde(rename = "iceServers")]
    ice_servers: serde_json::Value,
    #[serde(default)]
    ttl: Option<u64>,
}

/// Process-wide relay-server resolver with a single-inflight credential cache
pub struct IceServerResolver {
    client: Client,
    turn: Option<TurnApi>,
    static_servers: Vec<IceServer>,
    cache: Mutex<Option<CachedServers>>,
}

impl IceServerResolver {
    pub fn new(config: &Config) -> Arc<Self> {
        let turn = match (&config.turn_token_id, &config.turn_api_token) {
            (Some(token_id), Some(api_token)) => Some(TurnApi {
                url: config.turn_api_url.clone().unwrap_or_else(|| {
                    format!(
                        "https://rtc.live.cloudflare.com/v1/turn/keys/{}/credentials/generate",
                        token_id
                    )
                }),
                api_token: api_token.clone(),
                configured_ttl: config.turn_cache_ttl_seconds,
            }),
            _ => None,
        };

        let static_servers = config
            .ice_servers_json
            .as_deref()
            .map(parse_static_list)
            .unwrap_or_default();

        Arc::new(Self {
            client: Client::new(),
            turn,
            static_servers,
            cache: Mutex::new(None),
        })
    }

    /// Resolve the current relay-server list. Falls through the source chain
    /// and always returns at least the STUN default.
    pub async fn resolve(&self) -> Vec<IceServer> {
        if let Some(turn) = &self.turn {
            // The lock is held across the refresh so concurrent admissions
            // wait for one fetch instead of stampeding the endpoint.
            let mut cache = self.cache.lock().await;

            if let Some(cached) = cache.as_ref() {
                if cached.expires_at > Instant::now() {
                    return cached.servers.clone();
                }
            }

            match self.fetch_credentials(turn).await {
                Ok((servers, ttl)) if !servers.is_empty() => {
                    debug!(count = servers.len(), ttl_secs = ttl.as_secs(), "Cached relay credentials");
                    *cache = Some(CachedServers {
                        servers: servers.clone(),
                        expires_at: Instant::now() + ttl,
                    });
                    return servers;
                }
                Ok(_) => warn!("Credential endpoint returned no usable relay servers"),
                Err(e) => warn!(error = %e, "Relay credential fetch failed"),
            }
        }

        if !self.static_servers.is_empty() {
            return self.static_servers.clone();
        }

        vec![IceServer::stun_default()]
    }

    async fn fetch_credentials(&self, turn: &TurnApi) -> Result<(Vec<IceServer>, Duration), IceError> {
        let response = self
            .client
            .post(&turn.url)
            .bearer_auth(&turn.api_token)
            .json(&serde_json::json!({ "ttl": CREDENTIAL_REQUEST_TTL_SECS }))
            .send()
            .await
            .map_err(IceError::Request)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(IceError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let credentials: TurnCredentialsResponse =
            response.json().await.map_err(IceError::Parse)?;

        let servers = validate_servers(&credentials.ice_servers);
        let ttl = cache_ttl(credentials.ttl, turn.configured_ttl);
        Ok((servers, ttl))
    }
}

/// The endpoint's returned TTL wins, then the configured fallback, then the
/// built-in one; the result is always clamped to the cache bounds.
fn cache_ttl(returned: Option<u64>, configured: Option<u64>) -> Duration {
    let ttl = returned
        .or(configured)
        .map(Duration::from_secs)
        .unwrap_or(CACHE_TTL_FALLBACK);
    ttl.clamp(CACHE_TTL_MIN, CACHE_TTL_MAX)
}

fn parse_static_list(json: &str) -> Vec<IceServer> {
    match serde_json::from_str::<serde_json::Value>(json) {
        Ok(value) => {
            let servers = validate_servers(&value);
            if servers.is_empty() {
                warn!("ICE_SERVERS_JSON contained no usable entries");
            }
            servers
        }
        Err(e) => {
            warn!(error = %e, "ICE_SERVERS_JSON is not valid JSON");
            Vec::new()
        }
    }
}

/// Relay-credential errors
#[derive(Debug, thiserror::Error)]
pub enum IceError {
    #[error("HTTP request failed: {0}")]
    Request(reqwest::Error),

    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Failed to parse response: {0}")]
    Parse(reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_filters_bad_entries() {
        let raw = serde_json::json!([
            { "urls": "stun:stun.example.com:3478" },
            { "urls": ["turn:turn.example.com:3478?transport=udp", "turn:turn.example.com:3478?transport=tcp"],
              "username": "u", "credential": "c" },
            { "urls": "" },
            { "urls": [] },
            { "urls": 42 },
            { "username": "orphan" },
            "not-an-object"
        ]);
        let servers = validate_servers(&raw);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, IceUrls::Single("stun:stun.example.com:3478".to_string()));
        assert_eq!(servers[1].username.as_deref(), Some("u"));
    }

    #[test]
    fn validation_accepts_single_object() {
        let raw = serde_json::json!({ "urls": ["turn:t.example.com:3478"], "username": "u", "credential": "c" });
        assert_eq!(validate_servers(&raw).len(), 1);
    }

    #[test]
    fn ttl_prefers_endpoint_then_config_then_fallback() {
        assert_eq!(cache_ttl(Some(600), Some(120)), Duration::from_secs(600));
        assert_eq!(cache_ttl(None, Some(120)), Duration::from_secs(120));
        assert_eq!(cache_ttl(None, None), CACHE_TTL_FALLBACK);
    }

    #[test]
    fn ttl_is_clamped_to_bounds() {
        assert_eq!(cache_ttl(Some(1), None), CACHE_TTL_MIN);
        assert_eq!(cache_ttl(Some(86_400), None), CACHE_TTL_MAX);
    }

    #[tokio::test]
    async fn static_list_is_served_without_turn_config() {
        let config = Config {
            ice_servers_json: Some(
                r#"[{"urls":"stun:stun.example.com:3478"},{"urls":""}]"#.to_string(),
            ),
            ..Config::default()
        };
        let resolver = IceServerResolver::new(&config);
        let servers = resolver.resolve().await;
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, IceUrls::Single("stun:stun.example.com:3478".to_string()));
    }

    #[tokio::test]
    async fn empty_environment_falls_back_to_stun_default() {
        let resolver = IceServerResolver::new(&Config::default());
        let servers = resolver.resolve().await;
        assert_eq!(servers, vec![IceServer::stun_default()]);
    }

    #[tokio::test]
    async fn unparseable_static_list_falls_back_to_stun_default() {
        let config = Config {
            ice_servers_json: Some("{not json".to_string()),
            ..Config::default()
        };
        let resolver = IceServerResolver::new(&config);
        assert_eq!(resolver.resolve().await, vec![IceServer::stun_default()]);
    }
}
