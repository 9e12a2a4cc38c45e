use std::env;

use crate::engine::IceServer;

const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8080/ws";
const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Lagoon client configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Relay endpoint (ws, wss, http or https)
    pub relay_url: String,
    /// STUN/TURN servers handed to every peer connection
    pub ice_servers: Vec<IceServer>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let relay_url =
            env::var("LAGOON_RELAY_URL").unwrap_or_else(|_| DEFAULT_RELAY_URL.to_string());
        // Normalize localhost to IPv4 to avoid IPv6 (::1) preference on macOS
        let relay_url = relay_url.replacen("://localhost", "://127.0.0.1", 1);

        let ice_servers = if env::var("LAGOON_LOCALHOST_ONLY").is_ok() {
            vec![]
        } else {
            match env::var("LAGOON_ICE_SERVERS") {
                Ok(urls) => parse_ice_servers(&urls),
                Err(_) => default_ice_servers(),
            }
        };

        Self {
            relay_url,
            ice_servers,
        }
    }

    pub fn with_relay_url(mut self, relay_url: impl Into<String>) -> Self {
        self.relay_url = relay_url.into();
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            ice_servers: default_ice_servers(),
        }
    }
}

fn default_ice_servers() -> Vec<IceServer> {
    DEFAULT_ICE_SERVERS.iter().copied().map(IceServer::new).collect()
}

fn parse_ice_servers(urls: &str) -> Vec<IceServer> {
    urls.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(IceServer::new)
        .collect()
}
