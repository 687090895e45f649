use serde::Deserialize;

/// Server configuration, loaded from a TOML file.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// IP address to bind on (default "0.0.0.0").
    #[serde(default = "default_host")]
    pub host: String,

    /// UDP port for the relay.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds of silence before a peer is reaped.
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout_secs: u64,

    /// Seconds a verified funk key stays cached.
    #[serde(default = "default_auth_cache_ttl")]
    pub auth_cache_ttl_secs: u64,

    /// Path to the users file.
    #[serde(default = "default_users_path")]
    pub users_path: String,

    /// Path to the connection log.
    #[serde(default = "default_log_path")]
    pub connection_log_path: String,

    /// Path to the traffic log.
    #[serde(default = "default_traffic_path")]
    pub traffic_log_path: String,
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    50_000
}

fn default_stale_timeout() -> u64 {
    30
}

fn default_auth_cache_ttl() -> u64 {
    5
}

fn default_users_path() -> String {
    "funk_users.json".into()
}

fn default_log_path() -> String {
    "funk_connections.jsonl".into()
}

fn default_traffic_path() -> String {
    "funk_traffic.jsonl".into()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            stale_timeout_secs: default_stale_timeout(),
            auth_cache_ttl_secs: default_auth_cache_ttl(),
            users_path: default_users_path(),
            connection_log_path: default_log_path(),
            traffic_log_path: default_traffic_path(),
        }
    }
}
