use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Engine configuration. The four fields named in the wire/storage contract
/// (`own_url`, `peer_urls`, `jwt_secret`, `node_id`) are required; everything
/// else is an ambient runtime knob with a production-sane default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub own_url: String,
    pub peer_urls: Vec<String>,
    pub jwt_secret: String,
    pub node_id: u64,

    pub server: ServerConfig,
    pub timing: TimingConfig,
    pub storage_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Interval/timeout knobs, all spec-mandated defaults (§4.1-§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    pub event_queue_depth: usize,
    pub gossip_interval: Duration,
    pub heartbeat_interval: Duration,
    pub peer_dead_after: Duration,
    pub persist_interval: Duration,
    pub dependency_sweep_interval: Duration,
    pub update_request_timeout: Duration,
    pub reconnect_initial_backoff: Duration,
    pub reconnect_max_backoff: Duration,
    pub reconnect_jitter: f64,
    pub storage_call_timeout: Duration,
    pub default_max_results: i32,
    pub dependency_buffer_warn_threshold: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            event_queue_depth: 1024,
            gossip_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            peer_dead_after: Duration::from_secs(45),
            persist_interval: Duration::from_secs(5),
            dependency_sweep_interval: Duration::from_secs(10),
            update_request_timeout: Duration::from_secs(30),
            reconnect_initial_backoff: Duration::from_secs(5),
            reconnect_max_backoff: Duration::from_secs(60),
            reconnect_jitter: 0.10,
            storage_call_timeout: Duration::from_secs(5),
            default_max_results: 100,
            dependency_buffer_warn_threshold: 10_000,
        }
    }
}

impl Config {
    pub fn from_env() -> AppResult<Self> {
        let own_url = env::var("OWN_URL")
            .map_err(|_| AppError::Configuration("OWN_URL is required".to_string()))?;
        let jwt_secret = env::var("JWT_SECRET")
            .map_err(|_| AppError::Configuration("JWT_SECRET is required".to_string()))?;
        let node_id: u64 = env::var("NODE_ID")
            .map_err(|_| AppError::Configuration("NODE_ID is required".to_string()))?
            .parse()
            .map_err(|_| AppError::Configuration("NODE_ID must be a u64".to_string()))?;
        let peer_urls: Vec<String> = env::var("PEER_URLS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            own_url,
            peer_urls,
            jwt_secret,
            node_id,
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("SERVER_PORT")
                    .unwrap_or_else(|_| "7420".to_string())
                    .parse()
                    .unwrap_or(7420),
            },
            timing: TimingConfig::default(),
            storage_path: env::var("STORAGE_PATH").unwrap_or_else(|_| "driftsync.db".to_string()),
        })
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn storage_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.storage_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_requires_own_url() {
        // SAFETY: single-threaded test process; no concurrent env mutation.
        unsafe {
            env::remove_var("OWN_URL");
            env::remove_var("JWT_SECRET");
            env::remove_var("NODE_ID");
        }
        assert!(matches!(Config::from_env(), Err(AppError::Configuration(_))));
    }
}
