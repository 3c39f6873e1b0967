//! Device configuration loaded from the environment.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::api::HttpDataApi;
use crate::queue::{AcknowledgingReplayer, HttpReplayer, Replayer};
use crate::store::StoreConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

/// How queued mutations reach the server during a drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplayMode {
    /// Confirm without a network call
    #[default]
    Stub,
    /// `PUT`/`DELETE` against the collection endpoints
    Http,
}

impl FromStr for ReplayMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stub" => Ok(ReplayMode::Stub),
            "http" => Ok(ReplayMode::Http),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Data API base, e.g. `http://127.0.0.1:5000`
    pub api_url: String,
    /// Live session base, e.g. `ws://127.0.0.1:5000`
    pub ws_url: String,
    pub store: StoreConfig,
    pub replay_mode: ReplayMode,
    pub ping_interval: Duration,
    pub http_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:5000".to_string(),
            ws_url: "ws://127.0.0.1:5000".to_string(),
            store: StoreConfig::default(),
            replay_mode: ReplayMode::default(),
            ping_interval: Duration::from_secs(25),
            http_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    /// Load `.env` if present, then read the environment
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_env()
    }

    /// Build from environment variables, falling back to defaults for unset ones
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("PACKSYNC_API_URL") {
            config.api_url = url;
        }
        if let Ok(url) = std::env::var("PACKSYNC_WS_URL") {
            config.ws_url = url;
        }
        if let Ok(path) = std::env::var("PACKSYNC_STORE_PATH") {
            config.store = StoreConfig::new(path);
        }
        if let Some(mode) = parse_var("PACKSYNC_REPLAY_MODE")? {
            config.replay_mode = mode;
        }
        if let Some(secs) = parse_var::<u64>("PACKSYNC_PING_INTERVAL_SECS")? {
            config.ping_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_var::<u64>("PACKSYNC_HTTP_TIMEOUT_SECS")? {
            config.http_timeout = Duration::from_secs(secs.max(1));
        }

        Ok(config)
    }

    /// The replayer selected by `replay_mode`
    pub fn replayer(&self, api: Arc<HttpDataApi>) -> Arc<dyn Replayer> {
        match self.replay_mode {
            ReplayMode::Stub => Arc::new(AcknowledgingReplayer),
            ReplayMode::Http => Arc::new(HttpReplayer::new(api)),
        }
    }
}

fn parse_var<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.replay_mode, ReplayMode::Stub);
        assert_eq!(config.ping_interval, Duration::from_secs(25));
        assert_eq!(config.ws_url, "ws://127.0.0.1:5000");
    }

    #[test]
    fn test_replay_mode_parsing() {
        assert_eq!("http".parse::<ReplayMode>(), Ok(ReplayMode::Http));
        assert_eq!("STUB".parse::<ReplayMode>(), Ok(ReplayMode::Stub));
        assert!("grpc".parse::<ReplayMode>().is_err());
    }

    #[test]
    fn test_invalid_replay_mode_is_reported() {
        std::env::set_var("PACKSYNC_TEST_REPLAY_MODE", "carrier-pigeon");
        let result = parse_var::<ReplayMode>("PACKSYNC_TEST_REPLAY_MODE");
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { var: "PACKSYNC_TEST_REPLAY_MODE", .. })
        ));
    }
}
