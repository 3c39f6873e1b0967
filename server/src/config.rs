//! Server configuration loaded from the environment.

use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::broadcast::RegistryConfig;
use crate::routes::DistanceServiceConfig;
use crate::storage::StorageConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

/// Everything the server binary needs to start
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub storage: StorageConfig,
    pub distance: DistanceServiceConfig,
    pub registry: RegistryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            storage: StorageConfig::default(),
            distance: DistanceServiceConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Build from environment variables, falling back to defaults for unset ones
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(port) = parse_var("PORT")? {
            config.port = port;
        }
        if let Ok(path) = std::env::var("STORAGE_PATH") {
            config.storage = StorageConfig::new(path);
        }
        if let Ok(key) = std::env::var("DISTANCE_API_KEY") {
            config.distance = config.distance.with_api_key(key);
        }
        if let Ok(url) = std::env::var("DISTANCE_API_URL") {
            config.distance = config.distance.with_base_url(url);
        }
        if let Some(secs) = parse_var::<u64>("DISTANCE_API_TIMEOUT_SECS")? {
            config.distance = config.distance.with_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var::<u64>("ROOM_REAP_INTERVAL_SECS")? {
            config.registry.reap_interval = Duration::from_secs(secs.max(1));
        }

        Ok(config)
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
