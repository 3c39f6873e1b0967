//! Route cache resolver.
//!
//! A route estimate from a traveler's home to a destination is computed once
//! per pair and cached. Providers are an ordered list, most exact first; the
//! resolver walks it until one produces a value.

mod providers;
mod resolver;

pub use providers::{
    haversine_km, DistanceMatrixProvider, DistanceServiceConfig, HaversineProvider,
    AVERAGE_SPEED_KMH, DURATION_BUFFER, EARTH_RADIUS_KM, ROAD_FACTOR,
};
pub use resolver::RouteResolver;

pub use packsync_shared::{RouteCacheEntry, RouteRequest};

use async_trait::async_trait;
use thiserror::Error;

use packsync_shared::Coordinates;

/// Distance and duration as produced by a provider
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteEstimate {
    pub distance_km: f64,
    pub duration_minutes: u32,
}

/// Why a provider could not produce an estimate
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Not configured (e.g. no API key); the next tier should be tried
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-OK status or a body that does not have the expected shape
    #[error("Bad response: {0}")]
    BadResponse(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// One tier of the provider chain
#[async_trait]
pub trait DistanceProvider: Send + Sync {
    /// Name recorded on cache entries produced by this provider
    fn name(&self) -> &'static str;

    async fn estimate(
        &self,
        origin: Coordinates,
        destination: Coordinates,
    ) -> Result<RouteEstimate, ProviderError>;
}

/// Round to one decimal place
pub(crate) fn round_km(km: f64) -> f64 {
    (km * 10.0).round() / 10.0
}
