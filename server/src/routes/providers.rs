//! Distance providers: the external driving-distance service and the
//! great-circle estimate used when it is unavailable.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use packsync_shared::Coordinates;

use super::{round_km, DistanceProvider, ProviderError, RouteEstimate};

/// Mean earth radius in kilometres
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Road distance relative to great-circle distance
pub const ROAD_FACTOR: f64 = 1.4;

/// Assumed average driving speed
pub const AVERAGE_SPEED_KMH: f64 = 80.0;

/// Inflation for stops and traffic
pub const DURATION_BUFFER: f64 = 1.3;

/// Configuration for the external distance service
#[derive(Debug, Clone)]
pub struct DistanceServiceConfig {
    /// API key; `None` means the service is unavailable
    pub api_key: Option<String>,
    /// Base URL of the service
    pub base_url: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for DistanceServiceConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://maps.googleapis.com".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl DistanceServiceConfig {
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Great-circle distance between two points in kilometres
pub fn haversine_km(a: Coordinates, b: Coordinates) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Geometric estimate; always available when coordinates are valid
#[derive(Debug, Clone, Copy, Default)]
pub struct HaversineProvider;

#[async_trait]
impl DistanceProvider for HaversineProvider {
    fn name(&self) -> &'static str {
        "haversine"
    }

    async fn estimate(
        &self,
        origin: Coordinates,
        destination: Coordinates,
    ) -> Result<RouteEstimate, ProviderError> {
        if !origin.is_valid() || !destination.is_valid() {
            return Err(ProviderError::InvalidInput(format!(
                "coordinates out of range: {:?} -> {:?}",
                origin, destination
            )));
        }

        let road_km = haversine_km(origin, destination) * ROAD_FACTOR;
        let minutes = road_km / AVERAGE_SPEED_KMH * 60.0 * DURATION_BUFFER;

        Ok(RouteEstimate {
            distance_km: round_km(road_km),
            duration_minutes: (minutes.round() as u32).max(1),
        })
    }
}

/// Driving distance from a Distance Matrix style HTTP service
pub struct DistanceMatrixProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl DistanceMatrixProvider {
    pub fn new(config: &DistanceServiceConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            api_key: config.api_key.clone().filter(|key| !key.trim().is_empty()),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

#[derive(Debug, Deserialize)]
struct MatrixResponse {
    status: String,
    #[serde(default)]
    rows: Vec<MatrixRow>,
}

#[derive(Debug, Deserialize)]
struct MatrixRow {
    #[serde(default)]
    elements: Vec<MatrixElement>,
}

#[derive(Debug, Deserialize)]
struct MatrixElement {
    status: String,
    distance: Option<MatrixValue>,
    duration: Option<MatrixValue>,
}

#[derive(Debug, Deserialize)]
struct MatrixValue {
    /// Metres for distance, seconds for duration
    value: f64,
}

impl MatrixResponse {
    fn into_estimate(self) -> Result<RouteEstimate, ProviderError> {
        if self.status != "OK" {
            return Err(ProviderError::BadResponse(format!("status {}", self.status)));
        }

        let element = self
            .rows
            .into_iter()
            .next()
            .and_then(|row| row.elements.into_iter().next())
            .ok_or_else(|| ProviderError::BadResponse("no route element".to_string()))?;

        if element.status != "OK" {
            return Err(ProviderError::BadResponse(format!(
                "element status {}",
                element.status
            )));
        }

        match (element.distance, element.duration) {
            (Some(distance), Some(duration)) if distance.value >= 0.0 && duration.value >= 0.0 => {
                Ok(RouteEstimate {
                    distance_km: round_km(distance.value / 1000.0),
                    duration_minutes: (duration.value / 60.0).round() as u32,
                })
            }
            _ => Err(ProviderError::BadResponse(
                "missing distance or duration".to_string(),
            )),
        }
    }
}

#[async_trait]
impl DistanceProvider for DistanceMatrixProvider {
    fn name(&self) -> &'static str {
        "google"
    }

    async fn estimate(
        &self,
        origin: Coordinates,
        destination: Coordinates,
    ) -> Result<RouteEstimate, ProviderError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Unavailable("no API key configured".to_string()))?;

        let url = format!("{}/maps/api/distancematrix/json", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("origins", origin.to_query()),
                ("destinations", destination.to_query()),
                ("mode", "driving".to_string()),
                ("key", key.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::BadResponse(format!("HTTP {}", status)));
        }

        let body: MatrixResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::BadResponse(e.to_string()))?;

        debug!("Distance service answered with status {}", body.status);
        body.into_estimate()
    }
}
