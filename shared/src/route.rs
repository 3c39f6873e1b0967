//! Route lookup types exchanged between devices and the route resolver.

use serde::{Deserialize, Serialize};

use crate::model::Coordinates;

/// Input for one route lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRequest {
    pub user_id: String,
    pub destination_id: String,
    /// Traveler's home location
    #[serde(default)]
    pub origin: Option<Coordinates>,
    /// Destination location
    #[serde(default)]
    pub destination: Option<Coordinates>,
}

/// Cached route estimate for one (traveler, destination) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteCacheEntry {
    /// Traveler whose home location is the origin
    pub user_id: String,
    /// Destination the route leads to
    pub destination_id: String,
    /// Road distance in kilometres
    pub distance_km: f64,
    /// Travel time in minutes
    pub duration_minutes: u32,
    /// Name of the provider tier that produced the value
    pub provider: String,
    /// Unix timestamp of when the value was computed
    pub updated_at: i64,
}

impl RouteCacheEntry {
    pub fn new(
        user_id: impl Into<String>,
        destination_id: impl Into<String>,
        distance_km: f64,
        duration_minutes: u32,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            destination_id: destination_id.into(),
            distance_km,
            duration_minutes,
            provider: provider.into(),
            updated_at: chrono::Utc::now().timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_creation() {
        let entry = RouteCacheEntry::new("user-1", "dest-1", 26.0, 25, "haversine");

        assert_eq!(entry.user_id, "user-1");
        assert_eq!(entry.destination_id, "dest-1");
        assert_eq!(entry.provider, "haversine");
        assert!(entry.updated_at > 0);
    }

    #[test]
    fn test_entry_json_is_camel_case() {
        let entry = RouteCacheEntry::new("user-1", "dest-1", 26.0, 25, "google");
        let json = serde_json::to_value(&entry).unwrap();

        assert_eq!(json["distanceKm"], 26.0);
        assert_eq!(json["durationMinutes"], 25);
    }

    #[test]
    fn test_request_without_coordinates() {
        let request: RouteRequest =
            serde_json::from_str(r#"{"userId":"u","destinationId":"d"}"#).unwrap();
        assert!(request.origin.is_none());
        assert!(request.destination.is_none());
    }
}
