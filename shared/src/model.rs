//! Domain records as served by the data API.
//!
//! These types are deliberately free of any cache bookkeeping. The device-side
//! store wraps them in its own envelope and strips it again on every read.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A point on the earth in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Check the value is inside the valid latitude/longitude ranges
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// Format as `lat,lng`, the form distance services expect
    pub fn to_query(&self) -> String {
        format!("{},{}", self.lat, self.lng)
    }
}

/// Every server collection mirrored into the local durable store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Trips,
    Equipment,
    Categories,
    MainCategories,
    Tags,
    Travelers,
    Vehicles,
    PackingEntries,
}

impl Collection {
    pub const ALL: [Collection; 8] = [
        Collection::Trips,
        Collection::Equipment,
        Collection::Categories,
        Collection::MainCategories,
        Collection::Tags,
        Collection::Travelers,
        Collection::Vehicles,
        Collection::PackingEntries,
    ];

    /// Stable table name, used as the sled tree name and the API path segment
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Trips => "trips",
            Collection::Equipment => "equipment",
            Collection::Categories => "categories",
            Collection::MainCategories => "main_categories",
            Collection::Tags => "tags",
            Collection::Travelers => "travelers",
            Collection::Vehicles => "vehicles",
            Collection::PackingEntries => "packing_entries",
        }
    }

    /// Whether records of this collection are partitioned by trip
    pub fn is_trip_scoped(&self) -> bool {
        matches!(self, Collection::PackingEntries)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown collection: {0}")]
pub struct UnknownCollection(pub String);

impl FromStr for Collection {
    type Err = UnknownCollection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Collection::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownCollection(s.to_string()))
    }
}

/// A server entity that can be mirrored locally
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Collection this record belongs to
    const COLLECTION: Collection;

    /// Natural identifier of the record
    fn key(&self) -> &str;

    /// Owning trip, for trip-scoped collections
    fn partition(&self) -> Option<&str> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub destination_id: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub traveler_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquipmentItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub weight_grams: Option<u32>,
    #[serde(default)]
    pub tag_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub main_category_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MainCategory {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Traveler {
    pub id: String,
    pub name: String,
    /// Home location, the origin for route estimates
    #[serde(default)]
    pub home: Option<Coordinates>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub seats: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackingEntry {
    pub id: String,
    pub trip_id: String,
    pub equipment_id: String,
    #[serde(default)]
    pub traveler_id: Option<String>,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default)]
    pub packed: bool,
}

fn default_quantity() -> u32 {
    1
}

/// Trip destination; not mirrored, only consumed by route resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub coordinates: Option<Coordinates>,
}

macro_rules! impl_record {
    ($ty:ty, $collection:expr) => {
        impl Record for $ty {
            const COLLECTION: Collection = $collection;

            fn key(&self) -> &str {
                &self.id
            }
        }
    };
}

impl_record!(Trip, Collection::Trips);
impl_record!(EquipmentItem, Collection::Equipment);
impl_record!(Category, Collection::Categories);
impl_record!(MainCategory, Collection::MainCategories);
impl_record!(Tag, Collection::Tags);
impl_record!(Traveler, Collection::Travelers);
impl_record!(Vehicle, Collection::Vehicles);

impl Record for PackingEntry {
    const COLLECTION: Collection = Collection::PackingEntries;

    fn key(&self) -> &str {
        &self.id
    }

    fn partition(&self) -> Option<&str> {
        Some(&self.trip_id)
    }
}
