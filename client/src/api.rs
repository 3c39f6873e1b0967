//! Data API access with the local store as fallback.
//!
//! Every read goes through [`fetch_with_cache`]: a successful fetch refreshes
//! the local copy, a failed one answers from it and says so.

use packsync_shared::{
    Category, Collection, EquipmentItem, MainCategory, PackingEntry, Record, Tag, Traveler, Trip,
    Vehicle,
};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::store::LocalStore;

/// Errors talking to the data API
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("{path} answered {status}")]
    Status { status: u16, path: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    /// Whether retrying later could succeed; anything else is a rejection
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Network(e) => !e.is_decode() && !e.is_builder(),
            ApiError::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            ApiError::InvalidRequest(_) => false,
        }
    }
}

/// Thin reqwest client for the collection endpoints
pub struct HttpDataApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDataApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /api/<table>`
    pub async fn fetch<T: Record>(&self) -> Result<Vec<T>, ApiError> {
        self.get_json(&format!("/api/{}", T::COLLECTION)).await
    }

    /// `GET /api/trips/<trip_id>/packing_entries`
    pub async fn fetch_trip_entries(&self, trip_id: &str) -> Result<Vec<PackingEntry>, ApiError> {
        self.get_json(&format!("/api/trips/{}/{}", trip_id, Collection::PackingEntries))
            .await
    }

    /// `PUT /api/<table>/<key>` with the record as body
    pub async fn put(&self, table: Collection, key: &str, payload: &Value) -> Result<(), ApiError> {
        let path = format!("/api/{}/{}", table, key);
        let response = self
            .client
            .put(format!("{}{}", self.base_url, path))
            .json(payload)
            .send()
            .await?;
        check_status(response, path).map(|_| ())
    }

    /// `DELETE /api/<table>/<key>`
    pub async fn delete(&self, table: Collection, key: &str) -> Result<(), ApiError> {
        let path = format!("/api/{}/{}", table, key);
        let response = self
            .client
            .delete(format!("{}{}", self.base_url, path))
            .send()
            .await?;
        check_status(response, path).map(|_| ())
    }

    async fn get_json<T: Record>(&self, path: &str) -> Result<Vec<T>, ApiError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?;
        Ok(check_status(response, path.to_string())?.json().await?)
    }
}

fn check_status(response: reqwest::Response, path: String) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(ApiError::Status {
            status: status.as_u16(),
            path,
        })
    }
}

/// Which slice of the local store a fetch refreshes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheScope<'a> {
    /// The whole collection
    Collection,
    /// Every record of one trip, replaced as a set
    Trip(&'a str),
}

/// Records plus where they came from
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub data: Vec<T>,
    /// Set when the network failed and the data may be stale
    pub from_cache: bool,
}

/// Run a fetch and mirror its result into the store, or fall back to the store.
///
/// Never fails: persistence errors only mean the result wasn't cached, and a
/// store that can't be read answers with no data.
pub async fn fetch_with_cache<T, F>(store: &LocalStore, scope: CacheScope<'_>, fetch: F) -> Fetched<T>
where
    T: Record,
    F: Future<Output = Result<Vec<T>, ApiError>>,
{
    match fetch.await {
        Ok(data) => {
            let cached = match scope {
                CacheScope::Collection => store.cache_records(&data),
                CacheScope::Trip(trip_id) => store.replace_trip_entries(trip_id, &data),
            };
            if let Err(e) = cached {
                error!("Failed to cache {} records: {}", T::COLLECTION, e);
            }
            Fetched {
                data,
                from_cache: false,
            }
        }
        Err(e) => {
            warn!("Fetching {} failed, reading local copy: {}", T::COLLECTION, e);
            let local = match scope {
                CacheScope::Collection => store.read_all(),
                CacheScope::Trip(trip_id) => store.read_trip_entries(trip_id),
            };
            let data = local.unwrap_or_else(|e| {
                error!("Failed to read cached {} records: {}", T::COLLECTION, e);
                Vec::new()
            });
            Fetched {
                data,
                from_cache: true,
            }
        }
    }
}

/// Data API and device store used together
#[derive(Clone)]
pub struct CachedApi {
    api: Arc<HttpDataApi>,
    store: LocalStore,
}

impl CachedApi {
    pub fn new(api: Arc<HttpDataApi>, store: LocalStore) -> Self {
        Self { api, store }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub async fn collection<T: Record>(&self) -> Fetched<T> {
        fetch_with_cache(&self.store, CacheScope::Collection, self.api.fetch::<T>()).await
    }

    pub async fn trip_entries(&self, trip_id: &str) -> Fetched<PackingEntry> {
        fetch_with_cache(
            &self.store,
            CacheScope::Trip(trip_id),
            self.api.fetch_trip_entries(trip_id),
        )
        .await
    }

    /// Refetch one collection by name; returns whether the answer came from cache
    pub async fn refresh(&self, collection: Collection, trip_id: &str) -> bool {
        debug!("Refreshing {} for trip {}", collection, trip_id);
        match collection {
            Collection::Trips => self.collection::<Trip>().await.from_cache,
            Collection::Equipment => self.collection::<EquipmentItem>().await.from_cache,
            Collection::Categories => self.collection::<Category>().await.from_cache,
            Collection::MainCategories => self.collection::<MainCategory>().await.from_cache,
            Collection::Tags => self.collection::<Tag>().await.from_cache,
            Collection::Travelers => self.collection::<Traveler>().await.from_cache,
            Collection::Vehicles => self.collection::<Vehicle>().await.from_cache,
            Collection::PackingEntries => self.trip_entries(trip_id).await.from_cache,
        }
    }
}
