//! Tiered resolver: cache, then each provider in order.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::storage::{RouteCacheEntry, RouteCacheStore};

use super::{
    DistanceMatrixProvider, DistanceProvider, DistanceServiceConfig, HaversineProvider,
    ProviderError, RouteRequest,
};

/// Computes route estimates through an ordered provider chain and caches them
pub struct RouteResolver {
    store: Arc<RouteCacheStore>,
    providers: Vec<Arc<dyn DistanceProvider>>,
}

impl RouteResolver {
    /// Create a resolver with an explicit provider order, most exact first
    pub fn new(store: Arc<RouteCacheStore>, providers: Vec<Arc<dyn DistanceProvider>>) -> Self {
        Self { store, providers }
    }

    /// Distance service first, great-circle estimate as the fallback
    pub fn with_default_chain(
        store: Arc<RouteCacheStore>,
        config: &DistanceServiceConfig,
    ) -> Result<Self, ProviderError> {
        let exact = DistanceMatrixProvider::new(config)?;
        if !exact.is_configured() {
            warn!("Distance service key not configured - routes will be estimated");
        }

        Ok(Self::new(
            store,
            vec![Arc::new(exact), Arc::new(HaversineProvider)],
        ))
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub fn store(&self) -> &Arc<RouteCacheStore> {
        &self.store
    }

    /// Resolve the route for a pair.
    ///
    /// Returns `None` only when there is nothing to compute from (missing
    /// coordinates) or every provider failed. A cached entry is returned as-is;
    /// refreshing is the job of whoever invalidates it.
    pub async fn resolve(&self, request: &RouteRequest) -> Option<RouteCacheEntry> {
        match self.store.get(&request.user_id, &request.destination_id) {
            Ok(Some(entry)) => {
                debug!(
                    "Route cache hit for {} -> {}",
                    request.user_id, request.destination_id
                );
                return Some(entry);
            }
            Ok(None) => {}
            Err(e) => warn!("Route cache read failed, treating as miss: {}", e),
        }

        let Some(destination) = request.destination else {
            debug!("Destination {} has no coordinates", request.destination_id);
            return None;
        };
        let Some(origin) = request.origin else {
            debug!("Traveler {} has no home coordinates", request.user_id);
            return None;
        };

        for provider in &self.providers {
            match provider.estimate(origin, destination).await {
                Ok(estimate) => {
                    let entry = RouteCacheEntry::new(
                        &request.user_id,
                        &request.destination_id,
                        estimate.distance_km,
                        estimate.duration_minutes,
                        provider.name(),
                    );

                    if let Err(e) = self.store.put(&entry) {
                        error!(
                            "Failed to cache route {} -> {}: {}",
                            request.user_id, request.destination_id, e
                        );
                    }

                    info!(
                        "Resolved route {} -> {} via {}: {} km, {} min",
                        request.user_id,
                        request.destination_id,
                        entry.provider,
                        entry.distance_km,
                        entry.duration_minutes
                    );
                    return Some(entry);
                }
                Err(ProviderError::Unavailable(reason)) => {
                    debug!("Provider {} skipped: {}", provider.name(), reason);
                }
                Err(e) => {
                    warn!("Provider {} failed: {}", provider.name(), e);
                }
            }
        }

        warn!(
            "No provider could resolve {} -> {}",
            request.user_id, request.destination_id
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::{haversine_km, RouteEstimate, ROAD_FACTOR};
    use crate::storage::StorageConfig;
    use axum::{routing::get, Json, Router};
    use packsync_shared::Coordinates;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    fn test_store() -> (TempDir, Arc<RouteCacheStore>) {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new(dir.path().join("routes.sled").to_string_lossy().to_string());
        (dir, Arc::new(RouteCacheStore::open(config).unwrap()))
    }

    fn request() -> RouteRequest {
        RouteRequest {
            user_id: "user-1".to_string(),
            destination_id: "dest-1".to_string(),
            origin: Some(Coordinates::new(48.0, 9.0)),
            destination: Some(Coordinates::new(48.1, 9.2)),
        }
    }

    /// Serve a fixed Distance Matrix body on an ephemeral port
    async fn fake_distance_service(body: serde_json::Value) -> String {
        let app = Router::new().route(
            "/maps/api/distancematrix/json",
            get(move || {
                let body = body.clone();
                async move { Json(body) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl DistanceProvider for CountingProvider {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn estimate(
            &self,
            _origin: Coordinates,
            _destination: Coordinates,
        ) -> Result<RouteEstimate, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RouteEstimate {
                distance_km: 1.0,
                duration_minutes: 1,
            })
        }
    }

    #[tokio::test]
    async fn test_falls_back_to_estimate_without_key() {
        let (_dir, store) = test_store();
        let resolver =
            RouteResolver::with_default_chain(store, &DistanceServiceConfig::default()).unwrap();

        let entry = resolver.resolve(&request()).await.unwrap();
        let great_circle = haversine_km(Coordinates::new(48.0, 9.0), Coordinates::new(48.1, 9.2));

        assert_eq!(entry.provider, "haversine");
        assert!((entry.distance_km - great_circle * ROAD_FACTOR).abs() < 0.1);
        assert!(entry.duration_minutes > 0);
    }

    #[tokio::test]
    async fn test_second_call_returns_cached_entry() {
        let (_dir, store) = test_store();
        let counting = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let resolver = RouteResolver::new(store, vec![counting.clone()]);

        let first = resolver.resolve(&request()).await.unwrap();
        let second = resolver.resolve(&request()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_destination_coordinates() {
        let (_dir, store) = test_store();
        let config = DistanceServiceConfig::default().with_api_key("key");
        let resolver = RouteResolver::with_default_chain(store.clone(), &config).unwrap();

        let mut req = request();
        req.destination = None;

        assert!(resolver.resolve(&req).await.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_exact_provider_preferred() {
        let base_url = fake_distance_service(serde_json::json!({
            "status": "OK",
            "rows": [{ "elements": [{
                "status": "OK",
                "distance": { "value": 31000.0 },
                "duration": { "value": 1800.0 }
            }]}]
        }))
        .await;

        let (_dir, store) = test_store();
        let config = DistanceServiceConfig::default()
            .with_api_key("test-key")
            .with_base_url(base_url);
        let resolver = RouteResolver::with_default_chain(store, &config).unwrap();

        let entry = resolver.resolve(&request()).await.unwrap();
        assert_eq!(entry.provider, "google");
        assert_eq!(entry.distance_km, 31.0);
        assert_eq!(entry.duration_minutes, 30);
    }

    #[tokio::test]
    async fn test_non_ok_service_falls_through() {
        let base_url =
            fake_distance_service(serde_json::json!({ "status": "OVER_QUERY_LIMIT" })).await;

        let (_dir, store) = test_store();
        let config = DistanceServiceConfig::default()
            .with_api_key("test-key")
            .with_base_url(base_url);
        let resolver = RouteResolver::with_default_chain(store, &config).unwrap();

        let entry = resolver.resolve(&request()).await.unwrap();
        assert_eq!(entry.provider, "haversine");
    }

    #[tokio::test]
    async fn test_cache_hit_ignores_provider_changes() {
        let (_dir, store) = test_store();

        let without_key =
            RouteResolver::with_default_chain(store.clone(), &DistanceServiceConfig::default())
                .unwrap();
        let first = without_key.resolve(&request()).await.unwrap();

        let base_url = fake_distance_service(serde_json::json!({
            "status": "OK",
            "rows": [{ "elements": [{
                "status": "OK",
                "distance": { "value": 99000.0 },
                "duration": { "value": 6000.0 }
            }]}]
        }))
        .await;
        let config = DistanceServiceConfig::default()
            .with_api_key("test-key")
            .with_base_url(base_url);
        let with_key = RouteResolver::with_default_chain(store.clone(), &config).unwrap();

        assert_eq!(with_key.resolve(&request()).await.unwrap(), first);

        // Once invalidated, the exact provider takes over
        store.invalidate_destination("dest-1").unwrap();
        let refreshed = with_key.resolve(&request()).await.unwrap();
        assert_eq!(refreshed.provider, "google");
    }

    #[test]
    fn test_default_chain_order() {
        let (_dir, store) = test_store();
        let resolver =
            RouteResolver::with_default_chain(store, &DistanceServiceConfig::default()).unwrap();
        assert_eq!(resolver.provider_names(), vec!["google", "haversine"]);
    }
}
