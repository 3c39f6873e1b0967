//! Route lookups that a view can abandon.
//!
//! A lookup triggered by something scrolling into view is tied to a
//! [`CancellationToken`]; when the view goes away the request is dropped and
//! reported as [`RouteLookup::Cancelled`], which callers must not retry.

use packsync_shared::{RouteCacheEntry, RouteRequest};
use reqwest::StatusCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::ApiError;

#[derive(Debug, Clone, PartialEq)]
pub enum RouteLookup {
    Found(RouteCacheEntry),
    /// The destination has no coordinates, so there is no estimate
    NoRoute,
    Cancelled,
}

pub struct RouteClient {
    client: reqwest::Client,
    base_url: String,
}

impl RouteClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// `POST /api/routes/resolve`, abandoned as soon as `cancel` fires
    pub async fn resolve(
        &self,
        request: &RouteRequest,
        cancel: &CancellationToken,
    ) -> Result<RouteLookup, ApiError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(
                    "Route lookup {} -> {} cancelled",
                    request.user_id, request.destination_id
                );
                Ok(RouteLookup::Cancelled)
            }
            result = self.send(request) => result,
        }
    }

    async fn send(&self, request: &RouteRequest) -> Result<RouteLookup, ApiError> {
        let path = "/api/routes/resolve";
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(request)
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(RouteLookup::NoRoute),
            status if status.is_success() => Ok(RouteLookup::Found(response.json().await?)),
            status => Err(ApiError::Status {
                status: status.as_u16(),
                path: path.to_string(),
            }),
        }
    }
}
