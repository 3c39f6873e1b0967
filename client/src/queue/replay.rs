//! Replay of queued mutations against the data API.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{Action, Mutation};
use crate::api::{ApiError, HttpDataApi};

/// Sends one queued mutation to the data API
#[async_trait]
pub trait Replayer: Send + Sync {
    async fn replay(&self, mutation: &Mutation) -> Result<(), ApiError>;
}

/// Confirms every mutation without touching the network.
///
/// The per-table request shapes of the data API are not settled yet; this keeps
/// the queue mechanics running until they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcknowledgingReplayer;

#[async_trait]
impl Replayer for AcknowledgingReplayer {
    async fn replay(&self, mutation: &Mutation) -> Result<(), ApiError> {
        debug!(
            "Acknowledging {:?} {}/{} without replay",
            mutation.action, mutation.table, mutation.key
        );
        Ok(())
    }
}

/// Maps `put` to `PUT /api/<table>/<key>` and `delete` to `DELETE /api/<table>/<key>`
#[derive(Clone)]
pub struct HttpReplayer {
    api: Arc<HttpDataApi>,
}

impl HttpReplayer {
    pub fn new(api: Arc<HttpDataApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Replayer for HttpReplayer {
    async fn replay(&self, mutation: &Mutation) -> Result<(), ApiError> {
        match mutation.action {
            Action::Put => {
                let payload = mutation.payload.as_ref().ok_or_else(|| {
                    ApiError::InvalidRequest(format!(
                        "put {}/{} has no payload",
                        mutation.table, mutation.key
                    ))
                })?;
                self.api.put(mutation.table, &mutation.key, payload).await
            }
            Action::Delete => self.api.delete(mutation.table, &mutation.key).await,
        }
    }
}
