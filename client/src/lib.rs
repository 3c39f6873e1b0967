//! Device side of packsync.
//!
//! This crate provides:
//! - A sled-backed store mirroring server collections for offline reads
//! - A persistent queue of offline mutations, drained in timestamp order
//! - Fetch-then-cache access to the data API
//! - A live session that refreshes the store when the trip's room reports a change
//! - Cancellable route lookups

pub mod api;
pub mod config;
pub mod device;
pub mod live;
pub mod queue;
pub mod routes;
pub mod store;

pub use api::{fetch_with_cache, ApiError, CacheScope, CachedApi, Fetched, HttpDataApi};
pub use config::{ClientConfig, ReplayMode};
pub use device::{Device, DeviceError};
pub use live::{ChangeHandler, ConnectionStatus, LiveConfig, LiveSession, Refresher};
pub use queue::{
    Action, Connectivity, DrainOutcome, DrainReport, Mutation, OfflineWriter, Reconciler, Replayer,
    SyncQueue, SyncQueueEntry, WriteOutcome,
};
pub use routes::{RouteClient, RouteLookup};
pub use store::{CachedRecord, LocalStore, StoreConfig};
