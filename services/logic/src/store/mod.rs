//! Session-mapping storage for the logic tier.
//!
//! Two kinds of records are kept, both with an expiry refreshed on write:
//! - connection mappings: `mid -> {key: server}` and `key -> server`;
//! - per-server online snapshots, partitioned into [`ONLINE_SHARDS`] shards by
//!   room id so a single update never rewrites one large record.
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

pub mod memory;

/// Shard count for per-server online snapshots.
pub const ONLINE_SHARDS: usize = 64;

/// Room counts reported by one connect node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OnlineSnapshot {
    pub server: String,
    pub room_count: HashMap<String, i32>,
    // Unix seconds of the report.
    pub updated: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid record: {0}")]
    Invalid(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn add_mapping(&self, mid: i64, key: &str, server: &str) -> StoreResult<()>;
    /// Removes both mappings; returns whether the `mid` entry existed.
    async fn del_mapping(&self, mid: i64, key: &str, server: &str) -> StoreResult<bool>;
    /// Server currently holding each key, in request order.
    async fn servers_by_keys(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>>;
    /// `key -> server` for every live connection of the given members.
    async fn keys_by_mids(&self, mids: &[i64]) -> StoreResult<HashMap<String, String>>;

    /// Replaces the snapshot for `online.server`.
    async fn add_server_online(&self, online: &OnlineSnapshot) -> StoreResult<()>;
    async fn server_online(&self, server: &str) -> StoreResult<Option<OnlineSnapshot>>;
    async fn del_server_online(&self, server: &str) -> StoreResult<()>;
    /// Servers with a live snapshot.
    async fn online_servers(&self) -> StoreResult<Vec<String>>;

    /// Drops expired records; returns how many were removed.
    async fn purge_expired(&self) -> StoreResult<usize>;
}

/// Shard holding `room_id` within a server snapshot.
pub fn online_shard(room_id: &str) -> usize {
    courier_hub::shard_index(room_id, ONLINE_SHARDS)
}
