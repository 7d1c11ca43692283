// Connection bookkeeping for the connect tier.
// Buckets shard the key -> channel table; rooms group channels for fan-out;
// every channel owns a bounded outbound queue drained by its writer task.
use ahash::RandomState;
use std::hash::BuildHasher;
use std::sync::LazyLock;

pub mod bucket;
pub mod channel;
pub mod room;

pub use bucket::{BroadcastStats, Bucket, BucketConfig, RoomBroadcast};
pub use channel::{Channel, ChannelId, ChannelReceiver, Identity, Signal};
pub use room::Room;

pub type Result<T> = std::result::Result<T, HubError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("channel queue full")]
    QueueFull,
    #[error("channel closed")]
    ChannelClosed,
    #[error("room dropped: {0}")]
    RoomDropped(String),
    #[error("too many connections from {ip} (limit {limit})")]
    TooManyConnections { ip: String, limit: usize },
    #[error("room broadcast queue full")]
    RoomQueueFull,
}

// Fixed seeds so every process maps a key to the same bucket index.
static SHARD_HASHER: LazyLock<RandomState> = LazyLock::new(|| {
    RandomState::with_seeds(
        0x243f_6a88_85a3_08d3,
        0x1319_8a2e_0370_7344,
        0xa409_3822_299f_31d0,
        0x082e_fa98_ec4e_6c89,
    )
});

/// Bucket index for a connection key.
pub fn shard_index(key: &str, buckets: usize) -> usize {
    if buckets <= 1 {
        return 0;
    }
    (SHARD_HASHER.hash_one(key) % buckets as u64) as usize
}
