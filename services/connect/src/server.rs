// Connect-tier server state: the bucket array, the logic client and the
// fan-out operations used by the push surface.
use crate::config::ConnectConfig;
use crate::logic::LogicClient;
use courier_hub::{BroadcastStats, Bucket, HubError, RoomBroadcast, shard_index};
use courier_wire::Proto;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

pub struct Server {
    id: String,
    config: ConnectConfig,
    buckets: Vec<Arc<Bucket>>,
    logic: Arc<dyn LogicClient>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id)
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

impl Server {
    /// Builds the bucket array. Must run inside a Tokio runtime.
    pub fn new(config: ConnectConfig, logic: Arc<dyn LogicClient>) -> Arc<Self> {
        let count = config.bucket.size.max(1);
        let buckets = (0..count).map(|_| Bucket::new(&config.bucket)).collect();
        Arc::new(Self {
            id: config.server_id.clone(),
            config,
            buckets,
            logic,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ConnectConfig {
        &self.config
    }

    pub fn logic(&self) -> &Arc<dyn LogicClient> {
        &self.logic
    }

    pub fn buckets(&self) -> &[Arc<Bucket>] {
        &self.buckets
    }

    /// Bucket owning `key`.
    pub fn bucket(&self, key: &str) -> &Arc<Bucket> {
        &self.buckets[shard_index(key, self.buckets.len())]
    }

    /// Connections currently registered across all buckets.
    pub fn channel_count(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.channel_count()).sum()
    }

    /// Delivers `proto` to each listed key that watches `op`. Unknown keys are skipped.
    pub fn push_keys(&self, keys: &[String], op: i32, proto: &Proto) -> usize {
        let mut delivered = 0;
        for key in keys {
            let Some(channel) = self.bucket(key).channel(key) else {
                continue;
            };
            if !channel.needs_delivery(op) {
                continue;
            }
            match channel.push(proto.clone()) {
                Ok(()) => delivered += 1,
                Err(err) if is_backpressure(&err) => {
                    tracing::debug!(key = %key, op, error = %err, "channel queue full");
                }
                Err(err) => {
                    tracing::warn!(key = %key, op, error = %err, "push to channel failed");
                }
            }
        }
        delivered
    }

    /// Broadcasts to every bucket, pausing `channels / speed` seconds after each one.
    pub async fn broadcast(&self, proto: &Proto, op: i32, speed: i32) -> BroadcastStats {
        let mut total = BroadcastStats::default();
        for bucket in &self.buckets {
            let stats = bucket.broadcast(proto, op);
            total.delivered += stats.delivered;
            total.dropped += stats.dropped;
            if speed > 0 {
                let pause = bucket.channel_count() as u64 / speed as u64;
                if pause > 0 {
                    tokio::time::sleep(Duration::from_secs(pause)).await;
                }
            }
        }
        metrics::counter!("courier_broadcast_delivered_total").increment(total.delivered as u64);
        tracing::debug!(
            op,
            delivered = total.delivered,
            dropped = total.dropped,
            "broadcast finished"
        );
        total
    }

    /// Queues a room broadcast on every bucket; returns how many buckets refused it.
    pub fn broadcast_room(&self, room_id: &str, proto: &Proto) -> usize {
        let mut refused = 0;
        for bucket in &self.buckets {
            let request = RoomBroadcast {
                room_id: room_id.to_string(),
                proto: proto.clone(),
            };
            if let Err(err) = bucket.broadcast_room(request) {
                refused += 1;
                tracing::warn!(room_id, error = %err, "room broadcast rejected");
            }
        }
        refused
    }

    /// Room ids with at least one local member.
    pub fn rooms(&self) -> BTreeSet<String> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.rooms_snapshot().into_keys())
            .collect()
    }

    /// Local member count per room, summed across buckets.
    pub fn room_counts(&self) -> HashMap<String, i32> {
        let mut counts = HashMap::new();
        for bucket in &self.buckets {
            for (room_id, online) in bucket.rooms_snapshot() {
                *counts.entry(room_id).or_insert(0) += online;
            }
        }
        counts
    }

    pub fn update_room_counts(&self, all: &HashMap<String, i32>) {
        for bucket in &self.buckets {
            bucket.update_room_counts(all);
        }
    }
}

/// True when the error only means the target could not take more frames.
fn is_backpressure(err: &HubError) -> bool {
    matches!(err, HubError::QueueFull | HubError::RoomQueueFull)
}
