// A bucket is one shard of the connection table.
// Lock order is channel room slot -> bucket tables -> room members, and the
// bucket lock is always released before a room method runs.
use crate::channel::Channel;
use crate::room::Room;
use crate::{HubError, Result};
use ahash::RandomState;
use courier_wire::Proto;
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

const DEFAULT_BUCKET_SIZE: usize = 32;
const DEFAULT_CHANNEL_SIZE: usize = 1024;
const DEFAULT_ROOM_SIZE: usize = 1024;
const DEFAULT_ROUTINE_AMOUNT: usize = 32;
const DEFAULT_ROUTINE_SIZE: usize = 1024;
// A fresh room can only be dropped by a racing leave, so a couple of retries
// are enough to settle on a live one.
const JOIN_ATTEMPTS: usize = 3;

/// Sizing for one bucket and for the bucket array that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketConfig {
    /// Number of buckets per server.
    pub size: usize,
    /// Initial capacity of the key -> channel table.
    pub channel: usize,
    /// Initial capacity of the room table.
    pub room: usize,
    /// Room-broadcast worker count.
    pub routine_amount: usize,
    /// Depth of each room-broadcast worker queue.
    pub routine_size: usize,
    /// Connections allowed per remote IP; 0 disables the check.
    pub max_conns_per_ip: usize,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_BUCKET_SIZE,
            channel: DEFAULT_CHANNEL_SIZE,
            room: DEFAULT_ROOM_SIZE,
            routine_amount: DEFAULT_ROUTINE_AMOUNT,
            routine_size: DEFAULT_ROUTINE_SIZE,
            max_conns_per_ip: 0,
        }
    }
}

/// A frame addressed to every member of a room.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomBroadcast {
    pub room_id: String,
    pub proto: Proto,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastStats {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug)]
struct Tables {
    channels: HashMap<String, Arc<Channel>, RandomState>,
    rooms: HashMap<String, Arc<Room>, RandomState>,
    ip_counts: HashMap<String, usize, RandomState>,
}

#[derive(Debug)]
pub struct Bucket {
    max_conns_per_ip: usize,
    join_attempts: usize,
    tables: RwLock<Tables>,
    routines: Vec<mpsc::Sender<RoomBroadcast>>,
    next_routine: AtomicUsize,
}

impl Bucket {
    /// Builds a bucket and spawns its room-broadcast workers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: &BucketConfig) -> Arc<Self> {
        Self::build(config, JOIN_ATTEMPTS)
    }

    fn build(config: &BucketConfig, join_attempts: usize) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Bucket>| {
            let amount = config.routine_amount.max(1);
            let mut routines = Vec::with_capacity(amount);
            for _ in 0..amount {
                let (tx, rx) = mpsc::channel(config.routine_size.max(1));
                tokio::spawn(room_routine(weak.clone(), rx));
                routines.push(tx);
            }
            Self {
                max_conns_per_ip: config.max_conns_per_ip,
                join_attempts: join_attempts.max(1),
                tables: RwLock::new(Tables {
                    channels: HashMap::with_capacity_and_hasher(
                        config.channel,
                        RandomState::new(),
                    ),
                    rooms: HashMap::with_capacity_and_hasher(config.room, RandomState::new()),
                    ip_counts: HashMap::with_hasher(RandomState::new()),
                }),
                routines,
                next_routine: AtomicUsize::new(0),
            }
        })
    }

    /// Registers `channel` under its key and joins `room_id` when non-empty.
    ///
    /// A channel already registered under the same key is replaced and told to finish.
    /// The replaced channel hands its per-IP slot over, so a reconnect from the same
    /// address is never refused by the limit. If the room cannot be joined the
    /// registration is rolled back.
    pub fn put(&self, room_id: &str, channel: &Arc<Channel>) -> Result<()> {
        let mut slot = channel.room_slot();
        let (replaced, room) = {
            let mut tables = self.tables.write();
            let reuses_slot = tables
                .channels
                .get(channel.key())
                .is_some_and(|current| current.ip() == channel.ip());
            if self.max_conns_per_ip > 0 && !reuses_slot {
                let current = tables.ip_counts.get(channel.ip()).copied().unwrap_or(0);
                if current >= self.max_conns_per_ip {
                    return Err(HubError::TooManyConnections {
                        ip: channel.ip().to_string(),
                        limit: self.max_conns_per_ip,
                    });
                }
            }
            let replaced = tables
                .channels
                .insert(channel.key().to_string(), Arc::clone(channel))
                .filter(|old| !Arc::ptr_eq(old, channel));
            if let Some(old) = &replaced
                && old.take_registered()
            {
                release_ip(&mut tables, old.ip());
            }
            if !channel.take_registered() {
                *tables
                    .ip_counts
                    .entry(channel.ip().to_string())
                    .or_insert(0) += 1;
            }
            channel.mark_registered();
            let room = (!room_id.is_empty()).then(|| resolve_room(&mut tables, room_id));
            (replaced, room)
        };
        if let Some(old) = replaced {
            tracing::debug!(key = %old.key(), "replacing channel registered under the same key");
            old.signal_close();
        }
        if let Some(room) = room {
            match self.join_room(room, channel) {
                Ok(room) => *slot = Arc::downgrade(&room),
                Err(err) => {
                    tracing::warn!(key = %channel.key(), error = %err, "room join failed");
                    self.unregister(channel);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Unregisters `channel` if it still owns its key and leaves its room.
    pub fn remove(&self, channel: &Arc<Channel>) {
        let mut slot = channel.room_slot();
        self.unregister(channel);
        let room = slot.upgrade();
        *slot = Weak::new();
        if let Some(room) = room
            && room.leave(channel)
        {
            self.drop_room(&room);
        }
    }

    /// Moves `channel` to `room_id`; an empty id only leaves the current room.
    pub fn change_room(&self, room_id: &str, channel: &Arc<Channel>) -> Result<()> {
        let mut slot = channel.room_slot();
        let old = slot.upgrade();
        if let Some(old) = &old
            && old.id() == room_id
            && old.contains(channel.id())
        {
            return Ok(());
        }
        let target = if room_id.is_empty() {
            None
        } else {
            let mut tables = self.tables.write();
            Some(resolve_room(&mut tables, room_id))
        };
        *slot = Weak::new();
        if let Some(old) = old
            && old.leave(channel)
        {
            self.drop_room(&old);
        }
        if let Some(target) = target {
            let room = self.join_room(target, channel)?;
            *slot = Arc::downgrade(&room);
        }
        Ok(())
    }

    /// Pushes `proto` to every channel watching `op`.
    pub fn broadcast(&self, proto: &Proto, op: i32) -> BroadcastStats {
        let tables = self.tables.read();
        let mut stats = BroadcastStats::default();
        for channel in tables.channels.values() {
            if !channel.needs_delivery(op) {
                continue;
            }
            match channel.push(proto.clone()) {
                Ok(()) => stats.delivered += 1,
                Err(_) => stats.dropped += 1,
            }
        }
        stats
    }

    /// Hands a room broadcast to the next worker without waiting.
    pub fn broadcast_room(&self, request: RoomBroadcast) -> Result<()> {
        let idx = self.next_routine.fetch_add(1, Ordering::Relaxed) % self.routines.len();
        self.routines[idx].try_send(request).map_err(|_| {
            metrics::counter!("courier_room_broadcast_dropped_total").increment(1);
            HubError::RoomQueueFull
        })
    }

    pub fn channel(&self, key: &str) -> Option<Arc<Channel>> {
        self.tables.read().channels.get(key).cloned()
    }

    pub fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.tables.read().rooms.get(room_id).cloned()
    }

    pub fn channel_count(&self) -> usize {
        self.tables.read().channels.len()
    }

    pub fn room_count(&self) -> usize {
        self.tables.read().rooms.len()
    }

    pub fn ip_count(&self, ip: &str) -> usize {
        self.tables.read().ip_counts.get(ip).copied().unwrap_or(0)
    }

    /// Local online count of every room that has at least one member.
    pub fn rooms_snapshot(&self) -> std::collections::HashMap<String, i32> {
        let rooms: Vec<Arc<Room>> = self.tables.read().rooms.values().cloned().collect();
        rooms
            .into_iter()
            .filter_map(|room| {
                let online = room.local_online();
                (online > 0).then(|| (room.id().to_string(), online))
            })
            .collect()
    }

    /// Applies the cluster-wide counts; rooms missing from `counts` fall back to zero.
    pub fn update_room_counts(&self, counts: &std::collections::HashMap<String, i32>) {
        let tables = self.tables.read();
        for (id, room) in tables.rooms.iter() {
            room.set_all_online(counts.get(id).copied().unwrap_or(0));
        }
    }

    fn join_room(&self, mut room: Arc<Room>, channel: &Arc<Channel>) -> Result<Arc<Room>> {
        let mut attempt = 1;
        loop {
            match room.join(channel) {
                Ok(()) => return Ok(room),
                Err(HubError::RoomDropped(_)) if attempt < self.join_attempts => {
                    attempt += 1;
                    let mut tables = self.tables.write();
                    evict_room(&mut tables, &room);
                    room = resolve_room(&mut tables, room.id());
                }
                Err(err) => return Err(err),
            }
        }
    }

    // Callers hold the channel's room slot.
    fn unregister(&self, channel: &Arc<Channel>) {
        let mut tables = self.tables.write();
        let owns_key = tables
            .channels
            .get(channel.key())
            .is_some_and(|current| Arc::ptr_eq(current, channel));
        if owns_key {
            tables.channels.remove(channel.key());
        }
        if channel.take_registered() {
            release_ip(&mut tables, channel.ip());
        }
    }

    fn drop_room(&self, room: &Arc<Room>) {
        {
            let mut tables = self.tables.write();
            evict_room(&mut tables, room);
        }
        room.close();
    }
}

fn resolve_room(tables: &mut Tables, room_id: &str) -> Arc<Room> {
    Arc::clone(
        tables
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(Room::new(room_id))),
    )
}

fn evict_room(tables: &mut Tables, room: &Arc<Room>) {
    let current = tables
        .rooms
        .get(room.id())
        .is_some_and(|existing| Arc::ptr_eq(existing, room));
    if current {
        tables.rooms.remove(room.id());
    }
}

fn release_ip(tables: &mut Tables, ip: &str) {
    if let Some(count) = tables.ip_counts.get_mut(ip) {
        if *count > 1 {
            *count -= 1;
        } else {
            tables.ip_counts.remove(ip);
        }
    }
}

async fn room_routine(bucket: Weak<Bucket>, mut rx: mpsc::Receiver<RoomBroadcast>) {
    while let Some(request) = rx.recv().await {
        let Some(bucket) = bucket.upgrade() else {
            break;
        };
        if let Some(room) = bucket.room(&request.room_id) {
            let delivered = room.push(&request.proto);
            metrics::counter!("courier_broadcast_delivered_total").increment(delivered as u64);
        }
    }
}
