// In-process session store.
// Every record carries a deadline; expired records read as absent and are
// dropped by `purge_expired`.
use super::{OnlineSnapshot, ONLINE_SHARDS, SessionStore, StoreError, StoreResult, online_shard};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug)]
struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, Default)]
struct OnlineShard {
    room_count: HashMap<String, i32>,
    updated: u64,
}

#[derive(Debug)]
struct OnlineRecord {
    updated: u64,
    shards: Vec<Option<OnlineShard>>,
}

#[derive(Debug, Default)]
struct Tables {
    // mid -> {key: server}
    mids: HashMap<i64, Expiring<HashMap<String, String>>>,
    // key -> server
    keys: HashMap<String, Expiring<String>>,
    // server -> shards, indexed by `online_shard`
    online: HashMap<String, Expiring<OnlineRecord>>,
}

pub struct MemoryStore {
    expiry: Duration,
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            tables: RwLock::new(Tables::default()),
        }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.expiry
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn add_mapping(&self, mid: i64, key: &str, server: &str) -> StoreResult<()> {
        if key.is_empty() || server.is_empty() {
            return Err(StoreError::Invalid("mapping needs a key and a server".to_string()));
        }
        let now = Instant::now();
        let expires_at = self.deadline();
        let mut tables = self.tables.write().await;
        let entry = tables.mids.entry(mid).or_insert_with(|| Expiring {
            value: HashMap::new(),
            expires_at,
        });
        if !entry.live(now) {
            entry.value.clear();
        }
        entry.value.insert(key.to_string(), server.to_string());
        entry.expires_at = expires_at;
        tables.keys.insert(
            key.to_string(),
            Expiring {
                value: server.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn del_mapping(&self, mid: i64, key: &str, server: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let mut tables = self.tables.write().await;
        let mut has = false;
        if let Some(entry) = tables.mids.get_mut(&mid) {
            // A newer login on another server keeps its mapping.
            if entry.live(now) && entry.value.get(key).is_some_and(|owner| owner == server) {
                entry.value.remove(key);
                has = true;
            }
            if entry.value.is_empty() || !entry.live(now) {
                tables.mids.remove(&mid);
            }
        }
        if tables
            .keys
            .get(key)
            .is_some_and(|entry| entry.value == server || !entry.live(now))
        {
            tables.keys.remove(key);
        }
        Ok(has)
    }

    async fn servers_by_keys(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        let now = Instant::now();
        let tables = self.tables.read().await;
        Ok(keys
            .iter()
            .map(|key| {
                tables
                    .keys
                    .get(key)
                    .filter(|entry| entry.live(now))
                    .map(|entry| entry.value.clone())
            })
            .collect())
    }

    async fn keys_by_mids(&self, mids: &[i64]) -> StoreResult<HashMap<String, String>> {
        let now = Instant::now();
        let tables = self.tables.read().await;
        let mut found = HashMap::new();
        for mid in mids {
            if let Some(entry) = tables.mids.get(mid).filter(|entry| entry.live(now)) {
                found.extend(entry.value.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        Ok(found)
    }

    async fn add_server_online(&self, online: &OnlineSnapshot) -> StoreResult<()> {
        if online.server.is_empty() {
            return Err(StoreError::Invalid("online snapshot needs a server".to_string()));
        }
        let mut shards: Vec<Option<OnlineShard>> = vec![None; ONLINE_SHARDS];
        for (room_id, count) in &online.room_count {
            let shard = shards[online_shard(room_id)].get_or_insert_with(|| OnlineShard {
                room_count: HashMap::new(),
                updated: online.updated,
            });
            shard.room_count.insert(room_id.clone(), *count);
        }
        let expires_at = self.deadline();
        self.tables.write().await.online.insert(
            online.server.clone(),
            Expiring {
                value: OnlineRecord {
                    updated: online.updated,
                    shards,
                },
                expires_at,
            },
        );
        Ok(())
    }

    async fn server_online(&self, server: &str) -> StoreResult<Option<OnlineSnapshot>> {
        let now = Instant::now();
        let tables = self.tables.read().await;
        let Some(entry) = tables.online.get(server).filter(|entry| entry.live(now)) else {
            return Ok(None);
        };
        let mut snapshot = OnlineSnapshot {
            server: server.to_string(),
            room_count: HashMap::new(),
            updated: entry.value.updated,
        };
        for shard in entry.value.shards.iter().flatten() {
            snapshot.updated = snapshot.updated.max(shard.updated);
            snapshot
                .room_count
                .extend(shard.room_count.iter().map(|(k, v)| (k.clone(), *v)));
        }
        Ok(Some(snapshot))
    }

    async fn del_server_online(&self, server: &str) -> StoreResult<()> {
        self.tables.write().await.online.remove(server);
        Ok(())
    }

    async fn online_servers(&self) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        let tables = self.tables.read().await;
        let mut servers: Vec<String> = tables
            .online
            .iter()
            .filter(|(_, entry)| entry.live(now))
            .map(|(server, _)| server.clone())
            .collect();
        servers.sort();
        Ok(servers)
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        let now = Instant::now();
        let mut tables = self.tables.write().await;
        let before = tables.mids.len() + tables.keys.len() + tables.online.len();
        tables.mids.retain(|_, entry| entry.live(now));
        tables.keys.retain(|_, entry| entry.live(now));
        tables.online.retain(|_, entry| entry.live(now));
        let after = tables.mids.len() + tables.keys.len() + tables.online.len();
        Ok(before - after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn mappings_resolve_by_key_and_mid() {
        let store = store();
        store.add_mapping(7, "k1", "node-a").await.expect("add");
        store.add_mapping(7, "k2", "node-b").await.expect("add");

        let servers = store
            .servers_by_keys(&["k1".to_string(), "missing".to_string()])
            .await
            .expect("servers");
        assert_eq!(servers, vec![Some("node-a".to_string()), None]);

        let keys = store.keys_by_mids(&[7, 8]).await.expect("keys");
        assert_eq!(keys.len(), 2);
        assert_eq!(keys.get("k2").map(String::as_str), Some("node-b"));
    }

    #[tokio::test]
    async fn del_mapping_reports_presence_and_respects_owner() {
        let store = store();
        store.add_mapping(1, "k", "node-a").await.expect("add");
        // The key moved to node-b; a late disconnect from node-a must not erase it.
        store.add_mapping(1, "k", "node-b").await.expect("re-add");
        assert!(!store.del_mapping(1, "k", "node-a").await.expect("del"));
        assert_eq!(
            store.servers_by_keys(&["k".to_string()]).await.expect("servers"),
            vec![Some("node-b".to_string())]
        );

        assert!(store.del_mapping(1, "k", "node-b").await.expect("del"));
        assert!(!store.del_mapping(1, "k", "node-b").await.expect("del again"));
        assert!(store.keys_by_mids(&[1]).await.expect("keys").is_empty());
    }

    #[tokio::test]
    async fn empty_key_is_rejected() {
        let err = store().add_mapping(1, "", "node").await.expect_err("invalid");
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn online_snapshot_round_trips_through_shards() {
        let store = store();
        let room_count: HashMap<String, i32> = (0..200)
            .map(|i| (format!("live://{i}"), i))
            .collect();
        let snapshot = OnlineSnapshot {
            server: "node-a".to_string(),
            room_count: room_count.clone(),
            updated: 1_700_000_000,
        };
        store.add_server_online(&snapshot).await.expect("add");
        assert_eq!(store.server_online("node-a").await.expect("get"), Some(snapshot));

        // A new report replaces rooms that disappeared.
        let smaller = OnlineSnapshot {
            server: "node-a".to_string(),
            room_count: HashMap::from([("live://1".to_string(), 3)]),
            updated: 1_700_000_010,
        };
        store.add_server_online(&smaller).await.expect("replace");
        assert_eq!(store.server_online("node-a").await.expect("get"), Some(smaller));

        store.del_server_online("node-a").await.expect("del");
        assert_eq!(store.server_online("node-a").await.expect("get"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn records_expire_and_purge() {
        let store = MemoryStore::new(Duration::from_secs(10));
        store.add_mapping(1, "k", "node-a").await.expect("add");
        store
            .add_server_online(&OnlineSnapshot {
                server: "node-a".to_string(),
                room_count: HashMap::new(),
                updated: 0,
            })
            .await
            .expect("online");
        assert_eq!(store.online_servers().await.expect("servers"), vec!["node-a"]);
        let empty = store.server_online("node-a").await.expect("get").expect("live");
        assert!(empty.room_count.is_empty());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(
            store.servers_by_keys(&["k".to_string()]).await.expect("servers"),
            vec![None]
        );
        assert!(store.online_servers().await.expect("servers").is_empty());
        assert_eq!(store.purge_expired().await.expect("purge"), 3);
    }
}
