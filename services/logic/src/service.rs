// Session bookkeeping behind the logic API.
// Connect nodes authenticate clients, report disconnects and renew their room
// counts here; a periodic tick folds every live node snapshot into cluster
// room totals.
use crate::config::LogicConfig;
use crate::store::{OnlineSnapshot, SessionStore, StoreError};
use courier_common::{
    ConnectReply, ConnectRequest, DisconnectReply, DisconnectRequest, OnlineReply, OnlineRequest,
    ReceiveRequest,
};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogicError {
    #[error("invalid auth token: {0}")]
    InvalidToken(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type LogicResult<T> = Result<T, LogicError>;

// Body of the client's auth frame.
#[derive(Debug, Default, Deserialize)]
struct AuthToken {
    #[serde(default)]
    mid: i64,
    #[serde(default)]
    key: String,
    #[serde(default)]
    room_id: String,
    #[serde(default)]
    platform: String,
    #[serde(default)]
    accepts: Vec<i32>,
}

pub struct Logic {
    config: LogicConfig,
    store: Arc<dyn SessionStore>,
    room_totals: RwLock<HashMap<String, i32>>,
}

impl Logic {
    pub fn new(config: LogicConfig, store: Arc<dyn SessionStore>) -> Self {
        Self {
            config,
            store,
            room_totals: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &LogicConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub async fn connect(&self, req: ConnectRequest) -> LogicResult<ConnectReply> {
        let token: AuthToken = serde_json::from_slice(&req.token)?;
        let key = if token.key.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            token.key
        };
        self.store.add_mapping(token.mid, &key, &req.server).await?;
        tracing::info!(
            mid = token.mid,
            key = %key,
            room_id = %token.room_id,
            platform = %token.platform,
            server = %req.server,
            "client connected"
        );
        metrics::counter!("courier_logic_connects_total").increment(1);
        Ok(ConnectReply {
            mid: token.mid,
            key,
            room_id: token.room_id,
            accepts: token.accepts,
            heartbeat: self.config.client_heartbeat_secs(),
        })
    }

    pub async fn disconnect(&self, req: DisconnectRequest) -> LogicResult<DisconnectReply> {
        let has = self.store.del_mapping(req.mid, &req.key, &req.server).await?;
        tracing::info!(
            mid = req.mid,
            key = %req.key,
            server = %req.server,
            has,
            "client disconnected"
        );
        Ok(DisconnectReply { has })
    }

    /// Stores the node's snapshot and answers with the last computed totals.
    pub async fn renew_online(&self, req: OnlineRequest) -> LogicResult<OnlineReply> {
        let snapshot = OnlineSnapshot {
            server: req.server,
            room_count: req.room_count,
            updated: unix_now(),
        };
        self.store.add_server_online(&snapshot).await?;
        Ok(OnlineReply {
            all_room_count: self.room_totals(),
        })
    }

    pub fn receive(&self, req: ReceiveRequest) {
        tracing::info!(
            mid = req.mid,
            op = req.proto.operation,
            seq = req.proto.sequence,
            body_len = req.proto.body.len(),
            "client message received"
        );
        metrics::counter!("courier_logic_received_total").increment(1);
    }

    pub fn room_totals(&self) -> HashMap<String, i32> {
        self.room_totals.read().clone()
    }

    /// Recomputes cluster room totals from live snapshots.
    pub async fn load_online(&self) -> LogicResult<HashMap<String, i32>> {
        let now = unix_now();
        let mut totals: HashMap<String, i32> = HashMap::new();
        let mut live = 0usize;
        for server in self.store.online_servers().await? {
            let Some(snapshot) = self.store.server_online(&server).await? else {
                continue;
            };
            if now.saturating_sub(snapshot.updated) > self.config.online_deadline_secs {
                tracing::info!(
                    server = %server,
                    updated = snapshot.updated,
                    "evicting stale online snapshot"
                );
                self.store.del_server_online(&server).await?;
                continue;
            }
            live += 1;
            for (room_id, count) in snapshot.room_count {
                *totals.entry(room_id).or_default() += count;
            }
        }
        metrics::gauge!("courier_logic_online_servers").set(live as f64);
        *self.room_totals.write() = totals.clone();
        Ok(totals)
    }

    async fn tick(&self) -> LogicResult<()> {
        self.load_online().await?;
        let purged = self.store.purge_expired().await?;
        if purged > 0 {
            tracing::debug!(purged, "expired session records dropped");
        }
        Ok(())
    }
}

/// Refreshes the cluster totals every `online_tick` until cancelled.
pub async fn run(logic: Arc<Logic>) {
    let mut interval = tokio::time::interval(logic.config().online_tick());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(err) = logic.tick().await {
            tracing::warn!(error = %err, "online tick failed");
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
