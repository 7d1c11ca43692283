// Request and reply bodies for the logic-tier RPC contract and the push RPC
// surface. Both tiers speak JSON over HTTP using these types and the route
// constants below.
use bytes::Bytes;
use courier_wire::{Proto, base64_bytes};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Route paths served by the logic tier.
pub mod logic_routes {
    pub const CONNECT: &str = "/v1/logic/connect";
    pub const DISCONNECT: &str = "/v1/logic/disconnect";
    pub const RENEW_ONLINE: &str = "/v1/logic/online";
    pub const RECEIVE: &str = "/v1/logic/receive";
    pub const SERVERS_BY_KEYS: &str = "/v1/logic/keys";
    pub const KEYS_BY_MIDS: &str = "/v1/logic/mids";
    pub const ROOM_TOTALS: &str = "/v1/logic/rooms";
}

/// Route paths served by the connect tier's push surface.
pub mod push_routes {
    pub const PUSH_KEYS: &str = "/v1/push/keys";
    pub const BROADCAST: &str = "/v1/push/broadcast";
    pub const BROADCAST_ROOM: &str = "/v1/push/room";
    pub const ROOMS: &str = "/v1/rooms";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub server: String,
    #[serde(default)]
    pub cookie: String,
    #[serde(with = "base64_bytes", default)]
    pub token: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectReply {
    pub mid: i64,
    pub key: String,
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub accepts: Vec<i32>,
    // Seconds; zero means "use the connect tier's default".
    #[serde(default)]
    pub heartbeat: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectRequest {
    pub server: String,
    pub mid: i64,
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectReply {
    pub has: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineRequest {
    pub server: String,
    #[serde(default)]
    pub room_count: HashMap<String, i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineReply {
    #[serde(default)]
    pub all_room_count: HashMap<String, i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveRequest {
    pub mid: i64,
    pub proto: Proto,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServersByKeysRequest {
    pub keys: Vec<String>,
}

/// Connect node holding each requested key; unknown keys are omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServersByKeysReply {
    pub servers: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysByMidsRequest {
    pub mids: Vec<i64>,
}

/// `key -> server` for every live connection of the requested members.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysByMidsReply {
    pub keys: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushKeysRequest {
    pub keys: Vec<String>,
    pub op: i32,
    pub proto: Proto,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastRequest {
    pub op: i32,
    pub proto: Proto,
    // Channels per second per bucket; zero disables pacing.
    #[serde(default)]
    pub speed: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastRoomRequest {
    pub room_id: String,
    pub op: i32,
    pub proto: Proto,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomsReply {
    pub rooms: BTreeSet<String>,
}

/// Empty acknowledgement body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}
