//! Push API consumed by the job tier.
//!
//! Targeted pushes and room broadcasts are applied before the response is
//! sent; a full broadcast is started in the background and acknowledged
//! immediately because pacing can stretch it over many seconds.
use crate::error::{ApiError, api_overloaded, api_validation_error};
use crate::server::Server;
use axum::extract::State;
use axum::{Json, Router};
use courier_common::{
    Ack, BroadcastRequest, BroadcastRoomRequest, PushKeysRequest, RoomsReply, push_routes,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn build_router(server: Arc<Server>) -> Router {
    Router::new()
        .route(push_routes::PUSH_KEYS, axum::routing::post(push_keys))
        .route(push_routes::BROADCAST, axum::routing::post(broadcast))
        .route(push_routes::BROADCAST_ROOM, axum::routing::post(broadcast_room))
        .route(push_routes::ROOMS, axum::routing::get(rooms))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

async fn push_keys(
    State(server): State<Arc<Server>>,
    Json(req): Json<PushKeysRequest>,
) -> Result<Json<Ack>, ApiError> {
    if req.keys.is_empty() {
        return Err(api_validation_error("keys must not be empty"));
    }
    let delivered = server.push_keys(&req.keys, req.op, &req.proto);
    tracing::debug!(op = req.op, keys = req.keys.len(), delivered, "push keys");
    Ok(Json(Ack {}))
}

async fn broadcast(
    State(server): State<Arc<Server>>,
    Json(req): Json<BroadcastRequest>,
) -> Json<Ack> {
    tokio::spawn(async move {
        server.broadcast(&req.proto, req.op, req.speed).await;
    });
    Json(Ack {})
}

async fn broadcast_room(
    State(server): State<Arc<Server>>,
    Json(req): Json<BroadcastRoomRequest>,
) -> Result<Json<Ack>, ApiError> {
    if req.room_id.is_empty() {
        return Err(api_validation_error("room_id must not be empty"));
    }
    let refused = server.broadcast_room(&req.room_id, &req.proto);
    if refused == server.buckets().len() {
        return Err(api_overloaded("room broadcast queues are full"));
    }
    Ok(Json(Ack {}))
}

async fn rooms(State(server): State<Arc<Server>>) -> Json<RoomsReply> {
    Json(RoomsReply {
        rooms: server.rooms(),
    })
}
