// Logic HTTP API: the RPC contract connect nodes call, plus the session
// lookups a job tier uses to route pushes.
use crate::error::{ApiError, api_validation_error};
use crate::service::Logic;
use axum::extract::State;
use axum::{Json, Router};
use courier_common::{
    Ack, ConnectReply, ConnectRequest, DisconnectReply, DisconnectRequest, KeysByMidsReply,
    KeysByMidsRequest, OnlineReply, OnlineRequest, ReceiveRequest, ServersByKeysReply,
    ServersByKeysRequest, logic_routes,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn build_router(logic: Arc<Logic>) -> Router {
    Router::new()
        .route(logic_routes::CONNECT, axum::routing::post(connect))
        .route(logic_routes::DISCONNECT, axum::routing::post(disconnect))
        .route(logic_routes::RENEW_ONLINE, axum::routing::post(renew_online))
        .route(logic_routes::RECEIVE, axum::routing::post(receive))
        .route(logic_routes::SERVERS_BY_KEYS, axum::routing::post(servers_by_keys))
        .route(logic_routes::KEYS_BY_MIDS, axum::routing::post(keys_by_mids))
        .route(logic_routes::ROOM_TOTALS, axum::routing::get(room_totals))
        .layer(TraceLayer::new_for_http())
        .with_state(logic)
}

async fn connect(
    State(logic): State<Arc<Logic>>,
    Json(req): Json<ConnectRequest>,
) -> Result<Json<ConnectReply>, ApiError> {
    if req.server.is_empty() {
        return Err(api_validation_error("server must not be empty"));
    }
    let reply = logic.connect(req).await.inspect_err(|err| {
        metrics::counter!("courier_logic_connect_rejected_total").increment(1);
        tracing::info!(error = %err, "connect rejected");
    })?;
    Ok(Json(reply))
}

async fn disconnect(
    State(logic): State<Arc<Logic>>,
    Json(req): Json<DisconnectRequest>,
) -> Result<Json<DisconnectReply>, ApiError> {
    Ok(Json(logic.disconnect(req).await?))
}

async fn renew_online(
    State(logic): State<Arc<Logic>>,
    Json(req): Json<OnlineRequest>,
) -> Result<Json<OnlineReply>, ApiError> {
    if req.server.is_empty() {
        return Err(api_validation_error("server must not be empty"));
    }
    Ok(Json(logic.renew_online(req).await?))
}

async fn receive(State(logic): State<Arc<Logic>>, Json(req): Json<ReceiveRequest>) -> Json<Ack> {
    logic.receive(req);
    Json(Ack {})
}

async fn servers_by_keys(
    State(logic): State<Arc<Logic>>,
    Json(req): Json<ServersByKeysRequest>,
) -> Result<Json<ServersByKeysReply>, ApiError> {
    let found = logic.store().servers_by_keys(&req.keys).await?;
    let servers = req
        .keys
        .into_iter()
        .zip(found)
        .filter_map(|(key, server)| server.map(|server| (key, server)))
        .collect();
    Ok(Json(ServersByKeysReply { servers }))
}

async fn keys_by_mids(
    State(logic): State<Arc<Logic>>,
    Json(req): Json<KeysByMidsRequest>,
) -> Result<Json<KeysByMidsReply>, ApiError> {
    let keys = logic.store().keys_by_mids(&req.mids).await?;
    Ok(Json(KeysByMidsReply { keys }))
}

async fn room_totals(State(logic): State<Arc<Logic>>) -> Json<OnlineReply> {
    Json(OnlineReply {
        all_room_count: logic.room_totals(),
    })
}
