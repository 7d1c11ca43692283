#![allow(dead_code)]

use logic::api::build_router;
use logic::config::LogicConfig;
use logic::service::Logic;
use logic::store::memory::MemoryStore;
use std::sync::Arc;
use tokio::net::TcpListener;

pub fn logic(config: LogicConfig) -> Arc<Logic> {
    let store = Arc::new(MemoryStore::new(config.mapping_expiry()));
    Arc::new(Logic::new(config, store))
}

/// Serves the API for `logic` on an ephemeral port; returns the base URL.
pub async fn start_api(logic: Arc<Logic>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = build_router(logic);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service()).await;
    });
    format!("http://{addr}")
}

pub fn token(json: &str) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(json)
}
