// Logic tier entry point.
mod observability;

use anyhow::{Context, Result};
use logic::api;
use logic::config::LogicConfig;
use logic::service::{self, Logic};
use logic::store::memory::MemoryStore;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    let config = LogicConfig::from_env_or_yaml()?;
    run_with_shutdown(config, shutdown_signal()).await
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run_with_shutdown<F>(config: LogicConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("courier-logic")?;
    let metrics_bind = config.metrics_bind;
    let metrics_task = tokio::spawn(async move {
        if let Err(err) = observability::serve_metrics(metrics_handle, metrics_bind).await {
            tracing::warn!(error = %err, "metrics server exited");
        }
    });

    let listener = TcpListener::bind(config.bind)
        .await
        .context("bind logic api listener")?;
    tracing::info!(addr = %listener.local_addr()?, "logic api listening");

    let store = Arc::new(MemoryStore::new(config.mapping_expiry()));
    let logic = Arc::new(Logic::new(config.clone(), store));
    let online_task = tokio::spawn(service::run(Arc::clone(&logic)));
    let app = api::build_router(logic);
    let result = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .context("serve logic api");

    online_task.abort();
    metrics_task.abort();
    tracing::info!("logic tier stopped");
    result
}
