// Connect tier entry point.
mod observability;

use anyhow::{Context, Result};
use connect::config::ConnectConfig;
use connect::logic::HttpLogicClient;
use connect::server::Server;
use connect::{online, push, tcp, ws};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ConnectConfig::from_env_or_yaml()?;
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

async fn run_with_shutdown<F>(config: ConnectConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("courier-connect")?;
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    let metrics_bind = config.metrics_bind;
    tasks.push(tokio::spawn(async move {
        if let Err(err) = observability::serve_metrics(metrics_handle, metrics_bind).await {
            tracing::warn!(error = %err, "metrics server exited");
        }
    }));

    let logic = HttpLogicClient::new(config.logic_url.clone(), config.rpc_timeout())?;
    let server = Server::new(config.clone(), Arc::new(logic));
    tracing::info!(
        server_id = %server.id(),
        buckets = server.buckets().len(),
        logic_url = %config.logic_url,
        "connect tier starting"
    );

    for addr in &config.tcp_binds {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind tcp listener {addr}"))?;
        tracing::info!(addr = %listener.local_addr()?, "tcp listener started");
        let server = Arc::clone(&server);
        tasks.push(tokio::spawn(async move {
            if let Err(err) = tcp::serve(server, listener).await {
                tracing::warn!(error = %err, "tcp accept loop exited");
            }
        }));
    }
    for addr in &config.ws_binds {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind websocket listener {addr}"))?;
        tracing::info!(addr = %listener.local_addr()?, "websocket listener started");
        let server = Arc::clone(&server);
        tasks.push(tokio::spawn(async move {
            if let Err(err) = ws::serve(server, listener).await {
                tracing::warn!(error = %err, "websocket accept loop exited");
            }
        }));
    }

    let push_listener = TcpListener::bind(config.push_bind)
        .await
        .context("bind push api listener")?;
    tracing::info!(addr = %push_listener.local_addr()?, "push api listening");
    let app = push::build_router(Arc::clone(&server));
    tasks.push(tokio::spawn(async move {
        if let Err(err) = axum::serve(push_listener, app.into_make_service()).await {
            tracing::warn!(error = %err, "push api exited");
        }
    }));

    tasks.push(tokio::spawn(online::run(Arc::clone(&server))));

    shutdown.await;
    for task in &tasks {
        task.abort();
    }
    for task in tasks {
        let _ = task.await;
    }
    tracing::info!(channels = server.channel_count(), "connect tier stopped");
    Ok(())
}
