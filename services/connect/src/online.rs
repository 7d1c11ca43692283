// Online-count renew loop.
// Reports this node's per-room member counts to the logic tier and installs
// the cluster-wide totals it returns, so heartbeat replies show room size
// across every connect node.
use crate::server::Server;
use anyhow::{Context, Result};
use courier_common::OnlineRequest;
use std::sync::Arc;

/// One report/reconcile round. Returns how many rooms the cluster reported.
pub async fn renew_once(server: &Server) -> Result<usize> {
    let request = OnlineRequest {
        server: server.id().to_string(),
        room_count: server.room_counts(),
    };
    let reply = server
        .logic()
        .renew_online(request)
        .await
        .context("renew online")?;
    server.update_room_counts(&reply.all_room_count);
    Ok(reply.all_room_count.len())
}

/// Runs forever; failures are retried after the shorter retry delay.
pub async fn run(server: Arc<Server>) {
    let interval = server.config().online_interval();
    let retry = server.config().online_retry();
    loop {
        let delay = match renew_once(&server).await {
            Ok(rooms) => {
                tracing::debug!(rooms, "online counts renewed");
                interval
            }
            Err(err) => {
                metrics::counter!("courier_online_renew_failures_total").increment(1);
                tracing::warn!(error = %err, "online renew failed");
                retry
            }
        };
        tokio::time::sleep(delay).await;
    }
}
