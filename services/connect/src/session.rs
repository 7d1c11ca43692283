// Transport-independent connection lifecycle.
// TCP and WebSocket listeners hand a decoded frame stream and an encoding
// sink to `serve`, which authenticates, registers the channel and runs the
// read and write pumps until either side stops.
use crate::operate::operate;
use crate::server::Server;
use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use courier_common::{ConnectReply, ConnectRequest, DisconnectRequest};
use courier_hub::{Bucket, Channel, ChannelReceiver, Identity, Signal};
use courier_wire::{Proto, op};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;

/// Per-connection facts gathered by the listener before the handshake.
#[derive(Debug, Clone, Default)]
pub struct Peer {
    pub ip: String,
    pub cookie: String,
    // Non-auth frames tolerated before the handshake fails; zero means no limit.
    pub auth_attempts: usize,
    pub transport: &'static str,
}

/// Runs one connection to completion.
pub async fn serve<S, K, E, W>(
    server: Arc<Server>,
    mut stream: S,
    mut sink: K,
    peer: Peer,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<Proto, E>> + Unpin + Send,
    K: Sink<Proto, Error = W> + Unpin + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
    W: std::error::Error + Send + Sync + 'static,
{
    let (auth, reply) = match handshake(&server, &mut stream, &peer).await {
        Ok(found) => found,
        Err(err) => {
            metrics::counter!("courier_auth_failures_total").increment(1);
            let _ = sink.close().await;
            return Err(err);
        }
    };
    sink.send(Proto::new(op::AUTH_REPLY, auth.sequence, Bytes::new()))
        .await
        .context("write auth reply")?;

    let identity = Identity {
        key: reply.key.clone(),
        mid: reply.mid,
        ip: peer.ip.clone(),
    };
    let (channel, receiver) = Channel::new(identity, server.config().channel_capacity);
    channel.watch(&reply.accepts);
    let bucket = Arc::clone(server.bucket(&reply.key));
    if let Err(err) = bucket.put(&reply.room_id, &channel) {
        tracing::warn!(key = %reply.key, ip = %peer.ip, error = %err, "register channel failed");
        disconnect(&server, &channel).await;
        let _ = sink.close().await;
        return Err(anyhow!(err).context("register channel"));
    }
    metrics::gauge!("courier_connections_online").increment(1.0);
    tracing::info!(
        transport = peer.transport,
        key = %reply.key,
        mid = reply.mid,
        room_id = %reply.room_id,
        "connection authenticated"
    );

    let mut writer = tokio::spawn(write_pump(sink, receiver, Arc::clone(&channel)));
    let mut writer_done = false;
    let read_timeout = server.config().read_timeout(reply.heartbeat);
    loop {
        tokio::select! {
            next = tokio::time::timeout(read_timeout, stream.next()) => {
                let proto = match next {
                    Ok(Some(Ok(proto))) => proto,
                    Ok(Some(Err(err))) => {
                        tracing::debug!(key = %channel.key(), error = %err, "read failed");
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        tracing::debug!(key = %channel.key(), "heartbeat timeout");
                        break;
                    }
                };
                if !read_frame(&server, &bucket, &channel, proto).await {
                    break;
                }
            }
            _ = &mut writer => {
                writer_done = true;
                break;
            }
        }
    }

    // Teardown runs once, from this task only.
    bucket.remove(&channel);
    channel.signal_close();
    if !writer_done {
        let _ = writer.await;
    }
    metrics::gauge!("courier_connections_online").decrement(1.0);
    disconnect(&server, &channel).await;
    tracing::debug!(key = %channel.key(), mid = channel.mid(), "connection closed");
    Ok(())
}

/// Waits for the auth frame and resolves it through the logic tier.
async fn handshake<S, E>(
    server: &Server,
    stream: &mut S,
    peer: &Peer,
) -> Result<(Proto, ConnectReply)>
where
    S: Stream<Item = std::result::Result<Proto, E>> + Unpin + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    let auth = tokio::time::timeout(
        server.config().handshake_timeout(),
        wait_for_auth(stream, peer.auth_attempts),
    )
    .await
    .map_err(|_| anyhow!("handshake timed out"))??;
    let reply = server
        .logic()
        .connect(ConnectRequest {
            server: server.id().to_string(),
            cookie: peer.cookie.clone(),
            token: auth.body.clone(),
        })
        .await
        .context("logic connect")?;
    if reply.key.is_empty() {
        bail!("logic connect returned an empty key");
    }
    Ok((auth, reply))
}

async fn wait_for_auth<S, E>(stream: &mut S, attempts: usize) -> Result<Proto>
where
    S: Stream<Item = std::result::Result<Proto, E>> + Unpin + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut skipped = 0;
    loop {
        let proto = match stream.next().await {
            Some(frame) => frame.context("read auth frame")?,
            None => bail!("connection closed before auth"),
        };
        if proto.operation == op::AUTH {
            return Ok(proto);
        }
        skipped += 1;
        tracing::warn!(op = proto.operation, "expected auth frame");
        if attempts > 0 && skipped >= attempts {
            bail!("no auth frame after {skipped} attempts");
        }
    }
}

/// Handles one inbound frame. Returns false once the channel can no longer take replies.
async fn read_frame(
    server: &Server,
    bucket: &Bucket,
    channel: &Arc<Channel>,
    proto: Proto,
) -> bool {
    let reply = if proto.operation == op::HEARTBEAT {
        let online = channel.room().map(|room| room.online_count()).unwrap_or(0);
        proto.heartbeat_reply(online)
    } else {
        operate(server, bucket, channel, proto).await
    };
    match channel.push(reply) {
        Ok(()) => true,
        Err(courier_hub::HubError::QueueFull) => {
            tracing::debug!(key = %channel.key(), "reply dropped, queue full");
            true
        }
        Err(err) => {
            tracing::debug!(key = %channel.key(), error = %err, "channel closed");
            false
        }
    }
}

async fn write_pump<K, W>(mut sink: K, mut receiver: ChannelReceiver, channel: Arc<Channel>)
where
    K: Sink<Proto, Error = W> + Unpin,
    W: std::error::Error,
{
    loop {
        let proto = match receiver.ready().await {
            Signal::Proto(proto) => proto,
            Signal::Finish => {
                let _ = sink.close().await;
                return;
            }
        };
        if let Err(err) = sink.send(proto).await {
            tracing::debug!(key = %channel.key(), error = %err, "write failed");
            break;
        }
    }
    // Stop producers, then discard whatever is still queued.
    channel.signal_close();
    receiver.drain_until_finish().await;
}

async fn disconnect(server: &Server, channel: &Channel) {
    let request = DisconnectRequest {
        server: server.id().to_string(),
        mid: channel.mid(),
        key: channel.key().to_string(),
    };
    if let Err(err) = server.logic().disconnect(request).await {
        tracing::error!(
            key = %channel.key(),
            mid = channel.mid(),
            error = %err,
            "logic disconnect failed"
        );
    }
}
