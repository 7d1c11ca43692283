// WebSocket listener.
// Frames travel as JSON text messages carrying the same proto fields as the
// binary form. The upgrade request's Cookie header is passed to the logic
// tier with the auth token.
use crate::server::Server;
use crate::session::{self, Peer};
use anyhow::{Context, Result};
use courier_wire::Proto;
use futures::{SinkExt, StreamExt, future};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::{self, Message};

#[derive(Debug, thiserror::Error)]
pub enum WsError {
    #[error("websocket transport: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error(transparent)]
    Codec(#[from] courier_wire::Error),
}

/// Accepts upgrades until the returned future is dropped.
pub async fn serve(server: Arc<Server>, listener: TcpListener) -> Result<()> {
    let listener = Arc::new(listener);
    let mut acceptors = JoinSet::new();
    for _ in 0..server.config().acceptors() {
        acceptors.spawn(accept_loop(Arc::clone(&server), Arc::clone(&listener)));
    }
    while acceptors.join_next().await.is_some() {}
    Ok(())
}

async fn accept_loop(server: Arc<Server>, listener: Arc<TcpListener>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(error = %err, "websocket accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(server, stream, addr).await {
                tracing::info!(peer = %addr, error = %err, "websocket connection ended with error");
            }
        });
    }
}

async fn handle_connection(
    server: Arc<Server>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let mut cookie = String::new();
    let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        cookie = req
            .headers()
            .get(COOKIE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Ok(response)
    };
    let upgrade = tokio_tungstenite::accept_hdr_async(stream, callback);
    let ws = tokio::time::timeout(server.config().handshake_timeout(), upgrade)
        .await
        .context("websocket upgrade timed out")?
        .context("websocket upgrade")?;

    let (sink, messages) = ws.split();
    let frames = messages
        .take_while(|message| future::ready(!matches!(message, Ok(Message::Close(_)))))
        .filter_map(|message| future::ready(decode_message(message)));
    let sink = sink.with(|proto: Proto| future::ready(encode_message(&proto)));
    let peer = Peer {
        ip: addr.ip().to_string(),
        cookie,
        auth_attempts: server.config().auth_attempts,
        transport: "websocket",
    };
    session::serve(server, frames, sink, peer).await
}

/// Maps one websocket message to a frame; control messages yield nothing.
fn decode_message(
    message: std::result::Result<Message, tungstenite::Error>,
) -> Option<std::result::Result<Proto, WsError>> {
    match message {
        Ok(Message::Text(text)) => Some(Proto::from_json(text.as_bytes()).map_err(WsError::from)),
        Ok(Message::Binary(data)) => Some(Proto::from_json(&data).map_err(WsError::from)),
        Ok(_) => None,
        Err(err) => Some(Err(WsError::from(err))),
    }
}

fn encode_message(proto: &Proto) -> std::result::Result<Message, WsError> {
    Ok(Message::Text(proto.to_json()?))
}
