// Binary TCP listener.
// Several acceptor tasks share one listening socket; each accepted
// connection is tuned, framed with the proto codec and handed to the session.
use crate::config::ConnectConfig;
use crate::server::Server;
use crate::session::{self, Peer};
use anyhow::Result;
use courier_wire::ProtoCodec;
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};

const KEEPALIVE_TIME: Duration = Duration::from_secs(60);

/// Accepts connections until the returned future is dropped.
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
                tracing::warn!(error = %err, "tcp accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(server, stream, addr).await {
                tracing::info!(peer = %addr, error = %err, "tcp connection ended with error");
            }
        });
    }
}

async fn handle_connection(server: Arc<Server>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
    if let Err(err) = tune(&stream, server.config()) {
        tracing::debug!(peer = %addr, error = %err, "socket tuning failed");
    }
    let max_body_size = server.config().max_body_size;
    let (reader, writer) = stream.into_split();
    let frames = FramedRead::new(reader, ProtoCodec::new(max_body_size));
    let sink = FramedWrite::new(writer, ProtoCodec::new(max_body_size));
    let peer = Peer {
        ip: addr.ip().to_string(),
        cookie: String::new(),
        auth_attempts: 0,
        transport: "tcp",
    };
    session::serve(server, frames, sink, peer).await
}

fn tune(stream: &TcpStream, config: &ConnectConfig) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let socket = SockRef::from(stream);
    if config.tcp_sndbuf > 0 {
        socket.set_send_buffer_size(config.tcp_sndbuf)?;
    }
    if config.tcp_rcvbuf > 0 {
        socket.set_recv_buffer_size(config.tcp_rcvbuf)?;
    }
    if config.tcp_keepalive {
        socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_TIME))?;
    }
    Ok(())
}
