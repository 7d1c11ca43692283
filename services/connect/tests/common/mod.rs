#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use connect::config::ConnectConfig;
use connect::logic::LogicClient;
use connect::server::Server;
use courier_common::{
    ConnectReply, ConnectRequest, DisconnectReply, DisconnectRequest, OnlineReply, OnlineRequest,
    ReceiveRequest,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Logic tier stand-in. Tokens look like `key|room|op,op`; `deny` is refused.
#[derive(Default)]
pub struct FakeLogic {
    pub cookies: Mutex<Vec<String>>,
    pub disconnects: Mutex<Vec<String>>,
    pub received: Mutex<Vec<ReceiveRequest>>,
}

#[async_trait]
impl LogicClient for FakeLogic {
    async fn connect(&self, req: ConnectRequest) -> Result<ConnectReply> {
        let token = String::from_utf8_lossy(&req.token).into_owned();
        if token == "deny" {
            anyhow::bail!("token rejected");
        }
        self.cookies.lock().push(req.cookie);
        let mut parts = token.split('|');
        let key = parts.next().unwrap_or_default().to_string();
        let room_id = parts.next().unwrap_or_default().to_string();
        let accepts = parts
            .next()
            .map(|ops| ops.split(',').filter_map(|op| op.parse().ok()).collect())
            .unwrap_or_default();
        Ok(ConnectReply {
            mid: 100,
            key,
            room_id,
            accepts,
            heartbeat: 0,
        })
    }

    async fn disconnect(&self, req: DisconnectRequest) -> Result<DisconnectReply> {
        self.disconnects.lock().push(req.key);
        Ok(DisconnectReply { has: true })
    }

    async fn renew_online(&self, _req: OnlineRequest) -> Result<OnlineReply> {
        Ok(OnlineReply::default())
    }

    async fn receive(&self, req: ReceiveRequest) -> Result<()> {
        self.received.lock().push(req);
        Ok(())
    }
}

pub fn server(logic: Arc<FakeLogic>) -> Arc<Server> {
    let mut config = ConnectConfig {
        server_id: "node-it".to_string(),
        accept_tasks: 2,
        auth_attempts: 3,
        handshake_timeout_ms: 1_000,
        ..ConnectConfig::default()
    };
    config.bucket.size = 4;
    config.bucket.routine_amount = 2;
    Server::new(config, logic)
}

pub async fn start_tcp(server: &Arc<Server>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(connect::tcp::serve(Arc::clone(server), listener));
    addr
}

pub async fn start_ws(server: &Arc<Server>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(connect::ws::serve(Arc::clone(server), listener));
    addr
}

pub async fn start_push(server: &Arc<Server>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = connect::push::build_router(Arc::clone(server));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service()).await;
    });
    format!("http://{addr}")
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
