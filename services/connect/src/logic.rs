// Client for the logic tier.
// Sessions authenticate, report disconnects and forward user frames through
// this trait; the online renew loop uses it to reconcile room counts.
use anyhow::{Context, Result};
use async_trait::async_trait;
use courier_common::{
    Ack, ConnectReply, ConnectRequest, DisconnectReply, DisconnectRequest, OnlineReply,
    OnlineRequest, ReceiveRequest, logic_routes,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

#[async_trait]
pub trait LogicClient: Send + Sync {
    async fn connect(&self, req: ConnectRequest) -> Result<ConnectReply>;
    async fn disconnect(&self, req: DisconnectRequest) -> Result<DisconnectReply>;
    async fn renew_online(&self, req: OnlineRequest) -> Result<OnlineReply>;
    async fn receive(&self, req: ReceiveRequest) -> Result<()>;
}

/// JSON-over-HTTP logic client.
#[derive(Debug, Clone)]
pub struct HttpLogicClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpLogicClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build logic http client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    async fn call<Req, Resp>(&self, route: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), route);
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("{route} request"))?
            .error_for_status()
            .with_context(|| format!("{route} status"))?;
        response
            .json()
            .await
            .with_context(|| format!("{route} body"))
    }
}

#[async_trait]
impl LogicClient for HttpLogicClient {
    async fn connect(&self, req: ConnectRequest) -> Result<ConnectReply> {
        self.call(logic_routes::CONNECT, &req).await
    }

    async fn disconnect(&self, req: DisconnectRequest) -> Result<DisconnectReply> {
        self.call(logic_routes::DISCONNECT, &req).await
    }

    async fn renew_online(&self, req: OnlineRequest) -> Result<OnlineReply> {
        self.call(logic_routes::RENEW_ONLINE, &req).await
    }

    async fn receive(&self, req: ReceiveRequest) -> Result<()> {
        let _: Ack = self.call(logic_routes::RECEIVE, &req).await?;
        Ok(())
    }
}
