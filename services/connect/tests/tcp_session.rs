mod common;

use bytes::{Bytes, BytesMut};
use common::{FakeLogic, eventually, server, start_tcp};
use courier_wire::{MAX_BODY_SIZE, Proto, ProtoCodec, op};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

type Client = Framed<TcpStream, ProtoCodec>;

async fn dial(addr: std::net::SocketAddr) -> Client {
    let stream = TcpStream::connect(addr).await.expect("connect");
    Framed::new(stream, ProtoCodec::new(MAX_BODY_SIZE))
}

async fn recv(client: &mut Client) -> Option<Proto> {
    tokio::time::timeout(Duration::from_secs(2), client.next())
        .await
        .expect("frame in time")
        .map(|frame| frame.expect("decode"))
}

async fn auth(client: &mut Client, token: &'static str) -> Proto {
    client
        .send(Proto::new(op::AUTH, 1, Bytes::from_static(token.as_bytes())))
        .await
        .expect("send auth");
    recv(client).await.expect("auth reply")
}

#[tokio::test]
async fn tcp_session_end_to_end() {
    let logic = Arc::new(FakeLogic::default());
    let server = server(Arc::clone(&logic));
    let addr = start_tcp(&server).await;
    let mut client = dial(addr).await;

    let reply = auth(&mut client, "alice|live://7|1000").await;
    assert_eq!(reply.operation, op::AUTH_REPLY);
    assert!(server.rooms().contains("live://7"));

    client
        .send(Proto::new(op::HEARTBEAT, 2, Bytes::new()))
        .await
        .expect("heartbeat");
    let reply = recv(&mut client).await.expect("heartbeat reply");
    assert_eq!(reply.operation, op::HEARTBEAT_REPLY);
    assert_eq!(reply.body, Bytes::from_static(b"1"));

    client
        .send(Proto::new(op::SEND_MSG, 3, Bytes::from_static(b"hello")))
        .await
        .expect("send msg");
    let reply = recv(&mut client).await.expect("send reply");
    assert_eq!(reply.operation, op::SEND_MSG_REPLY);
    assert_eq!(reply.sequence, 3);
    assert_eq!(logic.received.lock()[0].proto.body, Bytes::from_static(b"hello"));

    let pushed = Proto::new(1000, 0, Bytes::from_static(b"news"));
    assert_eq!(server.push_keys(&["alice".to_string()], 1000, &pushed), 1);
    assert_eq!(recv(&mut client).await, Some(pushed));

    drop(client);
    assert!(eventually(|| server.channel_count() == 0).await);
    assert!(eventually(|| logic.disconnects.lock().len() == 1).await);
    assert!(server.rooms().is_empty());
}

#[tokio::test]
async fn oversized_frame_closes_connection() {
    let server = server(Arc::new(FakeLogic::default()));
    let addr = start_tcp(&server).await;
    let mut client = dial(addr).await;
    auth(&mut client, "bob|live://1").await;

    let mut raw = BytesMut::new();
    Proto::new(op::SEND_MSG, 2, Bytes::from(vec![0u8; MAX_BODY_SIZE + 1])).encode(&mut raw);
    client.get_mut().write_all(&raw).await.expect("write");
    assert_eq!(recv(&mut client).await, None);
    assert!(eventually(|| server.channel_count() == 0).await);
}

#[tokio::test]
async fn rejected_token_closes_without_reply() {
    let logic = Arc::new(FakeLogic::default());
    let server = server(Arc::clone(&logic));
    let addr = start_tcp(&server).await;
    let mut client = dial(addr).await;

    client
        .send(Proto::new(op::AUTH, 1, Bytes::from_static(b"deny")))
        .await
        .expect("send auth");
    assert_eq!(recv(&mut client).await, None);
    assert_eq!(server.channel_count(), 0);
}

#[tokio::test]
async fn second_login_with_same_key_replaces_first() {
    let server = server(Arc::new(FakeLogic::default()));
    let addr = start_tcp(&server).await;
    let mut first = dial(addr).await;
    auth(&mut first, "carol|live://2").await;
    let mut second = dial(addr).await;
    auth(&mut second, "carol|live://2").await;

    assert_eq!(recv(&mut first).await, None);
    assert!(eventually(|| server.channel_count() == 1).await);
    assert_eq!(server.room_counts().get("live://2"), Some(&1));

    second
        .send(Proto::new(op::HEARTBEAT, 9, Bytes::new()))
        .await
        .expect("heartbeat");
    assert_eq!(
        recv(&mut second).await.map(|p| p.operation),
        Some(op::HEARTBEAT_REPLY)
    );
}
