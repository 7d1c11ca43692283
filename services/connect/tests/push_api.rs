mod common;

use bytes::Bytes;
use common::{FakeLogic, server, start_push, start_tcp};
use courier_common::{
    BroadcastRequest, BroadcastRoomRequest, ErrorResponse, PushKeysRequest, RoomsReply,
    push_routes,
};
use courier_wire::{MAX_BODY_SIZE, Proto, ProtoCodec, op};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

type Client = Framed<TcpStream, ProtoCodec>;

async fn login(addr: std::net::SocketAddr, token: &'static str) -> Client {
    let stream = TcpStream::connect(addr).await.expect("connect");
    let mut client = Framed::new(stream, ProtoCodec::new(MAX_BODY_SIZE));
    client
        .send(Proto::new(op::AUTH, 1, Bytes::from_static(token.as_bytes())))
        .await
        .expect("auth");
    let reply = next(&mut client).await.expect("auth reply");
    assert_eq!(reply.operation, op::AUTH_REPLY);
    client
}

async fn next(client: &mut Client) -> Option<Proto> {
    tokio::time::timeout(Duration::from_secs(2), client.next())
        .await
        .ok()
        .flatten()
        .map(|frame| frame.expect("decode"))
}

async fn quiet(client: &mut Client) -> bool {
    tokio::time::timeout(Duration::from_millis(150), client.next())
        .await
        .is_err()
}

#[tokio::test]
async fn push_surface_reaches_tcp_clients() {
    let server = server(Arc::new(FakeLogic::default()));
    let tcp = start_tcp(&server).await;
    let base = start_push(&server).await;
    let http = reqwest::Client::new();

    let mut a = login(tcp, "A|room-1|42").await;
    let mut b = login(tcp, "B|room-1").await;
    let mut c = login(tcp, "C|room-2|42").await;

    // Targeted push only reaches watchers of the operation.
    let frame = Proto::new(42, 0, Bytes::from_static(b"direct"));
    let response = http
        .post(format!("{base}{}", push_routes::PUSH_KEYS))
        .json(&PushKeysRequest {
            keys: vec!["A".to_string(), "B".to_string()],
            op: 42,
            proto: frame.clone(),
        })
        .send()
        .await
        .expect("push keys");
    assert!(response.status().is_success());
    assert_eq!(next(&mut a).await, Some(frame));
    assert!(quiet(&mut b).await);

    // Room broadcast ignores watch sets.
    let frame = Proto::new(op::RAW, 0, Bytes::from_static(b"room"));
    http.post(format!("{base}{}", push_routes::BROADCAST_ROOM))
        .json(&BroadcastRoomRequest {
            room_id: "room-1".to_string(),
            op: op::RAW,
            proto: frame.clone(),
        })
        .send()
        .await
        .expect("broadcast room")
        .error_for_status()
        .expect("ok");
    assert_eq!(next(&mut a).await, Some(frame.clone()));
    assert_eq!(next(&mut b).await, Some(frame));
    assert!(quiet(&mut c).await);

    // Global broadcast filters on the watch set.
    let frame = Proto::new(42, 0, Bytes::from_static(b"everyone"));
    http.post(format!("{base}{}", push_routes::BROADCAST))
        .json(&BroadcastRequest {
            op: 42,
            proto: frame.clone(),
            speed: 0,
        })
        .send()
        .await
        .expect("broadcast")
        .error_for_status()
        .expect("ok");
    assert_eq!(next(&mut a).await, Some(frame.clone()));
    assert_eq!(next(&mut c).await, Some(frame));
    assert!(quiet(&mut b).await);

    let rooms: RoomsReply = http
        .get(format!("{base}{}", push_routes::ROOMS))
        .send()
        .await
        .expect("rooms")
        .json()
        .await
        .expect("rooms body");
    assert_eq!(
        rooms.rooms.into_iter().collect::<Vec<_>>(),
        vec!["room-1".to_string(), "room-2".to_string()]
    );
}

#[tokio::test]
async fn push_surface_validates_requests() {
    let server = server(Arc::new(FakeLogic::default()));
    let base = start_push(&server).await;
    let response = reqwest::Client::new()
        .post(format!("{base}{}", push_routes::PUSH_KEYS))
        .json(&PushKeysRequest {
            keys: Vec::new(),
            op: 1,
            proto: Proto::default(),
        })
        .send()
        .await
        .expect("push keys");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: ErrorResponse = response.json().await.expect("error body");
    assert_eq!(body.code, "validation_error");
}
