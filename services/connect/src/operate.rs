// Per-frame dispatch for authenticated connections.
// Room changes and subscriptions are handled locally; everything else is
// forwarded to the logic tier. The returned frame is the reply to queue.
use crate::server::Server;
use bytes::Bytes;
use courier_common::ReceiveRequest;
use courier_hub::{Bucket, Channel};
use courier_wire::{Proto, op};
use std::num::ParseIntError;
use std::sync::Arc;

pub async fn operate(
    server: &Server,
    bucket: &Bucket,
    channel: &Arc<Channel>,
    mut proto: Proto,
) -> Proto {
    match proto.operation {
        op::CHANGE_ROOM => {
            let room_id = String::from_utf8_lossy(&proto.body).into_owned();
            if let Err(err) = bucket.change_room(&room_id, channel) {
                tracing::error!(
                    key = %channel.key(),
                    room_id = %room_id,
                    error = %err,
                    "change room failed"
                );
            }
            proto.operation = op::CHANGE_ROOM_REPLY;
        }
        op::SUB => {
            match parse_ops(&proto.body) {
                Ok(ops) => channel.watch(&ops),
                Err(err) => {
                    tracing::debug!(key = %channel.key(), error = %err, "malformed subscribe list");
                }
            }
            proto.operation = op::SUB_REPLY;
        }
        op::UNSUB => {
            match parse_ops(&proto.body) {
                Ok(ops) => channel.unwatch(&ops),
                Err(err) => {
                    tracing::debug!(
                        key = %channel.key(),
                        error = %err,
                        "malformed unsubscribe list"
                    );
                }
            }
            proto.operation = op::UNSUB_REPLY;
        }
        _ => {
            let request = ReceiveRequest {
                mid: channel.mid(),
                proto: proto.clone(),
            };
            if let Err(err) = server.logic().receive(request).await {
                tracing::error!(
                    mid = channel.mid(),
                    op = proto.operation,
                    error = %err,
                    "forward to logic failed"
                );
            }
            proto.operation = op::SEND_MSG_REPLY;
            proto.body = Bytes::new();
        }
    }
    proto
}

/// Parses a comma-separated operation list such as `"1000,1001"`.
pub fn parse_ops(body: &[u8]) -> Result<Vec<i32>, ParseIntError> {
    let text = String::from_utf8_lossy(body);
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    text.split(',').map(|part| part.trim().parse::<i32>()).collect()
}
