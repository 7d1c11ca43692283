// Wire format for the client-facing Proto message.
// Raw TCP connections carry a fixed 16-byte big-endian header followed by the
// body; WebSocket connections carry the same fields as a JSON text frame.
use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

pub const VERSION: u16 = 1;
/// Default cap on the body of a single frame.
pub const MAX_BODY_SIZE: usize = 1 << 12;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("package too large: body {body_len} exceeds max {max_body_size}")]
    PackageTooLarge {
        body_len: usize,
        max_body_size: usize,
    },
    #[error("header length error: {0}")]
    HeaderLengthError(u16),
    #[error("package length {0} is shorter than the header")]
    PackageTooShort(u32),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize proto")]
    Serialize(serde_json::Error),
    #[error("failed to deserialize proto")]
    Deserialize(serde_json::Error),
}

/// Operation codes understood by the connect tier.
pub mod op {
    pub const HANDSHAKE: i32 = 0;
    pub const HANDSHAKE_REPLY: i32 = 1;
    pub const HEARTBEAT: i32 = 2;
    pub const HEARTBEAT_REPLY: i32 = 3;
    pub const SEND_MSG: i32 = 4;
    pub const SEND_MSG_REPLY: i32 = 5;
    pub const DISCONNECT_REPLY: i32 = 6;
    pub const AUTH: i32 = 7;
    pub const AUTH_REPLY: i32 = 8;
    pub const RAW: i32 = 9;
    // Queue sentinels; never written to a socket.
    pub const PROTO_READY: i32 = 10;
    pub const PROTO_FINISH: i32 = 11;
    pub const CHANGE_ROOM: i32 = 12;
    pub const CHANGE_ROOM_REPLY: i32 = 13;
    pub const SUB: i32 = 14;
    pub const SUB_REPLY: i32 = 15;
    pub const UNSUB: i32 = 16;
    pub const UNSUB_REPLY: i32 = 17;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub package_len: u32,
    pub header_len: u16,
    pub version: u16,
    pub operation: i32,
    pub sequence: i32,
}

impl FrameHeader {
    pub const LEN: usize = 16;

    pub fn encode(&self, buf: &mut BytesMut) {
        // Network byte order on every field.
        buf.put_u32(self.package_len);
        buf.put_u16(self.header_len);
        buf.put_u16(self.version);
        buf.put_i32(self.operation);
        buf.put_i32(self.sequence);
    }

    /// Parses a header without validating it against any limits.
    pub fn parse(mut raw: &[u8]) -> Option<Self> {
        if raw.len() < Self::LEN {
            return None;
        }
        Some(Self {
            package_len: raw.get_u32(),
            header_len: raw.get_u16(),
            version: raw.get_u16(),
            operation: raw.get_i32(),
            sequence: raw.get_i32(),
        })
    }

    /// Returns the body length after checking the header against `max_body_size`.
    pub fn body_len(&self, max_body_size: usize) -> Result<usize> {
        let package_len = self.package_len as usize;
        if package_len < Self::LEN {
            return Err(Error::PackageTooShort(self.package_len));
        }
        let body_len = package_len - Self::LEN;
        if body_len > max_body_size {
            return Err(Error::PackageTooLarge {
                body_len,
                max_body_size,
            });
        }
        if self.header_len as usize != Self::LEN {
            return Err(Error::HeaderLengthError(self.header_len));
        }
        Ok(body_len)
    }
}

/// The atomic message unit exchanged with clients.
///
/// ```
/// use bytes::{Bytes, BytesMut};
/// use courier_wire::{MAX_BODY_SIZE, Proto, op};
///
/// let proto = Proto::new(op::SEND_MSG, 7, Bytes::from_static(b"hello"));
/// let mut buf = BytesMut::new();
/// proto.encode(&mut buf);
/// let decoded = Proto::decode(&mut buf, MAX_BODY_SIZE).expect("decode").expect("frame");
/// assert_eq!(decoded, proto);
/// assert!(buf.is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proto {
    #[serde(rename = "ver")]
    pub version: u16,
    #[serde(rename = "op")]
    pub operation: i32,
    #[serde(rename = "seq", default)]
    pub sequence: i32,
    #[serde(with = "base64_bytes", default)]
    pub body: Bytes,
}

impl Default for Proto {
    fn default() -> Self {
        Self {
            version: VERSION,
            operation: 0,
            sequence: 0,
            body: Bytes::new(),
        }
    }
}

impl Proto {
    pub fn new(operation: i32, sequence: i32, body: Bytes) -> Self {
        Self {
            version: VERSION,
            operation,
            sequence,
            body,
        }
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            package_len: (FrameHeader::LEN + self.body.len()) as u32,
            header_len: FrameHeader::LEN as u16,
            version: self.version,
            operation: self.operation,
            sequence: self.sequence,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(FrameHeader::LEN + self.body.len());
        self.header().encode(buf);
        buf.extend_from_slice(&self.body);
    }

    /// Answer to this heartbeat: same sequence, body is the decimal room online count.
    pub fn heartbeat_reply(&self, online: i32) -> Proto {
        Proto {
            version: self.version,
            operation: op::HEARTBEAT_REPLY,
            sequence: self.sequence,
            body: Bytes::from(online.to_string()),
        }
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` until a complete frame is buffered. The header is
    /// validated before anything is consumed, so a rejected frame leaves `buf`
    /// untouched.
    pub fn decode(buf: &mut BytesMut, max_body_size: usize) -> Result<Option<Self>> {
        let Some(header) = FrameHeader::parse(&buf[..]) else {
            return Ok(None);
        };
        let body_len = header.body_len(max_body_size)?;
        let frame_len = FrameHeader::LEN + body_len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }
        let mut frame = buf.split_to(frame_len).freeze();
        frame.advance(FrameHeader::LEN);
        Ok(Some(Self {
            version: header.version,
            operation: header.operation,
            sequence: header.sequence,
            body: frame,
        }))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::Serialize)
    }

    pub fn from_json(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(Error::Deserialize)
    }
}

/// `tokio_util` codec for raw TCP connections.
#[derive(Debug, Clone, Copy)]
pub struct ProtoCodec {
    max_body_size: usize,
}

impl ProtoCodec {
    pub fn new(max_body_size: usize) -> Self {
        Self { max_body_size }
    }

    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }
}

impl Default for ProtoCodec {
    fn default() -> Self {
        Self::new(MAX_BODY_SIZE)
    }
}

impl Decoder for ProtoCodec {
    type Item = Proto;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Proto>> {
        Proto::decode(src, self.max_body_size)
    }
}

impl Encoder<&Proto> for ProtoCodec {
    type Error = Error;

    fn encode(&mut self, item: &Proto, dst: &mut BytesMut) -> Result<()> {
        item.encode(dst);
        Ok(())
    }
}

impl Encoder<Proto> for ProtoCodec {
    type Error = Error;

    fn encode(&mut self, item: Proto, dst: &mut BytesMut) -> Result<()> {
        item.encode(dst);
        Ok(())
    }
}

/// Serde adapter encoding `Bytes` as a base64 string.
pub mod base64_bytes {
    use super::*;
    use serde::de::Error;

    // Bodies travel as base64 strings inside JSON frames.
    pub fn serialize<S>(value: &Bytes, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let encoded = base64::engine::general_purpose::STANDARD.encode(value);
        serializer.serialize_str(&encoded)
    }

    // Missing and null bodies both decode to an empty body.
    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Bytes, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(D::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}
