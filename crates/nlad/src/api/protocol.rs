//! Wire protocol for the cluster API
//!
//! # Wire Format
//!
//! Every frame is length-prefixed and carries one JSON document:
//! ```text
//! ┌──────────────┬─────────────────────────────────────┐
//! │ 4 bytes      │ N bytes                             │
//! │ length (BE)  │ JSON frame                          │
//! └──────────────┴─────────────────────────────────────┘
//! ```
//!
//! # Exchanges
//!
//! - Slave: `Hello{role: slave}` → `Welcome`, then `Submit` → `Ack` for every
//!   local envelope; the master may push `Modify` at any time.
//! - Subscriber: `Hello{role: subscriber}` → `Welcome`, the stored state as
//!   `Event`s, then the live stream of `Event`; the subscriber may send `Modify`.
//! - Either peer may send `Ping`; the master answers `Pong`. A slave that
//!   stays silent longer than the idle timeout is dropped.

use crate::error::{NladError, Result};
use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use nla_msg::{Envelope, Group, NodeId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

/// Largest accepted frame
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Time limits of a cluster API connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// TCP connect to the master
    pub connect: Duration,
    /// `Hello` → `Welcome` exchange
    pub handshake: Duration,
    /// One frame written to a peer that is not reading
    pub write: Duration,
    /// Interval between `Ping`s sent by a slave
    pub heartbeat: Duration,
    /// Silence after which the other end is considered dead
    pub idle: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(3),
            handshake: Duration::from_secs(10),
            write: Duration::from_secs(5),
            heartbeat: Duration::from_secs(1),
            idle: Duration::from_secs(5),
        }
    }
}

/// What the connecting peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    Slave,
    Subscriber,
}

/// Server-side filter applied to a subscriber's stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeFilter {
    /// Only envelopes from this node (None = all nodes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nid: Option<NodeId>,
    /// Only these payload groups (empty = all groups)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<Group>,
}

impl SubscribeFilter {
    pub fn matches(&self, envelope: &Envelope) -> bool {
        if let Some(nid) = self.nid {
            if envelope.nid() != nid {
                return false;
            }
        }
        self.groups.is_empty() || self.groups.contains(&envelope.group())
    }
}

/// Initial frame from every peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub nid: NodeId,
    pub role: PeerRole,
    #[serde(default)]
    pub filter: SubscribeFilter,
}

/// Messages exchanged on a cluster API connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Frame {
    /// Peer → Master: identify and pick a role
    Hello(Hello),
    /// Master → Peer: handshake accepted
    Welcome { master_nid: NodeId },
    /// Slave → Master: one locally captured envelope
    Submit(Envelope),
    /// Master → Slave: submit accepted
    Ack { seq: u64 },
    /// Master → Subscriber: one envelope of the merged stream
    Event(Envelope),
    /// Either direction: a modification to apply on the target node
    Modify(Envelope),
    /// Master → Peer: the request was refused
    Error { message: String },
    /// Slave → Master: heartbeat while otherwise idle
    Ping,
    /// Master → Slave: answer to `Ping`
    Pong,
}

impl Frame {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Frame::Hello(_) => "hello",
            Frame::Welcome { .. } => "welcome",
            Frame::Submit(_) => "submit",
            Frame::Ack { .. } => "ack",
            Frame::Event(_) => "event",
            Frame::Modify(_) => "modify",
            Frame::Error { .. } => "error",
            Frame::Ping => "ping",
            Frame::Pong => "pong",
        }
    }
}

/// Length-delimited transport over any byte stream.
pub fn framed<T>(io: T) -> Framed<T, LengthDelimitedCodec>
where
    T: AsyncRead + AsyncWrite,
{
    let codec = LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec();
    Framed::new(io, codec)
}

pub async fn send_frame<S>(sink: &mut S, frame: &Frame) -> Result<()>
where
    S: Sink<Bytes, Error = std::io::Error> + Unpin,
{
    sink.send(frame.encode()?).await?;
    Ok(())
}

/// [`send_frame`] bounded by `limit`, abandoned once `shutdown` fires.
///
/// A peer that stops reading fills the socket buffer; the write then times
/// out and the caller tears the connection down.
pub async fn send_frame_within<S>(
    sink: &mut S,
    frame: &Frame,
    limit: Duration,
    shutdown: &CancellationToken,
) -> Result<()>
where
    S: Sink<Bytes, Error = std::io::Error> + Unpin,
{
    tokio::select! {
        _ = shutdown.cancelled() => Err(NladError::Shutdown),
        result = tokio::time::timeout(limit, send_frame(sink, frame)) => match result {
            Ok(result) => result,
            Err(_) => Err(NladError::Timeout(frame.name())),
        },
    }
}

/// Next frame, `None` at end of stream.
///
/// A frame that is not valid JSON or carries an invalid envelope is an
/// error; the caller decides whether the connection survives it.
pub async fn recv_frame<S>(stream: &mut S) -> Result<Option<Frame>>
where
    S: Stream<Item = std::io::Result<BytesMut>> + Unpin,
{
    match stream.next().await {
        Some(Ok(bytes)) => Frame::decode(&bytes).map(Some),
        Some(Err(e)) => Err(NladError::Io(e)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nla_msg::opcode::{RTM_NEWLINK, RTM_NEWVPN};
    use nla_msg::{Link, Payload, Source, Vpn};
    use pretty_assertions::assert_eq;

    fn link_env(nid: u8) -> Envelope {
        Envelope::new(
            RTM_NEWLINK,
            NodeId(nid),
            Source::Kernel,
            Payload::Link(Link::new(4, "eth0")),
        )
        .unwrap()
    }

    #[test]
    fn test_filter_matches() {
        let all = SubscribeFilter::default();
        assert!(all.matches(&link_env(3)));

        let node = SubscribeFilter {
            nid: Some(NodeId(3)),
            groups: vec![],
        };
        assert!(node.matches(&link_env(3)));
        assert!(!node.matches(&link_env(4)));

        let vpn_only = SubscribeFilter {
            nid: None,
            groups: vec![Group::Vpn],
        };
        assert!(!vpn_only.matches(&link_env(3)));
        let vpn = Envelope::new(
            RTM_NEWVPN,
            NodeId(0),
            Source::Api,
            Payload::Vpn(Vpn {
                dst: "100.100.1.0/24".parse().unwrap(),
                gw: "10.0.0.1".parse().unwrap(),
                vpn_gw: "1.1.1.1".parse().unwrap(),
                label: 20001,
            }),
        )
        .unwrap();
        assert!(vpn_only.matches(&vpn));
    }

    #[test]
    fn test_hello_json_shape() {
        let frame = Frame::Hello(Hello {
            nid: NodeId(3),
            role: PeerRole::Slave,
            filter: SubscribeFilter::default(),
        });
        let value: serde_json::Value = serde_json::from_slice(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "hello");
        assert_eq!(value["body"]["nid"], 3);
        assert_eq!(value["body"]["role"], "slave");
    }

    #[test]
    fn test_decode_rejects_mismatched_envelope() {
        let frame = Frame::Submit(link_env(3));
        let mut value: serde_json::Value =
            serde_json::from_slice(&frame.encode().unwrap()).unwrap();
        value["body"]["header"]["msg_type"] = serde_json::json!(RTM_NEWVPN);
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(Frame::decode(&bytes).is_err());
    }

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut left = framed(a);
        let mut right = framed(b);

        send_frame(&mut left, &Frame::Submit(link_env(3))).await.unwrap();
        send_frame(&mut left, &Frame::Ack { seq: 9 }).await.unwrap();
        drop(left);

        assert_eq!(
            recv_frame(&mut right).await.unwrap(),
            Some(Frame::Submit(link_env(3)))
        );
        assert_eq!(
            recv_frame(&mut right).await.unwrap(),
            Some(Frame::Ack { seq: 9 })
        );
        assert_eq!(recv_frame(&mut right).await.unwrap(), None);
    }

    #[test]
    fn test_ping_json_shape() {
        let value: serde_json::Value = serde_json::from_slice(&Frame::Ping.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "ping");
        assert_eq!(Frame::decode(&Frame::Pong.encode().unwrap()).unwrap(), Frame::Pong);
    }

    #[tokio::test]
    async fn test_send_within_times_out_when_peer_stops_reading() {
        let (a, _b) = tokio::io::duplex(1024);
        let mut left = framed(a);
        let shutdown = CancellationToken::new();
        let limit = Duration::from_millis(50);

        let big = Frame::Error {
            message: "x".repeat(8 * 1024),
        };
        let err = send_frame_within(&mut left, &big, limit, &shutdown).await.unwrap_err();
        assert!(matches!(err, NladError::Timeout("error")));
    }

    #[tokio::test]
    async fn test_send_within_stops_on_shutdown() {
        let (a, _b) = tokio::io::duplex(1024);
        let mut left = framed(a);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let big = Frame::Error {
            message: "x".repeat(8 * 1024),
        };
        let err = send_frame_within(&mut left, &big, Duration::from_secs(60), &shutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, NladError::Shutdown));
    }
}
