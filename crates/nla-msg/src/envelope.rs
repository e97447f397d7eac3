//! Event envelope: node of origin, source, sequence and one typed payload.

use crate::error::{MsgError, Result};
use crate::opcode::{msg_type_name, Group, Operation};
use crate::payload::{EntityKey, Payload};
use crate::types::{NodeId, Source};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Envelope metadata handed to every handler alongside the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgHeader {
    pub msg_type: u16,
    pub nid: NodeId,
    pub src: Source,
    /// Per-producer sequence number.
    #[serde(default)]
    pub seq: u64,
}

impl MsgHeader {
    /// Group of the message type. Always `Some` for a header built by [`Envelope::new`].
    pub fn group(&self) -> Option<Group> {
        Group::from_msg_type(self.msg_type)
    }

    pub fn operation(&self) -> Option<Operation> {
        Operation::from_msg_type(self.msg_type)
    }
}

impl fmt::Display for MsgHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} NId:{} Src:{} Seq:{}",
            msg_type_name(self.msg_type),
            self.nid,
            self.src,
            self.seq
        )
    }
}

/// A validated state change.
///
/// The message type always belongs to the same group as the payload. Both
/// construction and decoding enforce it, so handlers never see a mismatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Envelope {
    header: MsgHeader,
    payload: Payload,
}

impl Envelope {
    pub fn new(msg_type: u16, nid: NodeId, src: Source, payload: Payload) -> Result<Self> {
        Self::from_parts(
            MsgHeader {
                msg_type,
                nid,
                src,
                seq: 0,
            },
            payload,
        )
    }

    pub fn from_parts(header: MsgHeader, payload: Payload) -> Result<Self> {
        let expected =
            Group::from_msg_type(header.msg_type).ok_or(MsgError::UnsupportedType(header.msg_type))?;
        let found = payload.group();
        if expected != found {
            return Err(MsgError::PayloadMismatch {
                msg_type: header.msg_type,
                expected,
                found,
            });
        }
        Ok(Self { header, payload })
    }

    /// Decodes and validates an envelope from JSON.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let raw: RawEnvelope = serde_json::from_slice(bytes)?;
        Self::from_parts(raw.header, raw.payload)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn header(&self) -> &MsgHeader {
        &self.header
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn msg_type(&self) -> u16 {
        self.header.msg_type
    }

    pub fn nid(&self) -> NodeId {
        self.header.nid
    }

    pub fn source(&self) -> Source {
        self.header.src
    }

    pub fn seq(&self) -> u64 {
        self.header.seq
    }

    pub fn group(&self) -> Group {
        self.payload.group()
    }

    pub fn operation(&self) -> Operation {
        // The type was checked against the group table in from_parts and every
        // grouped type also has an operation.
        Operation::from_msg_type(self.header.msg_type).unwrap_or(Operation::Set)
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.header.nid, self.group(), self.payload.key(self.header.nid))
    }

    pub fn with_source(mut self, src: Source) -> Self {
        self.header.src = src;
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.header.seq = seq;
        self
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} key:{}", self.header, self.payload.key(self.header.nid))
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawEnvelope::deserialize(deserializer)?;
        Envelope::from_parts(raw.header, raw.payload).map_err(serde::de::Error::custom)
    }
}

#[derive(Deserialize)]
struct RawEnvelope {
    header: MsgHeader,
    payload: Payload,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::{RTM_NEWLINK, RTM_NEWVPN, RTM_SETLINK};
    use crate::payload::{Link, OperState, Vpn};
    use pretty_assertions::assert_eq;

    fn eth0() -> Payload {
        let mut link = Link::new(4, "eth0");
        link.oper_state = OperState::Up;
        Payload::Link(link)
    }

    #[test]
    fn test_new_validates_group() {
        let env = Envelope::new(RTM_NEWLINK, NodeId(3), Source::Kernel, eth0()).unwrap();
        assert_eq!(env.group(), Group::Link);
        assert_eq!(env.operation(), Operation::New);
        assert_eq!(env.key(), EntityKey::new(NodeId(3), Group::Link, "4"));

        let err = Envelope::new(RTM_NEWVPN, NodeId(3), Source::Kernel, eth0()).unwrap_err();
        assert!(matches!(err, MsgError::PayloadMismatch { .. }));
    }

    #[test]
    fn test_unknown_type_is_error() {
        let err = Envelope::new(32, NodeId(1), Source::Kernel, eth0()).unwrap_err();
        assert!(matches!(err, MsgError::UnsupportedType(32)));
    }

    #[test]
    fn test_json_decode_validates() {
        let env = Envelope::new(RTM_SETLINK, NodeId(3), Source::Kernel, eth0())
            .unwrap()
            .with_seq(7);
        let bytes = env.to_json().unwrap();
        assert_eq!(Envelope::from_json(&bytes).unwrap(), env);

        let mut value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        value["header"]["msg_type"] = serde_json::json!(RTM_NEWVPN);
        let tampered = serde_json::to_vec(&value).unwrap();
        assert!(Envelope::from_json(&tampered).is_err());

        value["header"]["msg_type"] = serde_json::json!(999);
        let unknown = serde_json::to_vec(&value).unwrap();
        assert!(Envelope::from_json(&unknown).is_err());
    }

    #[test]
    fn test_display() {
        let vpn = Payload::Vpn(Vpn {
            dst: "100.100.1.0/24".parse().unwrap(),
            gw: "10.0.0.1".parse().unwrap(),
            vpn_gw: "2.2.2.2".parse().unwrap(),
            label: 20001,
        });
        let env = Envelope::new(RTM_NEWVPN, NodeId(2), Source::Api, vpn).unwrap();
        assert_eq!(
            env.to_string(),
            "RTM_NEWVPN NId:2 Src:FROM_API Seq:0 key:100.100.1.0/24/10.0.0.1"
        );
    }
}
