//! The seven payload kinds carried by an envelope.

use crate::ip::IpPrefix;
use crate::opcode::Group;
use crate::types::{MacAddress, NodeId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Address family of bridge (FDB) neighbor entries.
pub const AF_BRIDGE: u8 = 7;
/// Address family of MPLS routes.
pub const AF_MPLS: u8 = 28;

/// Bridge VLAN flags as reported by the kernel.
pub const BRIDGE_VLAN_INFO_MASTER: u16 = 0x1;
pub const BRIDGE_VLAN_INFO_PVID: u16 = 0x2;
pub const BRIDGE_VLAN_INFO_UNTAGGED: u16 = 0x4;
pub const BRIDGE_VLAN_INFO_RANGE_BEGIN: u16 = 0x8;
pub const BRIDGE_VLAN_INFO_RANGE_END: u16 = 0x10;

/// Interface operational state (RFC 2863).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperState {
    #[default]
    Unknown,
    NotPresent,
    Down,
    LowerLayerDown,
    Testing,
    Dormant,
    Up,
}

impl OperState {
    pub fn from_kernel(value: u8) -> Self {
        match value {
            1 => OperState::NotPresent,
            2 => OperState::Down,
            3 => OperState::LowerLayerDown,
            4 => OperState::Testing,
            5 => OperState::Dormant,
            6 => OperState::Up,
            _ => OperState::Unknown,
        }
    }
}

/// Interface existence and attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub index: u32,
    pub name: String,
    /// Link kind from IFLA_INFO_KIND (`bridge`, `vlan`, ...), if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub oper_state: OperState,
    #[serde(default)]
    pub master_index: u32,
    #[serde(default)]
    pub parent_index: u32,
    #[serde(default)]
    pub flags: u32,
    #[serde(default)]
    pub mtu: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hw_addr: Option<MacAddress>,
}

impl Link {
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn is_up(&self) -> bool {
        self.oper_state == OperState::Up
    }
}

/// An address assigned to a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addr {
    pub index: u32,
    pub address: IpPrefix,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// A neighbor (ARP/ND) or bridge forwarding entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neigh {
    pub index: u32,
    pub family: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hw_addr: Option<MacAddress>,
    #[serde(default)]
    pub state: u16,
    #[serde(default)]
    pub flags: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<u16>,
}

impl Neigh {
    /// Bridge forwarding database entries have no IP address.
    pub fn is_fdb_entry(&self) -> bool {
        self.family == AF_BRIDGE && self.ip.is_none()
    }
}

/// A kernel-visible route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub family: u8,
    /// `None` is the default route, or an MPLS route keyed by `mpls_label`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<IpPrefix>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oif: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<u32>,
    #[serde(default)]
    pub table: u32,
    #[serde(default)]
    pub protocol: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mpls_label: Option<u32>,
}

/// Liveness of a cluster member as seen by the aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Address the member connected from.
    pub ip: IpAddr,
}

/// A synthetic label route between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vpn {
    pub dst: IpPrefix,
    /// Underlay gateway.
    pub gw: IpAddr,
    pub vpn_gw: IpAddr,
    pub label: u32,
}

/// Role of a bridge port for one VLAN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeVlanPortType {
    None,
    Access,
    Trunk,
    Master,
}

/// VLAN membership of a bridge port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeVlanInfo {
    pub index: u32,
    pub name: String,
    #[serde(default)]
    pub master_index: u32,
    pub vid: u16,
    #[serde(default)]
    pub flags: u16,
    #[serde(default)]
    pub mtu: u16,
    #[serde(default)]
    pub bridge_id: u32,
}

impl BridgeVlanInfo {
    pub fn port_type(&self) -> BridgeVlanPortType {
        if self.master_index == 0 || self.master_index == self.index {
            return BridgeVlanPortType::Master;
        }

        let pvid = self.flags & BRIDGE_VLAN_INFO_PVID != 0;
        let untagged = self.flags & BRIDGE_VLAN_INFO_UNTAGGED != 0;
        match (pvid, untagged) {
            (true, true) => BridgeVlanPortType::Access,
            (false, false) => BridgeVlanPortType::Trunk,
            _ => BridgeVlanPortType::None,
        }
    }
}

/// Closed set of payloads an envelope can carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Link(Link),
    Addr(Addr),
    Neigh(Neigh),
    Route(Route),
    Node(Node),
    Vpn(Vpn),
    BridgeVlan(BridgeVlanInfo),
}

impl Payload {
    pub fn group(&self) -> Group {
        match self {
            Payload::Link(_) => Group::Link,
            Payload::Addr(_) => Group::Addr,
            Payload::Neigh(_) => Group::Neigh,
            Payload::Route(_) => Group::Route,
            Payload::Node(_) => Group::Node,
            Payload::Vpn(_) => Group::Vpn,
            Payload::BridgeVlan(_) => Group::Bridge,
        }
    }

    /// Kind-specific part of the entity identity.
    pub fn key(&self, nid: NodeId) -> String {
        match self {
            Payload::Link(link) => link.index.to_string(),
            Payload::Addr(addr) => format!("{}/{}", addr.index, addr.address),
            Payload::Neigh(neigh) => match (neigh.ip, neigh.hw_addr) {
                (Some(ip), _) => format!("{}/{}", neigh.index, ip),
                (None, Some(mac)) => format!("{}/{}/{}", neigh.index, neigh.vlan.unwrap_or(0), mac),
                (None, None) => neigh.index.to_string(),
            },
            Payload::Route(route) => match (route.dst, route.mpls_label) {
                (Some(dst), _) => format!("{}/{}", route.table, dst),
                (None, Some(label)) => format!("mpls/{}", label),
                (None, None) => format!("{}/default/{}", route.table, route.family),
            },
            Payload::Node(_) => nid.to_string(),
            Payload::Vpn(vpn) => format!("{}/{}", vpn.dst, vpn.gw),
            Payload::BridgeVlan(br) => format!("{}/{}", br.index, br.vid),
        }
    }
}

/// Logical identity of an entity: `(node, kind, key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub nid: NodeId,
    pub kind: Group,
    pub key: String,
}

impl EntityKey {
    pub fn new(nid: NodeId, kind: Group, key: impl Into<String>) -> Self {
        Self {
            nid,
            kind,
            key: key.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.nid, self.kind, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn vpn(label: u32) -> Vpn {
        Vpn {
            dst: "100.100.1.0/24".parse().unwrap(),
            gw: "10.0.0.1".parse().unwrap(),
            vpn_gw: "1.1.1.1".parse().unwrap(),
            label,
        }
    }

    #[test]
    fn test_oper_state_from_kernel() {
        assert_eq!(OperState::from_kernel(6), OperState::Up);
        assert_eq!(OperState::from_kernel(2), OperState::Down);
        assert_eq!(OperState::from_kernel(42), OperState::Unknown);
    }

    #[test]
    fn test_fdb_entry_detection() {
        let fdb = Neigh {
            index: 5,
            family: AF_BRIDGE,
            hw_addr: Some(MacAddress::new([0, 1, 2, 3, 4, 5])),
            ..Default::default()
        };
        assert!(fdb.is_fdb_entry());

        let arp = Neigh {
            index: 5,
            family: 2,
            ip: Some("10.0.0.2".parse().unwrap()),
            ..Default::default()
        };
        assert!(!arp.is_fdb_entry());
    }

    #[test]
    fn test_bridge_vlan_port_type() {
        let mut br = BridgeVlanInfo {
            index: 10,
            name: "eth1".into(),
            master_index: 3,
            vid: 100,
            ..Default::default()
        };
        assert_eq!(br.port_type(), BridgeVlanPortType::Trunk);

        br.flags = BRIDGE_VLAN_INFO_PVID | BRIDGE_VLAN_INFO_UNTAGGED;
        assert_eq!(br.port_type(), BridgeVlanPortType::Access);

        br.flags = BRIDGE_VLAN_INFO_PVID;
        assert_eq!(br.port_type(), BridgeVlanPortType::None);

        br.master_index = 10;
        assert_eq!(br.port_type(), BridgeVlanPortType::Master);
    }

    #[test]
    fn test_vpn_key_ignores_label() {
        let nid = NodeId(2);
        assert_eq!(
            Payload::Vpn(vpn(20001)).key(nid),
            Payload::Vpn(vpn(20002)).key(nid)
        );
        assert_eq!(Payload::Vpn(vpn(1)).key(nid), "100.100.1.0/24/10.0.0.1");
    }

    #[test]
    fn test_route_keys() {
        let route = Route {
            family: 2,
            dst: Some("10.1.0.0/16".parse().unwrap()),
            table: 254,
            ..Default::default()
        };
        assert_eq!(Payload::Route(route).key(NodeId(1)), "254/10.1.0.0/16");

        let mpls = Route {
            family: AF_MPLS,
            mpls_label: Some(16001),
            ..Default::default()
        };
        assert_eq!(Payload::Route(mpls).key(NodeId(1)), "mpls/16001");
    }

    #[test]
    fn test_payload_json_tagging() {
        let payload = Payload::Link(Link::new(4, "eth0"));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "link");
        assert_eq!(json["data"]["name"], "eth0");
    }
}
