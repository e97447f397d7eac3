//! Message type numbering.
//!
//! Kernel route-netlink types keep their native values. Operations the kernel
//! has no code for (address/neigh/route SET, nodes, VPN label routes, bridge
//! VLAN membership) live in a block starting at 0x100 so they never collide
//! with a kernel type.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const RTM_NEWLINK: u16 = 16;
pub const RTM_DELLINK: u16 = 17;
pub const RTM_SETLINK: u16 = 19;
pub const RTM_NEWADDR: u16 = 20;
pub const RTM_DELADDR: u16 = 21;
pub const RTM_NEWROUTE: u16 = 24;
pub const RTM_DELROUTE: u16 = 25;
pub const RTM_NEWNEIGH: u16 = 28;
pub const RTM_DELNEIGH: u16 = 29;

pub const RTM_SETADDR: u16 = 0x100;
pub const RTM_SETNEIGH: u16 = 0x101;
pub const RTM_SETROUTE: u16 = 0x102;

pub const RTM_NEWNODE: u16 = 0x110;
pub const RTM_DELNODE: u16 = 0x111;
pub const RTM_SETNODE: u16 = 0x112;

pub const RTM_NEWVPN: u16 = 0x120;
pub const RTM_DELVPN: u16 = 0x121;
pub const RTM_SETVPN: u16 = 0x122;

pub const RTM_NEWBRIDGE: u16 = 0x130;
pub const RTM_DELBRIDGE: u16 = 0x131;
pub const RTM_SETBRIDGE: u16 = 0x132;

/// Payload family of a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Group {
    Link,
    Addr,
    Neigh,
    Route,
    Node,
    Vpn,
    Bridge,
}

impl Group {
    pub const ALL: [Group; 7] = [
        Group::Link,
        Group::Addr,
        Group::Neigh,
        Group::Route,
        Group::Node,
        Group::Vpn,
        Group::Bridge,
    ];

    /// Classifies a message type, `None` for anything outside the seven groups.
    pub const fn from_msg_type(msg_type: u16) -> Option<Group> {
        match msg_type {
            RTM_NEWLINK | RTM_DELLINK | RTM_SETLINK => Some(Group::Link),
            RTM_NEWADDR | RTM_DELADDR | RTM_SETADDR => Some(Group::Addr),
            RTM_NEWNEIGH | RTM_DELNEIGH | RTM_SETNEIGH => Some(Group::Neigh),
            RTM_NEWROUTE | RTM_DELROUTE | RTM_SETROUTE => Some(Group::Route),
            RTM_NEWNODE | RTM_DELNODE | RTM_SETNODE => Some(Group::Node),
            RTM_NEWVPN | RTM_DELVPN | RTM_SETVPN => Some(Group::Vpn),
            RTM_NEWBRIDGE | RTM_DELBRIDGE | RTM_SETBRIDGE => Some(Group::Bridge),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Group::Link => "LINK",
            Group::Addr => "ADDR",
            Group::Neigh => "NEIGH",
            Group::Route => "ROUTE",
            Group::Node => "NODE",
            Group::Vpn => "VPN",
            Group::Bridge => "BRIDGE",
        }
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation carried by a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    New,
    Del,
    Set,
}

impl Operation {
    pub const fn from_msg_type(msg_type: u16) -> Option<Operation> {
        match msg_type {
            RTM_NEWLINK | RTM_NEWADDR | RTM_NEWNEIGH | RTM_NEWROUTE | RTM_NEWNODE
            | RTM_NEWVPN | RTM_NEWBRIDGE => Some(Operation::New),
            RTM_DELLINK | RTM_DELADDR | RTM_DELNEIGH | RTM_DELROUTE | RTM_DELNODE
            | RTM_DELVPN | RTM_DELBRIDGE => Some(Operation::Del),
            RTM_SETLINK | RTM_SETADDR | RTM_SETNEIGH | RTM_SETROUTE | RTM_SETNODE
            | RTM_SETVPN | RTM_SETBRIDGE => Some(Operation::Set),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Operation::New => "NEW",
            Operation::Del => "DEL",
            Operation::Set => "SET",
        }
    }
}

/// Message type for a group and operation.
pub const fn msg_type(group: Group, op: Operation) -> u16 {
    match (group, op) {
        (Group::Link, Operation::New) => RTM_NEWLINK,
        (Group::Link, Operation::Del) => RTM_DELLINK,
        (Group::Link, Operation::Set) => RTM_SETLINK,
        (Group::Addr, Operation::New) => RTM_NEWADDR,
        (Group::Addr, Operation::Del) => RTM_DELADDR,
        (Group::Addr, Operation::Set) => RTM_SETADDR,
        (Group::Neigh, Operation::New) => RTM_NEWNEIGH,
        (Group::Neigh, Operation::Del) => RTM_DELNEIGH,
        (Group::Neigh, Operation::Set) => RTM_SETNEIGH,
        (Group::Route, Operation::New) => RTM_NEWROUTE,
        (Group::Route, Operation::Del) => RTM_DELROUTE,
        (Group::Route, Operation::Set) => RTM_SETROUTE,
        (Group::Node, Operation::New) => RTM_NEWNODE,
        (Group::Node, Operation::Del) => RTM_DELNODE,
        (Group::Node, Operation::Set) => RTM_SETNODE,
        (Group::Vpn, Operation::New) => RTM_NEWVPN,
        (Group::Vpn, Operation::Del) => RTM_DELVPN,
        (Group::Vpn, Operation::Set) => RTM_SETVPN,
        (Group::Bridge, Operation::New) => RTM_NEWBRIDGE,
        (Group::Bridge, Operation::Del) => RTM_DELBRIDGE,
        (Group::Bridge, Operation::Set) => RTM_SETBRIDGE,
    }
}

/// Log name of a message type, e.g. `RTM_NEWVPN`.
pub fn msg_type_name(msg_type: u16) -> String {
    match (
        Group::from_msg_type(msg_type),
        Operation::from_msg_type(msg_type),
    ) {
        (Some(group), Some(op)) => format!("RTM_{}{}", op.as_str(), group.as_str()),
        _ => format!("RTM_UNKNOWN({msg_type})"),
    }
}
