//! Netlink framing and decoding into envelope payloads.
//!
//! Framing walks the `nlmsghdr` chain of one datagram without looking at
//! the payloads. Only the route-netlink types that map onto a payload kind
//! are decoded; the rest are reported as unsupported and skipped. Link
//! messages of the `AF_BRIDGE` family describe bridge ports and carry their
//! VLAN list instead of a link.

use crate::error::{NladError, Result};
use nla_msg::{BridgeVlanInfo, Payload};

/// Size of `struct nlmsghdr`
pub const NLMSG_HDRLEN: usize = 16;

pub const NLMSG_NOOP: u16 = 1;
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;

/// One netlink message inside a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMessage<'a> {
    pub msg_type: u16,
    pub seq: u32,
    /// The whole message, header included
    pub bytes: &'a [u8],
}

/// Result of decoding one message.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(u16, Payload),
    /// Bridge port report. `vlans` is the full VLAN list of the port, or
    /// `None` when the message carries no VLAN attribute.
    BridgePort {
        msg_type: u16,
        index: u32,
        vlans: Option<Vec<BridgeVlanInfo>>,
    },
    /// Control message or a kind nobody consumes
    Unsupported(u16),
    /// Known kind whose payload could not be built
    Malformed(u16, String),
}

fn nlmsg_align(len: usize) -> usize {
    (len + 3) & !3
}

/// Splits a datagram into its messages. A header whose length is shorter
/// than the header itself or runs past the datagram is a framing failure.
pub fn split_messages(buf: &[u8]) -> Result<Vec<RawMessage<'_>>> {
    let mut messages = Vec::new();
    let mut offset = 0;

    while offset + NLMSG_HDRLEN <= buf.len() {
        let len = u32::from_ne_bytes([
            buf[offset],
            buf[offset + 1],
            buf[offset + 2],
            buf[offset + 3],
        ]) as usize;
        let msg_type = u16::from_ne_bytes([buf[offset + 4], buf[offset + 5]]);
        let seq = u32::from_ne_bytes([
            buf[offset + 8],
            buf[offset + 9],
            buf[offset + 10],
            buf[offset + 11],
        ]);

        if len < NLMSG_HDRLEN || offset + len > buf.len() {
            return Err(NladError::Netlink(format!(
                "bad netlink frame at offset {}: length {} in {} bytes",
                offset,
                len,
                buf.len()
            )));
        }

        messages.push(RawMessage {
            msg_type,
            seq,
            bytes: &buf[offset..offset + len],
        });
        offset += nlmsg_align(len);
    }

    if offset < buf.len() && buf.len() - offset >= NLMSG_HDRLEN {
        return Err(NladError::Netlink("trailing bytes after netlink frame".to_string()));
    }

    Ok(messages)
}

/// Where a dump stands after one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpStatus {
    Running,
    Done,
    /// The kernel answered with an error; carries the positive errno
    Failed(i32),
}

/// Status of the dump requested with sequence number `seq`. Replies to
/// other requests are ignored.
pub fn dump_status(buf: &[u8], seq: u32) -> DumpStatus {
    let Ok(messages) = split_messages(buf) else {
        return DumpStatus::Running;
    };

    for msg in messages.iter().filter(|m| m.seq == seq) {
        match msg.msg_type {
            NLMSG_DONE => return DumpStatus::Done,
            NLMSG_ERROR => {
                let code = msg
                    .bytes
                    .get(NLMSG_HDRLEN..NLMSG_HDRLEN + 4)
                    .map(|b| i32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
                    .unwrap_or(0);
                return match code {
                    0 => DumpStatus::Done,
                    code => DumpStatus::Failed(code.saturating_abs()),
                };
            }
            _ => {}
        }
    }
    DumpStatus::Running
}

/// Whether `msg_type` is one of the kernel types captured as envelopes.
pub fn is_captured_type(msg_type: u16) -> bool {
    use nla_msg::opcode::{
        RTM_DELADDR, RTM_DELLINK, RTM_DELNEIGH, RTM_DELROUTE, RTM_NEWADDR, RTM_NEWLINK,
        RTM_NEWNEIGH, RTM_NEWROUTE,
    };
    matches!(
        msg_type,
        RTM_NEWLINK
            | RTM_DELLINK
            | RTM_NEWADDR
            | RTM_DELADDR
            | RTM_NEWROUTE
            | RTM_DELROUTE
            | RTM_NEWNEIGH
            | RTM_DELNEIGH
    )
}

#[cfg(target_os = "linux")]
pub use linux::decode;

#[cfg(target_os = "linux")]
mod linux {
    use super::{is_captured_type, Decoded, RawMessage};
    use crate::capture::bridge::expand_ranges;
    use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
    use netlink_packet_route::address::{AddressAttribute, AddressMessage};
    use netlink_packet_route::link::{AfSpecBridge, InfoKind, LinkAttribute, LinkInfo, LinkMessage};
    use netlink_packet_route::neighbour::{NeighbourAddress, NeighbourAttribute, NeighbourMessage};
    use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
    use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
    use nla_msg::opcode::*;
    use nla_msg::payload::AF_MPLS;
    use nla_msg::{
        Addr, BridgeVlanInfo, IpPrefix, Link, MacAddress, Neigh, OperState, Payload, Route,
    };
    use std::net::IpAddr;

    /// Decodes one captured message.
    pub fn decode(raw: &RawMessage<'_>) -> Decoded {
        if !is_captured_type(raw.msg_type) {
            return Decoded::Unsupported(raw.msg_type);
        }

        let message = match NetlinkMessage::<RouteNetlinkMessage>::deserialize(raw.bytes) {
            Ok(message) => message,
            Err(e) => return Decoded::Malformed(raw.msg_type, e.to_string()),
        };

        let inner = match message.payload {
            NetlinkPayload::InnerMessage(inner) => inner,
            _ => return Decoded::Unsupported(raw.msg_type),
        };

        let result = match inner {
            RouteNetlinkMessage::NewLink(m) if is_bridge_port(&m) => {
                return bridge_port(RTM_NEWLINK, m)
            }
            RouteNetlinkMessage::DelLink(m) if is_bridge_port(&m) => {
                return bridge_port(RTM_DELLINK, m)
            }
            RouteNetlinkMessage::NewLink(m) => Ok((RTM_NEWLINK, Payload::Link(link(m)))),
            RouteNetlinkMessage::DelLink(m) => Ok((RTM_DELLINK, Payload::Link(link(m)))),
            RouteNetlinkMessage::NewAddress(m) => addr(m).map(|a| (RTM_NEWADDR, Payload::Addr(a))),
            RouteNetlinkMessage::DelAddress(m) => addr(m).map(|a| (RTM_DELADDR, Payload::Addr(a))),
            RouteNetlinkMessage::NewNeighbour(m) => Ok((RTM_NEWNEIGH, Payload::Neigh(neigh(m)))),
            RouteNetlinkMessage::DelNeighbour(m) => Ok((RTM_DELNEIGH, Payload::Neigh(neigh(m)))),
            RouteNetlinkMessage::NewRoute(m) => Ok((RTM_NEWROUTE, Payload::Route(route(m)))),
            RouteNetlinkMessage::DelRoute(m) => Ok((RTM_DELROUTE, Payload::Route(route(m)))),
            _ => return Decoded::Unsupported(raw.msg_type),
        };

        match result {
            Ok((msg_type, payload)) => Decoded::Message(msg_type, payload),
            Err(reason) => Decoded::Malformed(raw.msg_type, reason),
        }
    }

    fn info_kind(kind: &InfoKind) -> String {
        match kind {
            InfoKind::Other(name) => name.clone(),
            other => format!("{:?}", other).to_lowercase(),
        }
    }

    fn link(msg: LinkMessage) -> Link {
        let mut link = Link::new(msg.header.index, String::new());
        link.flags = msg.header.flags.bits();

        for attr in msg.attributes {
            match attr {
                LinkAttribute::IfName(name) => link.name = name,
                LinkAttribute::Mtu(mtu) => link.mtu = mtu,
                LinkAttribute::Address(bytes) => link.hw_addr = MacAddress::from_slice(&bytes),
                LinkAttribute::OperState(state) => {
                    link.oper_state = OperState::from_kernel(u8::from(state))
                }
                LinkAttribute::Controller(index) => link.master_index = index,
                LinkAttribute::Link(index) => link.parent_index = index,
                LinkAttribute::LinkInfo(infos) => {
                    for info in infos {
                        if let LinkInfo::Kind(kind) = info {
                            link.kind = Some(info_kind(&kind));
                        }
                    }
                }
                _ => {}
            }
        }
        link
    }

    fn is_bridge_port(msg: &LinkMessage) -> bool {
        msg.header.interface_family == AddressFamily::Bridge
    }

    fn bridge_port(msg_type: u16, msg: LinkMessage) -> Decoded {
        let mut port = BridgeVlanInfo {
            index: msg.header.index,
            ..Default::default()
        };
        let mut entries: Option<Vec<(u16, u16)>> = None;

        for attr in msg.attributes {
            match attr {
                LinkAttribute::IfName(name) => port.name = name,
                LinkAttribute::Controller(index) => port.master_index = index,
                LinkAttribute::Mtu(mtu) => port.mtu = u16::try_from(mtu).unwrap_or(u16::MAX),
                LinkAttribute::AfSpecBridge(specs) => {
                    let list = entries.get_or_insert_with(Vec::new);
                    for spec in specs {
                        if let AfSpecBridge::VlanInfo(info) = spec {
                            list.push((info.vid, info.flags.bits()));
                        }
                    }
                }
                _ => {}
            }
        }

        Decoded::BridgePort {
            msg_type,
            index: port.index,
            vlans: entries.map(|entries| expand_ranges(&port, &entries)),
        }
    }

    fn addr(msg: AddressMessage) -> Result<Addr, String> {
        let mut local = None;
        let mut address = None;
        let mut label = None;

        for attr in msg.attributes {
            match attr {
                AddressAttribute::Local(ip) => local = Some(ip),
                AddressAttribute::Address(ip) => address = Some(ip),
                AddressAttribute::Label(l) => label = Some(l),
                _ => {}
            }
        }

        // IFA_LOCAL is the interface address on point-to-point links.
        let ip = local
            .or(address)
            .ok_or_else(|| format!("address on ifindex {} has no IP", msg.header.index))?;
        let prefix = IpPrefix::new(ip, msg.header.prefix_len).map_err(|e| e.to_string())?;

        Ok(Addr {
            index: msg.header.index,
            address: prefix,
            label,
        })
    }

    fn neigh(msg: NeighbourMessage) -> Neigh {
        let mut neigh = Neigh {
            index: msg.header.ifindex,
            family: u8::from(msg.header.family),
            state: u16::from(msg.header.state),
            flags: msg.header.flags.bits(),
            ..Default::default()
        };

        for attr in msg.attributes {
            match attr {
                NeighbourAttribute::Destination(NeighbourAddress::Inet(ip)) => {
                    neigh.ip = Some(IpAddr::V4(ip))
                }
                NeighbourAttribute::Destination(NeighbourAddress::Inet6(ip)) => {
                    neigh.ip = Some(IpAddr::V6(ip))
                }
                NeighbourAttribute::LinkLocalAddress(bytes) => {
                    neigh.hw_addr = MacAddress::from_slice(&bytes)
                }
                NeighbourAttribute::Vlan(vlan) => neigh.vlan = Some(vlan),
                _ => {}
            }
        }
        neigh
    }

    fn route_ip(addr: RouteAddress) -> Option<IpAddr> {
        match addr {
            RouteAddress::Inet(ip) => Some(IpAddr::V4(ip)),
            RouteAddress::Inet6(ip) => Some(IpAddr::V6(ip)),
            _ => None,
        }
    }

    fn route(msg: RouteMessage) -> Route {
        let mut route = Route {
            family: u8::from(msg.header.address_family),
            table: u32::from(msg.header.table),
            protocol: u8::from(msg.header.protocol),
            ..Default::default()
        };
        let prefix_len = msg.header.destination_prefix_length;

        for attr in msg.attributes {
            match attr {
                RouteAttribute::Destination(RouteAddress::Mpls(label)) => {
                    route.mpls_label = Some(label.label)
                }
                RouteAttribute::Destination(dst) => {
                    route.dst = route_ip(dst).and_then(|ip| IpPrefix::new(ip, prefix_len).ok())
                }
                RouteAttribute::Gateway(gw) => route.gw = route_ip(gw),
                RouteAttribute::Oif(oif) => route.oif = Some(oif),
                RouteAttribute::Priority(metric) => route.metric = Some(metric),
                RouteAttribute::Table(table) => route.table = table,
                _ => {}
            }
        }

        if route.family == AF_MPLS {
            route.dst = None;
        }
        route
    }

}

#[cfg(not(target_os = "linux"))]
pub fn decode(raw: &RawMessage<'_>) -> Decoded {
    Decoded::Unsupported(raw.msg_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(len: u32, msg_type: u16) -> Vec<u8> {
        header_seq(len, msg_type, 0)
    }

    fn header_seq(len: u32, msg_type: u16, seq: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&len.to_ne_bytes());
        buf.extend_from_slice(&msg_type.to_ne_bytes());
        buf.extend_from_slice(&[0u8; 2]);
        buf.extend_from_slice(&seq.to_ne_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        buf
    }

    fn error_reply(seq: u32, errno: i32) -> Vec<u8> {
        let mut buf = header_seq(20, NLMSG_ERROR, seq);
        buf.extend_from_slice(&(-errno).to_ne_bytes());
        buf
    }

    #[test]
    fn test_split_multiple() {
        let mut buf = header_seq(20, 16, 4);
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&header_seq(16, NLMSG_DONE, 4));

        let messages = split_messages(&buf).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].msg_type, 16);
        assert_eq!(messages[0].seq, 4);
        assert_eq!(messages[0].bytes.len(), 20);
        assert_eq!(messages[1].msg_type, NLMSG_DONE);
        assert_eq!(dump_status(&buf, 4), DumpStatus::Done);
        assert_eq!(dump_status(&buf, 5), DumpStatus::Running);
    }

    #[test]
    fn test_error_reply_ends_matching_dump() {
        let buf = error_reply(9, libc::EBUSY);
        assert_eq!(dump_status(&buf, 9), DumpStatus::Failed(libc::EBUSY));
        assert_eq!(dump_status(&buf, 8), DumpStatus::Running);
        assert_eq!(dump_status(&error_reply(9, 0), 9), DumpStatus::Done);
    }

    #[test]
    fn test_split_rejects_bad_length() {
        assert!(split_messages(&header(8, 16)).is_err());
        assert!(split_messages(&header(64, 16)).is_err());
        assert!(split_messages(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_unsupported_types() {
        // RTM_NEWRULE
        let buf = header(16, 32);
        let messages = split_messages(&buf).unwrap();
        assert_eq!(decode(&messages[0]), Decoded::Unsupported(32));
        assert!(!is_captured_type(NLMSG_ERROR));
        assert!(is_captured_type(nla_msg::opcode::RTM_NEWLINK));
    }
}
