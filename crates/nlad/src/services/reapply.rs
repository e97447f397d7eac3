//! Local reapplication of cluster modifications
//!
//! Envelopes that arrive through the cluster API (`Source::Api`) and target
//! this node are written back into the local kernel. Only two kinds are
//! applied: link admin state (Link SET) and bridge FDB entries (Neigh
//! NEW/SET/DEL without an IP address). Everything else is ignored.

use crate::service::{NlaService, ServiceContext};
use async_trait::async_trait;
use nla_msg::{
    HandlerError, HandlerResult, Link, MsgHeader, Neigh, NetlinkHandler, NodeId, OperState,
    Operation, Source,
};
use std::io;
use tracing::{debug, info};

/// Bridge FDB write operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdbOp {
    Add,
    Replace,
    Delete,
}

/// Writes to the local kernel.
pub trait KernelWriter: Send {
    fn set_link_state(&mut self, index: u32, up: bool) -> io::Result<()>;

    fn write_fdb(&mut self, op: FdbOp, neigh: &Neigh) -> io::Result<()>;
}

pub struct ReapplyService {
    nid: NodeId,
    writer: Box<dyn KernelWriter>,
    applied: u64,
}

impl ReapplyService {
    pub fn new(nid: NodeId, writer: Box<dyn KernelWriter>) -> Self {
        Self {
            nid,
            writer,
            applied: 0,
        }
    }

    /// Modifications written to the kernel so far
    pub fn applied(&self) -> u64 {
        self.applied
    }

    fn targets_us(&self, header: &MsgHeader) -> bool {
        header.src == Source::Api && self.nid.accepts(header.nid)
    }
}

impl NetlinkHandler for ReapplyService {
    fn on_link(&mut self, header: &MsgHeader, link: &Link) -> HandlerResult {
        if !self.targets_us(header) || header.operation() != Some(Operation::Set) {
            return Ok(());
        }

        let up = match link.oper_state {
            OperState::Up => true,
            OperState::Down => false,
            other => {
                debug!(index = link.index, oper_state = ?other, "Link state not applied");
                return Ok(());
            }
        };

        self.writer
            .set_link_state(link.index, up)
            .map_err(HandlerError::Io)?;
        self.applied += 1;
        info!(index = link.index, name = %link.name, up, "Link state applied");
        Ok(())
    }

    fn on_neigh(&mut self, header: &MsgHeader, neigh: &Neigh) -> HandlerResult {
        if !self.targets_us(header) || !neigh.is_fdb_entry() {
            return Ok(());
        }
        if neigh.hw_addr.is_none() {
            return Err(HandlerError::Rejected(format!(
                "FDB entry on ifindex {} has no MAC address",
                neigh.index
            )));
        }

        let op = match header.operation() {
            Some(Operation::New) => FdbOp::Add,
            Some(Operation::Set) => FdbOp::Replace,
            Some(Operation::Del) => FdbOp::Delete,
            None => return Ok(()),
        };

        self.writer.write_fdb(op, neigh).map_err(HandlerError::Io)?;
        self.applied += 1;
        info!(index = neigh.index, hw_addr = ?neigh.hw_addr, vlan = ?neigh.vlan, op = ?op, "FDB entry applied");
        Ok(())
    }
}

#[async_trait]
impl NlaService for ReapplyService {
    fn name(&self) -> &'static str {
        "reapply"
    }

    async fn start(&mut self, ctx: &ServiceContext) -> crate::error::Result<()> {
        self.nid = ctx.nid;
        Ok(())
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::{FdbOp, KernelWriter};
    use crate::error::{NladError, Result};
    use netlink_packet_core::{NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_CREATE, NLM_F_REPLACE, NLM_F_REQUEST};
    use netlink_packet_route::link::{LinkFlags, LinkMessage};
    use netlink_packet_route::neighbour::{
        NeighbourAttribute, NeighbourFlags, NeighbourMessage, NeighbourState,
    };
    use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
    use netlink_sys::{protocols::NETLINK_ROUTE, Socket};
    use nla_msg::Neigh;
    use std::io;
    use std::os::fd::AsRawFd;

    /// NUD_PERMANENT
    const DEFAULT_FDB_STATE: u16 = 0x80;
    /// NTF_MASTER
    const DEFAULT_FDB_FLAGS: u8 = 0x04;

    /// Request/ack writer over its own unbound NETLINK_ROUTE socket.
    pub struct NetlinkKernelWriter {
        socket: Socket,
        seq: u32,
        buffer: Vec<u8>,
    }

    impl NetlinkKernelWriter {
        pub fn new() -> Result<Self> {
            let mut socket = Socket::new(NETLINK_ROUTE)
                .map_err(|e| NladError::Netlink(format!("Failed to create socket: {}", e)))?;
            socket
                .bind_auto()
                .map_err(|e| NladError::Netlink(format!("Failed to bind socket: {}", e)))?;
            Ok(Self {
                socket,
                seq: 0,
                buffer: vec![0u8; 8192],
            })
        }

        fn request(&mut self, message: RouteNetlinkMessage, flags: u16) -> io::Result<()> {
            self.seq = self.seq.wrapping_add(1);

            let mut header = NetlinkHeader::default();
            header.flags = NLM_F_REQUEST | NLM_F_ACK | flags;
            header.sequence_number = self.seq;

            let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(message));
            packet.finalize();
            let mut buf = vec![0u8; packet.buffer_len()];
            packet.serialize(&mut buf);
            self.socket.send(&buf, 0)?;

            loop {
                let len = nix::sys::socket::recv(
                    self.socket.as_raw_fd(),
                    &mut self.buffer,
                    nix::sys::socket::MsgFlags::empty(),
                )
                .map_err(io::Error::from)?;

                let reply = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&self.buffer[..len])
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                if reply.header.sequence_number != self.seq {
                    continue;
                }
                return match reply.payload {
                    NetlinkPayload::Error(err) => match err.code {
                        Some(code) => Err(io::Error::from_raw_os_error(-code.get())),
                        None => Ok(()),
                    },
                    _ => Ok(()),
                };
            }
        }
    }

    impl KernelWriter for NetlinkKernelWriter {
        fn set_link_state(&mut self, index: u32, up: bool) -> io::Result<()> {
            let mut link = LinkMessage::default();
            link.header.index = index;
            link.header.flags = if up { LinkFlags::Up } else { LinkFlags::empty() };
            link.header.change_mask = LinkFlags::Up;
            self.request(RouteNetlinkMessage::SetLink(link), 0)
        }

        fn write_fdb(&mut self, op: FdbOp, neigh: &Neigh) -> io::Result<()> {
            let mac = neigh
                .hw_addr
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "missing MAC"))?;

            let state = if neigh.state == 0 { DEFAULT_FDB_STATE } else { neigh.state };
            let flags = if neigh.flags == 0 { DEFAULT_FDB_FLAGS } else { neigh.flags };

            let mut msg = NeighbourMessage::default();
            msg.header.family = AddressFamily::Bridge;
            msg.header.ifindex = neigh.index;
            msg.header.state = NeighbourState::from(state);
            msg.header.flags = NeighbourFlags::from_bits_retain(flags);
            msg.attributes
                .push(NeighbourAttribute::LinkLocalAddress(mac.as_bytes().to_vec()));
            if let Some(vlan) = neigh.vlan {
                msg.attributes.push(NeighbourAttribute::Vlan(vlan));
            }

            match op {
                FdbOp::Add => self.request(
                    RouteNetlinkMessage::NewNeighbour(msg),
                    NLM_F_CREATE,
                ),
                FdbOp::Replace => self.request(
                    RouteNetlinkMessage::NewNeighbour(msg),
                    NLM_F_CREATE | NLM_F_REPLACE,
                ),
                FdbOp::Delete => {
                    self.request(RouteNetlinkMessage::DelNeighbour(msg), 0)
                }
            }
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::NetlinkKernelWriter;

/// Stand-in writer where the kernel cannot be written; every write fails.
#[cfg(not(target_os = "linux"))]
pub struct NetlinkKernelWriter;

#[cfg(not(target_os = "linux"))]
impl NetlinkKernelWriter {
    pub fn new() -> crate::error::Result<Self> {
        Ok(Self)
    }
}

#[cfg(not(target_os = "linux"))]
impl KernelWriter for NetlinkKernelWriter {
    fn set_link_state(&mut self, _index: u32, _up: bool) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "kernel writes need Linux"))
    }

    fn write_fdb(&mut self, _op: FdbOp, _neigh: &Neigh) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "kernel writes need Linux"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nla_msg::opcode::{RTM_DELNEIGH, RTM_NEWLINK, RTM_NEWNEIGH, RTM_SETLINK, RTM_SETNEIGH};
    use nla_msg::payload::AF_BRIDGE;
    use nla_msg::{dispatch, Envelope, MacAddress, Payload};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    enum Write {
        Link(u32, bool),
        Fdb(FdbOp, u32, Option<u16>),
    }

    #[derive(Clone, Default)]
    struct RecordingWriter {
        writes: Arc<Mutex<Vec<Write>>>,
        fail: bool,
    }

    impl KernelWriter for RecordingWriter {
        fn set_link_state(&mut self, index: u32, up: bool) -> io::Result<()> {
            if self.fail {
                return Err(io::Error::from_raw_os_error(libc::ENODEV));
            }
            self.writes.lock().push(Write::Link(index, up));
            Ok(())
        }

        fn write_fdb(&mut self, op: FdbOp, neigh: &Neigh) -> io::Result<()> {
            self.writes.lock().push(Write::Fdb(op, neigh.index, neigh.vlan));
            Ok(())
        }
    }

    fn service(nid: u8) -> (ReapplyService, Arc<Mutex<Vec<Write>>>) {
        let writer = RecordingWriter::default();
        let writes = writer.writes.clone();
        (ReapplyService::new(NodeId(nid), Box::new(writer)), writes)
    }

    fn link_env(msg_type: u16, nid: u8, src: Source, state: OperState) -> Envelope {
        let mut link = Link::new(4, "eth0");
        link.oper_state = state;
        Envelope::new(msg_type, NodeId(nid), src, Payload::Link(link)).unwrap()
    }

    fn fdb_env(msg_type: u16, nid: u8) -> Envelope {
        let neigh = Neigh {
            index: 7,
            family: AF_BRIDGE,
            hw_addr: Some(MacAddress::new([0, 1, 2, 3, 4, 5])),
            vlan: Some(100),
            ..Default::default()
        };
        Envelope::new(msg_type, NodeId(nid), Source::Api, Payload::Neigh(neigh)).unwrap()
    }

    #[test]
    fn test_link_set_applied() {
        let (mut svc, writes) = service(3);
        dispatch(&link_env(RTM_SETLINK, 3, Source::Api, OperState::Up), &mut svc).unwrap();
        dispatch(&link_env(RTM_SETLINK, 255, Source::Api, OperState::Down), &mut svc).unwrap();
        assert_eq!(*writes.lock(), vec![Write::Link(4, true), Write::Link(4, false)]);
        assert_eq!(svc.applied(), 2);
    }

    #[test]
    fn test_ignores_kernel_other_node_and_non_set() {
        let (mut svc, writes) = service(3);
        dispatch(&link_env(RTM_SETLINK, 3, Source::Kernel, OperState::Up), &mut svc).unwrap();
        dispatch(&link_env(RTM_SETLINK, 4, Source::Api, OperState::Up), &mut svc).unwrap();
        dispatch(&link_env(RTM_NEWLINK, 3, Source::Api, OperState::Up), &mut svc).unwrap();
        dispatch(&link_env(RTM_SETLINK, 3, Source::Api, OperState::Dormant), &mut svc).unwrap();
        assert!(writes.lock().is_empty());
    }

    #[test]
    fn test_fdb_operations() {
        let (mut svc, writes) = service(3);
        dispatch(&fdb_env(RTM_NEWNEIGH, 3), &mut svc).unwrap();
        dispatch(&fdb_env(RTM_SETNEIGH, 3), &mut svc).unwrap();
        dispatch(&fdb_env(RTM_DELNEIGH, 3), &mut svc).unwrap();
        assert_eq!(
            *writes.lock(),
            vec![
                Write::Fdb(FdbOp::Add, 7, Some(100)),
                Write::Fdb(FdbOp::Replace, 7, Some(100)),
                Write::Fdb(FdbOp::Delete, 7, Some(100)),
            ]
        );
    }

    #[test]
    fn test_ip_neighbor_not_applied() {
        let (mut svc, writes) = service(3);
        let neigh = Neigh {
            index: 7,
            family: 2,
            ip: Some("10.0.0.9".parse().unwrap()),
            hw_addr: Some(MacAddress::new([0, 1, 2, 3, 4, 5])),
            ..Default::default()
        };
        let env = Envelope::new(RTM_NEWNEIGH, NodeId(3), Source::Api, Payload::Neigh(neigh)).unwrap();
        dispatch(&env, &mut svc).unwrap();
        assert!(writes.lock().is_empty());
    }

    #[test]
    fn test_writer_error_surfaces() {
        let writer = RecordingWriter {
            fail: true,
            ..Default::default()
        };
        let mut svc = ReapplyService::new(NodeId(3), Box::new(writer));
        let result = dispatch(&link_env(RTM_SETLINK, 3, Source::Api, OperState::Up), &mut svc);
        assert!(matches!(result, Err(HandlerError::Io(_))));
        assert_eq!(svc.applied(), 0);
    }
}
