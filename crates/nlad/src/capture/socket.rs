//! Route-netlink multicast socket
//!
//! One `NETLINK_ROUTE` socket subscribed to the link, neighbor, address and
//! route groups, driven by tokio `AsyncFd`.

/// Multicast groups captured
pub const RTNLGRP_LINK: u32 = 1;
pub const RTNLGRP_NEIGH: u32 = 3;
pub const RTNLGRP_IPV4_IFADDR: u32 = 5;
pub const RTNLGRP_IPV4_ROUTE: u32 = 7;
pub const RTNLGRP_IPV6_IFADDR: u32 = 9;
pub const RTNLGRP_IPV6_ROUTE: u32 = 11;
pub const RTNLGRP_MPLS_ROUTE: u32 = 27;

pub const CAPTURE_GROUPS: [u32; 7] = [
    RTNLGRP_LINK,
    RTNLGRP_NEIGH,
    RTNLGRP_IPV4_IFADDR,
    RTNLGRP_IPV4_ROUTE,
    RTNLGRP_IPV6_IFADDR,
    RTNLGRP_IPV6_ROUTE,
    RTNLGRP_MPLS_ROUTE,
];

/// Bind mask for a set of groups.
pub fn group_mask(groups: &[u32]) -> u32 {
    groups
        .iter()
        .filter(|g| (1..=32).contains(*g))
        .fold(0, |mask, g| mask | (1 << (g - 1)))
}

/// Table requested by a dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind {
    Link,
    Addr,
    Neigh,
    Route,
    /// `AF_BRIDGE` links with their VLAN lists
    BridgeVlan,
}

impl DumpKind {
    /// Links first so later dumps can be correlated with known interfaces.
    pub const ALL: [DumpKind; 5] = [
        DumpKind::Link,
        DumpKind::Addr,
        DumpKind::Neigh,
        DumpKind::Route,
        DumpKind::BridgeVlan,
    ];
}

#[cfg(target_os = "linux")]
mod linux {
    use super::{group_mask, DumpKind, CAPTURE_GROUPS};
    use crate::error::{NladError, Result};
    use netlink_packet_core::{NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_DUMP, NLM_F_REQUEST};
    use netlink_packet_route::address::AddressMessage;
    use netlink_packet_route::link::{LinkAttribute, LinkExtentMask, LinkMessage};
    use netlink_packet_route::neighbour::NeighbourMessage;
    use netlink_packet_route::route::RouteMessage;
    use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
    use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use tokio::io::unix::AsyncFd;
    use tracing::{debug, warn};

    pub struct NetlinkSocket {
        socket: Socket,
        seq: u32,
    }

    impl NetlinkSocket {
        /// Creates the socket and subscribes to every captured group.
        pub fn new(recv_buf: usize) -> Result<Self> {
            let mut socket = Socket::new(NETLINK_ROUTE)
                .map_err(|e| NladError::Netlink(format!("Failed to create socket: {}", e)))?;

            let groups = group_mask(&CAPTURE_GROUPS);
            socket
                .bind(&SocketAddr::new(0, groups))
                .map_err(|e| NladError::Netlink(format!("Failed to bind socket: {}", e)))?;
            debug!(groups = format_args!("{:#x}", groups), "Netlink socket bound");

            let nl_socket = Self { socket, seq: 0 };
            nl_socket.tune_socket(recv_buf);
            Ok(nl_socket)
        }

        fn set_nonblocking(&self) -> Result<()> {
            self.socket
                .set_non_blocking(true)
                .map_err(|e| NladError::Netlink(format!("Failed to set non-blocking mode: {}", e)))
        }

        fn tune_socket(&self, recv_buf: usize) {
            let fd = self.socket.as_raw_fd();

            unsafe {
                let size = recv_buf as libc::c_int;
                let ret = libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_RCVBUF,
                    &size as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
                if ret < 0 {
                    warn!("Failed to set SO_RCVBUF, using default buffer size");
                } else {
                    debug!(size = recv_buf, "Set socket receive buffer");
                }
            }
        }

        pub fn as_raw_fd(&self) -> i32 {
            self.socket.as_raw_fd()
        }

        /// Sends one dump request and returns its sequence number. Replies
        /// arrive on this socket and end with `NLMSG_DONE` or an error.
        pub fn request_dump(&mut self, kind: DumpKind) -> Result<u32> {
            self.seq = self.seq.wrapping_add(1);

            let mut header = NetlinkHeader::default();
            header.flags = NLM_F_REQUEST | NLM_F_DUMP;
            header.sequence_number = self.seq;

            let payload = match kind {
                DumpKind::Link => RouteNetlinkMessage::GetLink(LinkMessage::default()),
                DumpKind::Addr => RouteNetlinkMessage::GetAddress(AddressMessage::default()),
                DumpKind::Neigh => RouteNetlinkMessage::GetNeighbour(NeighbourMessage::default()),
                DumpKind::Route => RouteNetlinkMessage::GetRoute(RouteMessage::default()),
                DumpKind::BridgeVlan => {
                    let mut link = LinkMessage::default();
                    link.header.interface_family = AddressFamily::Bridge;
                    link.attributes
                        .push(LinkAttribute::ExtMask(vec![LinkExtentMask::Brvlan]));
                    RouteNetlinkMessage::GetLink(link)
                }
            };
            let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(payload));
            packet.finalize();

            let mut buf = vec![0u8; packet.buffer_len()];
            packet.serialize(&mut buf);

            self.socket
                .send(&buf, 0)
                .map_err(|e| NladError::Netlink(format!("Failed to send dump request: {}", e)))?;

            debug!(kind = ?kind, seq = self.seq, "Requested dump");
            Ok(self.seq)
        }
    }

    /// Async wrapper over a dup of the socket fd.
    pub struct AsyncNetlinkSocket {
        inner: AsyncFd<OwnedFd>,
        socket: NetlinkSocket,
    }

    impl AsyncNetlinkSocket {
        pub fn new(recv_buf: usize) -> Result<Self> {
            let socket = NetlinkSocket::new(recv_buf)?;
            socket.set_nonblocking()?;

            // Dup the fd so Socket retains ownership
            let fd = socket.as_raw_fd();
            let owned_fd = unsafe {
                let new_fd = libc::dup(fd);
                if new_fd < 0 {
                    return Err(NladError::Netlink("Failed to dup fd".into()));
                }
                OwnedFd::from_raw_fd(new_fd)
            };

            let inner = AsyncFd::new(owned_fd)
                .map_err(|e| NladError::Netlink(format!("Failed to create AsyncFd: {}", e)))?;

            Ok(Self { inner, socket })
        }

        /// Reads one datagram. Errors carry the raw errno for the caller
        /// to classify; `WouldBlock` never escapes.
        pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                let mut guard = self.inner.readable().await?;
                match guard.try_io(|fd| {
                    nix::sys::socket::recv(
                        fd.get_ref().as_raw_fd(),
                        buf,
                        nix::sys::socket::MsgFlags::empty(),
                    )
                    .map_err(io::Error::from)
                }) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        }

        pub fn request_dump(&mut self, kind: DumpKind) -> Result<u32> {
            self.socket.request_dump(kind)
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::*;
