//! Event model for cluster-wide netlink state synchronization.
//!
//! - [`Envelope`]: node of origin, [`Source`], sequence and one [`Payload`]
//! - [`dispatch`]: double dispatch onto a [`NetlinkHandler`]
//! - [`StateTable`]: last-writer-wins materialized view
//!
//! Message types reuse the kernel's route-netlink numbering and extend it
//! with synthetic codes for kinds the kernel does not know (see [`opcode`]).

pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod ip;
pub mod opcode;
pub mod payload;
pub mod table;
pub mod types;

pub use dispatch::{dispatch, HandlerResult, NetlinkHandler};
pub use envelope::{Envelope, MsgHeader};
pub use error::{HandlerError, MsgError, Result};
pub use ip::IpPrefix;
pub use opcode::{msg_type, msg_type_name, Group, Operation};
pub use payload::{
    Addr, BridgeVlanInfo, BridgeVlanPortType, EntityKey, Link, Neigh, Node, OperState, Payload,
    Route, Vpn,
};
pub use table::{StateTable, TableEntry};
pub use types::{MacAddress, NodeId, Source};
