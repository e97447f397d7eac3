//! Services registered with the node manager.
//!
//! Every node runs [`LogService`] and [`ReapplyService`]; the role adds
//! either [`MasterService`] or [`SlaveService`].

pub mod log;
pub mod master;
pub mod reapply;
pub mod slave;

pub use self::log::LogService;
pub use master::MasterService;
pub use reapply::{FdbOp, KernelWriter, NetlinkKernelWriter, ReapplyService};
pub use slave::SlaveService;
