//! Cluster netlink state agent
//!
//! Every node captures its kernel's link, address, neighbor and route
//! events and fans them out to a fixed set of services. One node (nid 0)
//! is the master: it merges the streams of all slaves and serves the result
//! to subscribers. Slaves forward their local events to the master and
//! apply modifications the master routes back to them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐    ┌──────────────────────────┐       ┌─────────────┐
//! │   Kernel    │    │        NodeManager       │       │  Master     │
//! │  (netlink)  │───▶│ local ─┐                 │       │  ApiServer  │
//! └─────────────┘    │        ├─▶ Log          │──────▶│ (Submit)    │
//!   CaptureSource    │ api ───┘   Reapply      │ Slave │             │
//!                    │            Master|Slave │◀──────│ (Modify)    │
//!                    └──────────────────────────┘       └─────────────┘
//! ```

pub mod api;
pub mod capture;
pub mod config;
pub mod daemon;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod metrics_server;
pub mod service;
pub mod services;

pub use config::{NladConfig, Role};
pub use daemon::Daemon;
pub use error::{NladError, Result};
pub use manager::NodeManager;
pub use metrics::NladMetrics;
pub use service::{NlaChannels, NlaReceivers, NlaService, ServiceContext};
