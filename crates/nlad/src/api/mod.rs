//! Cluster API: master server, slave client and subscriber client.

pub mod client;
pub mod nodes;
pub mod protocol;
pub mod server;
pub mod subscriber;

pub use client::{ApiClient, ForwardError, ForwardHandle, SubscriberClient};
pub use nodes::NodeTable;
pub use protocol::{Frame, Hello, PeerRole, SessionTimeouts, SubscribeFilter};
pub use server::ApiServer;
pub use subscriber::{BroadcastStats, SubscriberLimits, SubscriberSet, Subscription};
