//! Master role: republish every envelope to the cluster API subscribers.

use crate::api::SubscriberSet;
use crate::service::NlaService;
use async_trait::async_trait;
use nla_msg::{Envelope, HandlerResult, NetlinkHandler};
use std::sync::Arc;
use tracing::trace;

pub struct MasterService {
    subscribers: Arc<SubscriberSet>,
    published: u64,
}

impl MasterService {
    pub fn new(subscribers: Arc<SubscriberSet>) -> Self {
        Self {
            subscribers,
            published: 0,
        }
    }

    pub fn published(&self) -> u64 {
        self.published
    }
}

impl NetlinkHandler for MasterService {
    fn on_message(&mut self, envelope: &Envelope) -> HandlerResult {
        let stats = self.subscribers.broadcast(envelope);
        self.published += 1;
        trace!(
            envelope = %envelope,
            sent = stats.sent,
            overflowed = stats.overflowed,
            dropped = stats.dropped,
            "Published"
        );
        Ok(())
    }
}

#[async_trait]
impl NlaService for MasterService {
    fn name(&self) -> &'static str {
        "master"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{SubscribeFilter, SubscriberLimits};
    use nla_msg::opcode::{RTM_NEWLINK, RTM_SETVPN};
    use nla_msg::{dispatch, Link, NodeId, Payload, Source, Vpn};

    #[test]
    fn test_republishes_every_source_unchanged() {
        let set = Arc::new(SubscriberSet::new(SubscriberLimits::default()));
        let mut sub = set.subscribe(SubscribeFilter::default()).unwrap();
        let mut service = MasterService::new(set.clone());

        let kernel = Envelope::new(
            RTM_NEWLINK,
            NodeId(3),
            Source::Kernel,
            Payload::Link(Link::new(4, "eth0")),
        )
        .unwrap()
        .with_seq(11);
        let api = Envelope::new(
            RTM_SETVPN,
            NodeId(2),
            Source::Api,
            Payload::Vpn(Vpn {
                dst: "100.100.1.0/24".parse().unwrap(),
                gw: "10.0.0.2".parse().unwrap(),
                vpn_gw: "2.2.2.2".parse().unwrap(),
                label: 20002,
            }),
        )
        .unwrap();

        dispatch(&kernel, &mut service).unwrap();
        dispatch(&api, &mut service).unwrap();

        assert!(sub.snapshot.is_empty());
        assert_eq!(*sub.events.try_recv().unwrap(), kernel);
        assert_eq!(*sub.events.try_recv().unwrap(), api);
        assert_eq!(service.published(), 2);
        assert_eq!(set.stored(), 2);
    }
}
