//! Logging service: one debug line per envelope, per-kind counters.

use crate::service::NlaService;
use async_trait::async_trait;
use nla_msg::{
    Addr, BridgeVlanInfo, Envelope, Group, HandlerResult, Link, MsgHeader, Neigh, NetlinkHandler,
    Node, Route, Vpn,
};
use std::collections::HashMap;
use tracing::{debug, info, trace};

#[derive(Debug, Default)]
pub struct LogService {
    counts: HashMap<Group, u64>,
}

impl LogService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Envelopes seen for one kind
    pub fn count(&self, group: Group) -> u64 {
        self.counts.get(&group).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}

impl NetlinkHandler for LogService {
    fn on_message(&mut self, envelope: &Envelope) -> HandlerResult {
        *self.counts.entry(envelope.group()).or_insert(0) += 1;
        debug!(envelope = %envelope, "Envelope");
        Ok(())
    }

    fn on_link(&mut self, header: &MsgHeader, link: &Link) -> HandlerResult {
        trace!(
            %header,
            index = link.index,
            name = %link.name,
            oper_state = ?link.oper_state,
            "Link"
        );
        Ok(())
    }

    fn on_addr(&mut self, header: &MsgHeader, addr: &Addr) -> HandlerResult {
        trace!(%header, index = addr.index, address = %addr.address, "Addr");
        Ok(())
    }

    fn on_neigh(&mut self, header: &MsgHeader, neigh: &Neigh) -> HandlerResult {
        trace!(
            %header,
            index = neigh.index,
            ip = ?neigh.ip,
            hw_addr = ?neigh.hw_addr,
            vlan = ?neigh.vlan,
            "Neigh"
        );
        Ok(())
    }

    fn on_route(&mut self, header: &MsgHeader, route: &Route) -> HandlerResult {
        trace!(%header, dst = ?route.dst, gw = ?route.gw, oif = ?route.oif, "Route");
        Ok(())
    }

    fn on_node(&mut self, header: &MsgHeader, node: &Node) -> HandlerResult {
        info!(%header, ip = %node.ip, "Node");
        Ok(())
    }

    fn on_vpn(&mut self, header: &MsgHeader, vpn: &Vpn) -> HandlerResult {
        trace!(%header, dst = %vpn.dst, vpn_gw = %vpn.vpn_gw, label = vpn.label, "Vpn");
        Ok(())
    }

    fn on_bridge_vlan(&mut self, header: &MsgHeader, brvlan: &BridgeVlanInfo) -> HandlerResult {
        trace!(%header, index = brvlan.index, vid = brvlan.vid, port_type = ?brvlan.port_type(), "BridgeVlan");
        Ok(())
    }
}

#[async_trait]
impl NlaService for LogService {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn stop(&mut self) {
        info!(total = self.total(), "Log service stopped");
    }
}
