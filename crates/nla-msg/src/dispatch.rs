//! Double dispatch of an envelope onto a typed handler.

use crate::envelope::{Envelope, MsgHeader};
use crate::error::HandlerError;
use crate::payload::{Addr, BridgeVlanInfo, Link, Neigh, Node, Payload, Route, Vpn};

/// Result of a single handler invocation.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Capability interface implemented by every consumer of the event stream.
///
/// All methods default to no-op so a consumer only implements the kinds it
/// cares about.
#[allow(unused_variables)]
pub trait NetlinkHandler {
    /// Called for every envelope before the typed handler.
    fn on_message(&mut self, envelope: &Envelope) -> HandlerResult {
        Ok(())
    }

    fn on_link(&mut self, header: &MsgHeader, link: &Link) -> HandlerResult {
        Ok(())
    }

    fn on_addr(&mut self, header: &MsgHeader, addr: &Addr) -> HandlerResult {
        Ok(())
    }

    fn on_neigh(&mut self, header: &MsgHeader, neigh: &Neigh) -> HandlerResult {
        Ok(())
    }

    fn on_route(&mut self, header: &MsgHeader, route: &Route) -> HandlerResult {
        Ok(())
    }

    fn on_node(&mut self, header: &MsgHeader, node: &Node) -> HandlerResult {
        Ok(())
    }

    fn on_vpn(&mut self, header: &MsgHeader, vpn: &Vpn) -> HandlerResult {
        Ok(())
    }

    fn on_bridge_vlan(&mut self, header: &MsgHeader, brvlan: &BridgeVlanInfo) -> HandlerResult {
        Ok(())
    }
}

/// Invokes `on_message` and then exactly one typed handler on `handler`.
pub fn dispatch<H>(envelope: &Envelope, handler: &mut H) -> HandlerResult
where
    H: NetlinkHandler + ?Sized,
{
    handler.on_message(envelope)?;

    let header = envelope.header();
    match envelope.payload() {
        Payload::Link(link) => handler.on_link(header, link),
        Payload::Addr(addr) => handler.on_addr(header, addr),
        Payload::Neigh(neigh) => handler.on_neigh(header, neigh),
        Payload::Route(route) => handler.on_route(header, route),
        Payload::Node(node) => handler.on_node(header, node),
        Payload::Vpn(vpn) => handler.on_vpn(header, vpn),
        Payload::BridgeVlan(brvlan) => handler.on_bridge_vlan(header, brvlan),
    }
}
