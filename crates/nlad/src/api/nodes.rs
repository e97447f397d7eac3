//! Connected slaves, keyed by node id.

use crate::error::{NladError, Result};
use nla_msg::{Envelope, NodeId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct SlaveEntry {
    pub ip: IpAddr,
    modify: mpsc::Sender<Envelope>,
}

/// Mutex-guarded table of live slave connections.
#[derive(Debug, Default)]
pub struct NodeTable {
    nodes: Mutex<HashMap<NodeId, SlaveEntry>>,
}

impl NodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a slave; a second connection with the same nid is refused.
    pub fn insert(&self, nid: NodeId, ip: IpAddr, modify: mpsc::Sender<Envelope>) -> Result<()> {
        let mut nodes = self.nodes.lock();
        if nodes.contains_key(&nid) {
            return Err(NladError::DuplicateNode(nid));
        }
        nodes.insert(nid, SlaveEntry { ip, modify });
        Ok(())
    }

    pub fn remove(&self, nid: NodeId) -> Option<SlaveEntry> {
        self.nodes.lock().remove(&nid)
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }

    pub fn nids(&self) -> Vec<NodeId> {
        let mut nids: Vec<NodeId> = self.nodes.lock().keys().copied().collect();
        nids.sort();
        nids
    }

    /// Hands a modification to the slave(s) it targets: the envelope's nid,
    /// or every slave for [`NodeId::ALL`]. Returns how many accepted it.
    pub fn route(&self, envelope: &Envelope) -> usize {
        let target = envelope.nid();
        let targets: Vec<(NodeId, mpsc::Sender<Envelope>)> = self
            .nodes
            .lock()
            .iter()
            .filter(|(nid, _)| nid.accepts(target))
            .map(|(nid, entry)| (*nid, entry.modify.clone()))
            .collect();

        let mut delivered = 0;
        for (nid, sender) in targets {
            match sender.try_send(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(nid = %nid, error = %e, "Modify not delivered to slave"),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nla_msg::opcode::RTM_SETLINK;
    use nla_msg::{Link, Payload, Source};

    fn modify(nid: NodeId) -> Envelope {
        Envelope::new(RTM_SETLINK, nid, Source::Api, Payload::Link(Link::new(4, "eth0"))).unwrap()
    }

    #[test]
    fn test_duplicate_rejected() {
        let table = NodeTable::new();
        let (tx, _rx) = mpsc::channel(1);
        let ip: IpAddr = "10.0.0.3".parse().unwrap();
        table.insert(NodeId(3), ip, tx.clone()).unwrap();
        assert!(matches!(
            table.insert(NodeId(3), ip, tx),
            Err(NladError::DuplicateNode(NodeId(3)))
        ));
        assert_eq!(table.len(), 1);
        assert!(table.remove(NodeId(3)).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_route_to_target_and_all() {
        let table = NodeTable::new();
        let (tx3, mut rx3) = mpsc::channel(4);
        let (tx4, mut rx4) = mpsc::channel(4);
        table.insert(NodeId(3), "10.0.0.3".parse().unwrap(), tx3).unwrap();
        table.insert(NodeId(4), "10.0.0.4".parse().unwrap(), tx4).unwrap();

        assert_eq!(table.route(&modify(NodeId(3))), 1);
        assert!(rx3.try_recv().is_ok());
        assert!(rx4.try_recv().is_err());

        assert_eq!(table.route(&modify(NodeId::ALL)), 2);
        assert!(rx3.try_recv().is_ok());
        assert!(rx4.try_recv().is_ok());

        assert_eq!(table.route(&modify(NodeId(9))), 0);
        assert_eq!(table.nids(), vec![NodeId(3), NodeId(4)]);
    }
}
