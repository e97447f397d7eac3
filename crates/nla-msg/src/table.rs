//! Materialized last-writer-wins view of the dispatched stream.
//!
//! Downstream consumers (the monitor tool, route synchronizers) keep one of
//! these per process. Entries are keyed by `(nid, kind, key)`; the most
//! recently applied envelope for a key replaces the previous one.
//!
//! A `Node` DEL marks every other entity of that node stale instead of
//! removing it. Whether stale entities get flushed is the consumer's policy.

use crate::dispatch::{HandlerResult, NetlinkHandler};
use crate::envelope::Envelope;
use crate::opcode::{Group, Operation};
use crate::payload::{EntityKey, Payload};
use crate::types::NodeId;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    pub envelope: Envelope,
    pub stale: bool,
}

#[derive(Debug, Default)]
pub struct StateTable {
    entries: HashMap<EntityKey, TableEntry>,
    down_nodes: HashSet<NodeId>,
}

impl StateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one envelope in dispatch order.
    pub fn apply(&mut self, envelope: &Envelope) {
        if envelope.group() == Group::Node {
            self.apply_node(envelope);
            return;
        }

        let key = envelope.key();
        match envelope.operation() {
            Operation::New | Operation::Set => {
                let stale = self.down_nodes.contains(&envelope.nid());
                self.entries.insert(
                    key,
                    TableEntry {
                        envelope: envelope.clone(),
                        stale,
                    },
                );
            }
            Operation::Del => {
                self.entries.remove(&key);
            }
        }
    }

    fn apply_node(&mut self, envelope: &Envelope) {
        let nid = envelope.nid();
        match envelope.operation() {
            Operation::Del => {
                self.down_nodes.insert(nid);
                self.entries.remove(&envelope.key());
                self.set_stale(nid, true);
            }
            Operation::New | Operation::Set => {
                self.down_nodes.remove(&nid);
                self.set_stale(nid, false);
                self.entries.insert(
                    envelope.key(),
                    TableEntry {
                        envelope: envelope.clone(),
                        stale: false,
                    },
                );
            }
        }
    }

    fn set_stale(&mut self, nid: NodeId, stale: bool) {
        self.entries
            .values_mut()
            .filter(|e| e.envelope.nid() == nid)
            .for_each(|e| e.stale = stale);
    }

    pub fn get(&self, key: &EntityKey) -> Option<&TableEntry> {
        self.entries.get(key)
    }

    /// Payload currently held for `key`.
    pub fn payload(&self, key: &EntityKey) -> Option<&Payload> {
        self.entries.get(key).map(|e| e.envelope.payload())
    }

    pub fn is_stale(&self, key: &EntityKey) -> bool {
        self.entries.get(key).is_some_and(|e| e.stale)
    }

    pub fn is_node_down(&self, nid: NodeId) -> bool {
        self.down_nodes.contains(&nid)
    }

    pub fn entries_for(&self, nid: NodeId) -> impl Iterator<Item = (&EntityKey, &TableEntry)> {
        self.entries.iter().filter(move |(k, _)| k.nid == nid)
    }

    /// Envelopes of every live entity, nodes first so a reader learns about
    /// a node before its entities. Stale entities are left out.
    pub fn snapshot(&self) -> Vec<Envelope> {
        let mut live: Vec<(&EntityKey, &TableEntry)> =
            self.entries.iter().filter(|(_, e)| !e.stale).collect();
        live.sort_by(|(a, _), (b, _)| {
            (a.kind != Group::Node, a).cmp(&(b.kind != Group::Node, b))
        });
        live.into_iter().map(|(_, e)| e.envelope.clone()).collect()
    }

    pub fn stale_count(&self) -> usize {
        self.entries.values().filter(|e| e.stale).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl NetlinkHandler for StateTable {
    fn on_message(&mut self, envelope: &Envelope) -> HandlerResult {
        self.apply(envelope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::*;
    use crate::payload::{Link, Node, OperState, Vpn};
    use crate::types::Source;
    use pretty_assertions::assert_eq;

    fn vpn_env(msg_type: u16, label: u32) -> Envelope {
        Envelope::new(
            msg_type,
            NodeId(1),
            Source::Api,
            Payload::Vpn(Vpn {
                dst: "100.100.1.0/24".parse().unwrap(),
                gw: "10.0.0.1".parse().unwrap(),
                vpn_gw: "1.1.1.1".parse().unwrap(),
                label,
            }),
        )
        .unwrap()
    }

    fn link_env(msg_type: u16, nid: u8, state: OperState) -> Envelope {
        let mut link = Link::new(4, "eth0");
        link.oper_state = state;
        Envelope::new(msg_type, NodeId(nid), Source::Kernel, Payload::Link(link)).unwrap()
    }

    fn node_env(msg_type: u16, nid: u8) -> Envelope {
        Envelope::new(
            msg_type,
            NodeId(nid),
            Source::Api,
            Payload::Node(Node {
                ip: "192.168.0.3".parse().unwrap(),
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_last_writer_wins_vpn_label() {
        let mut table = StateTable::new();
        table.apply(&vpn_env(RTM_NEWVPN, 20001));
        table.apply(&vpn_env(RTM_SETVPN, 20002));

        assert_eq!(table.len(), 1);
        let key = vpn_env(RTM_NEWVPN, 0).key();
        match table.payload(&key) {
            Some(Payload::Vpn(vpn)) => assert_eq!(vpn.label, 20002),
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[test]
    fn test_delete_removes_entry() {
        let mut table = StateTable::new();
        table.apply(&link_env(RTM_NEWLINK, 3, OperState::Up));
        table.apply(&link_env(RTM_DELLINK, 3, OperState::Down));
        assert!(table.is_empty());
    }

    #[test]
    fn test_same_key_different_nodes_are_distinct() {
        let mut table = StateTable::new();
        table.apply(&link_env(RTM_NEWLINK, 1, OperState::Up));
        table.apply(&link_env(RTM_NEWLINK, 2, OperState::Down));
        assert_eq!(table.len(), 2);
        assert_eq!(table.entries_for(NodeId(1)).count(), 1);
    }

    #[test]
    fn test_node_down_marks_stale_without_deleting() {
        let mut table = StateTable::new();
        table.apply(&node_env(RTM_NEWNODE, 3));
        table.apply(&link_env(RTM_NEWLINK, 3, OperState::Up));
        table.apply(&link_env(RTM_NEWLINK, 4, OperState::Up));

        table.apply(&node_env(RTM_DELNODE, 3));
        let key = link_env(RTM_NEWLINK, 3, OperState::Up).key();
        assert!(table.is_stale(&key));
        assert!(table.is_node_down(NodeId(3)));
        assert_eq!(table.stale_count(), 1);
        assert_eq!(table.len(), 2);

        // Updates while down stay stale until the node returns.
        table.apply(&link_env(RTM_SETLINK, 3, OperState::Down));
        assert!(table.is_stale(&key));

        table.apply(&node_env(RTM_NEWNODE, 3));
        assert!(!table.is_stale(&key));
        assert_eq!(table.stale_count(), 0);
    }

    #[test]
    fn test_snapshot_lists_nodes_first_and_skips_stale() {
        let mut table = StateTable::new();
        table.apply(&link_env(RTM_NEWLINK, 3, OperState::Up));
        table.apply(&node_env(RTM_NEWNODE, 3));
        table.apply(&link_env(RTM_NEWLINK, 4, OperState::Up));
        table.apply(&node_env(RTM_NEWNODE, 4));

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 4);
        assert_eq!(snapshot[0].group(), Group::Node);
        assert_eq!(snapshot[1].group(), Group::Node);
        assert_eq!(snapshot[2].group(), Group::Link);

        table.apply(&node_env(RTM_DELNODE, 3));
        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|e| e.nid() == NodeId(4)));
    }
}
