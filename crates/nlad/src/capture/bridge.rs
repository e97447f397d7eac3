//! Bridge port VLAN membership
//!
//! The kernel reports the whole VLAN list of a port on every change, with
//! contiguous runs compressed into `RANGE_BEGIN`/`RANGE_END` pairs. The
//! table keeps the last list per port and turns each report into per-VLAN
//! `RTM_NEWBRIDGE`/`RTM_DELBRIDGE` changes. Only access and trunk
//! memberships are reported; the bridge device's own VLANs are not.

use nla_msg::opcode::{RTM_DELBRIDGE, RTM_NEWBRIDGE};
use nla_msg::payload::{BRIDGE_VLAN_INFO_RANGE_BEGIN, BRIDGE_VLAN_INFO_RANGE_END};
use nla_msg::{BridgeVlanInfo, BridgeVlanPortType};
use std::collections::{BTreeMap, HashMap};

/// Message type and VLAN of one membership change
pub type VlanChange = (u16, BridgeVlanInfo);

/// Expands kernel `(vid, flags)` entries into one entry per VLAN, copying
/// the port fields from `port`.
pub fn expand_ranges(port: &BridgeVlanInfo, entries: &[(u16, u16)]) -> Vec<BridgeVlanInfo> {
    let range_flags = BRIDGE_VLAN_INFO_RANGE_BEGIN | BRIDGE_VLAN_INFO_RANGE_END;
    let mut vlans = Vec::new();
    let mut begin = None;

    for &(vid, flags) in entries {
        if flags & BRIDGE_VLAN_INFO_RANGE_BEGIN != 0 {
            begin = Some(vid);
            continue;
        }
        let first = if flags & BRIDGE_VLAN_INFO_RANGE_END != 0 {
            begin.take().unwrap_or(vid)
        } else {
            begin = None;
            vid
        };
        for vid in first..=vid {
            vlans.push(BridgeVlanInfo {
                vid,
                flags: flags & !range_flags,
                ..port.clone()
            });
        }
    }
    vlans
}

fn is_reported(vlan: &BridgeVlanInfo) -> bool {
    matches!(
        vlan.port_type(),
        BridgeVlanPortType::Access | BridgeVlanPortType::Trunk
    )
}

#[derive(Debug, Default)]
pub struct BridgeVlanTable {
    ports: HashMap<u32, BTreeMap<u16, BridgeVlanInfo>>,
}

impl BridgeVlanTable {
    /// Replaces the VLAN list of port `index`. VLANs that disappeared come
    /// first as deletions, then new or changed VLANs in vid order.
    pub fn update(&mut self, index: u32, vlans: Vec<BridgeVlanInfo>) -> Vec<VlanChange> {
        let current: BTreeMap<u16, BridgeVlanInfo> = vlans
            .into_iter()
            .filter(is_reported)
            .map(|vlan| (vlan.vid, vlan))
            .collect();
        let previous = self.ports.remove(&index).unwrap_or_default();

        let mut changes: Vec<VlanChange> = previous
            .iter()
            .filter(|(vid, _)| !current.contains_key(*vid))
            .map(|(_, vlan)| (RTM_DELBRIDGE, vlan.clone()))
            .collect();
        changes.extend(
            current
                .iter()
                .filter(|(vid, vlan)| previous.get(*vid) != Some(*vlan))
                .map(|(_, vlan)| (RTM_NEWBRIDGE, vlan.clone())),
        );

        if !current.is_empty() {
            self.ports.insert(index, current);
        }
        changes
    }

    /// The port left its bridge or was deleted.
    pub fn remove(&mut self, index: u32) -> Vec<VlanChange> {
        self.ports
            .remove(&index)
            .into_iter()
            .flat_map(BTreeMap::into_values)
            .map(|vlan| (RTM_DELBRIDGE, vlan))
            .collect()
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nla_msg::payload::{BRIDGE_VLAN_INFO_PVID, BRIDGE_VLAN_INFO_UNTAGGED};
    use pretty_assertions::assert_eq;

    fn port(index: u32, master_index: u32) -> BridgeVlanInfo {
        BridgeVlanInfo {
            index,
            name: format!("swp{}", index),
            master_index,
            ..Default::default()
        }
    }

    fn vids(changes: &[VlanChange], msg_type: u16) -> Vec<u16> {
        changes
            .iter()
            .filter(|(t, _)| *t == msg_type)
            .map(|(_, v)| v.vid)
            .collect()
    }

    #[test]
    fn test_expand_compressed_ranges() {
        let access = BRIDGE_VLAN_INFO_PVID | BRIDGE_VLAN_INFO_UNTAGGED;
        let vlans = expand_ranges(
            &port(4, 2),
            &[
                (1, access),
                (100, BRIDGE_VLAN_INFO_RANGE_BEGIN),
                (103, BRIDGE_VLAN_INFO_RANGE_END),
                (200, 0),
            ],
        );

        let listed: Vec<(u16, u16)> = vlans.iter().map(|v| (v.vid, v.flags)).collect();
        assert_eq!(
            listed,
            vec![(1, access), (100, 0), (101, 0), (102, 0), (103, 0), (200, 0)]
        );
        assert!(vlans.iter().all(|v| v.index == 4 && v.name == "swp4"));
    }

    #[test]
    fn test_update_reports_differences() {
        let mut table = BridgeVlanTable::default();
        let first = expand_ranges(&port(4, 2), &[(10, 0), (11, 0)]);
        let changes = table.update(4, first.clone());
        assert_eq!(vids(&changes, RTM_NEWBRIDGE), vec![10, 11]);

        // Same list again: nothing changed
        assert!(table.update(4, first).is_empty());

        // 10 removed, 12 added, 11 becomes the access VLAN
        let access = BRIDGE_VLAN_INFO_PVID | BRIDGE_VLAN_INFO_UNTAGGED;
        let changes = table.update(4, expand_ranges(&port(4, 2), &[(11, access), (12, 0)]));
        assert_eq!(vids(&changes, RTM_DELBRIDGE), vec![10]);
        assert_eq!(vids(&changes, RTM_NEWBRIDGE), vec![11, 12]);
        assert_eq!(changes[0].0, RTM_DELBRIDGE);
    }

    #[test]
    fn test_bridge_device_and_pvid_only_vlans_skipped() {
        let mut table = BridgeVlanTable::default();
        // The bridge itself: master index points at itself
        assert!(table
            .update(2, expand_ranges(&port(2, 2), &[(1, 0)]))
            .is_empty());
        // PVID without untagged is neither access nor trunk
        assert!(table
            .update(4, expand_ranges(&port(4, 2), &[(5, BRIDGE_VLAN_INFO_PVID)]))
            .is_empty());
        assert_eq!(table.port_count(), 0);
    }

    #[test]
    fn test_remove_port_deletes_its_vlans() {
        let mut table = BridgeVlanTable::default();
        table.update(4, expand_ranges(&port(4, 2), &[(10, 0), (20, 0)]));
        table.update(5, expand_ranges(&port(5, 2), &[(10, 0)]));

        let changes = table.remove(4);
        assert_eq!(vids(&changes, RTM_DELBRIDGE), vec![10, 20]);
        assert!(changes.iter().all(|(_, v)| v.index == 4));
        assert!(table.remove(4).is_empty());
        assert_eq!(table.port_count(), 1);
    }
}
