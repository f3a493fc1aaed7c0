//! Node membership and reachability derived from an admin snapshot
//!
//! [`compute_node_map`] turns the raw sets reported by the administrative
//! interface into a consistent per-host view, rejecting snapshots that
//! violate the model's invariants:
//!
//! - live and unreachable sets must be disjoint
//! - leaving, joining and moving sets must be pairwise disjoint
//! - every host referenced by any status set must appear in the host-id map
//! - at most one node is local (id equal to the reported local host id)
//!
//! No partial map is ever returned: any invariant violation abandons the
//! whole computation.

use std::collections::BTreeMap;

use crate::cassandra::AdminStatus;
use crate::Error;

/// Ring membership state of a node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NodeState {
    /// Stable ring member
    #[default]
    Normal,
    /// Leaving the ring
    Leaving,
    /// Joining the ring
    Joining,
    /// Moving tokens
    Moving,
}

/// Reachability of a node as seen from the queried node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NodeStatus {
    /// Not present in either the live or unreachable set
    #[default]
    Unknown,
    /// Present in the live set
    Up,
    /// Present in the unreachable set
    Down,
}

/// Derived view of a single cluster node
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Node {
    /// Host address the node is keyed by
    pub host: String,
    /// Unique host id
    pub id: String,
    /// Ring membership state
    pub state: NodeState,
    /// Reachability
    pub status: NodeStatus,
    /// True iff this entry describes the queried node itself
    pub local: bool,
}

/// Mapping from host address to derived node view
pub type NodeMap = BTreeMap<String, Node>;

/// Derive a consistent node map from an administrative snapshot.
///
/// Returns an empty map (not an error) when the snapshot itself is empty.
pub fn compute_node_map(status: &AdminStatus) -> crate::Result<NodeMap> {
    validate(status)?;

    let mut map = NodeMap::new();
    for (host, id) in &status.host_id_map {
        let node_status = if status.live_nodes.contains(host) {
            NodeStatus::Up
        } else if status.unreachable_nodes.contains(host) {
            NodeStatus::Down
        } else {
            NodeStatus::Unknown
        };

        // The membership sets are disjoint after validation, so first
        // match wins without ambiguity.
        let state = if status.leaving_nodes.contains(host) {
            NodeState::Leaving
        } else if status.joining_nodes.contains(host) {
            NodeState::Joining
        } else if status.moving_nodes.contains(host) {
            NodeState::Moving
        } else {
            NodeState::Normal
        };

        let local = status.local_host_id.as_deref() == Some(id.as_str());

        map.insert(
            host.clone(),
            Node {
                host: host.clone(),
                id: id.clone(),
                state,
                status: node_status,
                local,
            },
        );
    }
    Ok(map)
}

fn validate(status: &AdminStatus) -> crate::Result<()> {
    let overlap = intersection(&status.live_nodes, &status.unreachable_nodes);
    if !overlap.is_empty() {
        return Err(Error::validation(format!(
            "live nodes {:?} and unreachable nodes {:?} overlap on {:?}",
            status.live_nodes, status.unreachable_nodes, overlap
        )));
    }

    for (set_name, set) in [
        ("live", &status.live_nodes),
        ("unreachable", &status.unreachable_nodes),
    ] {
        let unmapped = unmapped_hosts(set, status);
        if !unmapped.is_empty() {
            return Err(Error::validation(format!(
                "{set_name} nodes {unmapped:?} are not present in the host id map"
            )));
        }
    }

    let membership = [
        ("leaving", &status.leaving_nodes),
        ("joining", &status.joining_nodes),
        ("moving", &status.moving_nodes),
    ];
    for i in 0..membership.len() {
        for j in (i + 1)..membership.len() {
            let (name_a, set_a) = membership[i];
            let (name_b, set_b) = membership[j];
            let overlap = intersection(set_a, set_b);
            if !overlap.is_empty() {
                return Err(Error::validation(format!(
                    "{name_a} nodes {set_a:?} and {name_b} nodes {set_b:?} overlap on {overlap:?}"
                )));
            }
        }
    }
    for (set_name, set) in membership {
        let unmapped = unmapped_hosts(set, status);
        if !unmapped.is_empty() {
            return Err(Error::validation(format!(
                "{set_name} nodes {unmapped:?} are not present in the host id map"
            )));
        }
    }

    Ok(())
}

fn intersection(a: &[String], b: &[String]) -> Vec<String> {
    a.iter().filter(|host| b.contains(host)).cloned().collect()
}

fn unmapped_hosts(set: &[String], status: &AdminStatus) -> Vec<String> {
    set.iter()
        .filter(|host| !status.host_id_map.contains_key(*host))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> AdminStatus {
        AdminStatus {
            host_id_map: [("10.0.0.1".to_string(), "id-1".to_string())].into(),
            ..Default::default()
        }
    }

    #[test]
    fn empty_snapshot_yields_empty_map() {
        let map = compute_node_map(&AdminStatus::default()).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn mapped_host_defaults_to_unknown_normal_non_local() {
        let map = compute_node_map(&snapshot()).unwrap();
        let node = &map["10.0.0.1"];
        assert_eq!(node.id, "id-1");
        assert_eq!(node.status, NodeStatus::Unknown);
        assert_eq!(node.state, NodeState::Normal);
        assert!(!node.local);
    }

    #[test]
    fn live_and_unreachable_overlap_is_rejected() {
        let mut status = snapshot();
        status.live_nodes = vec!["10.0.0.1".to_string()];
        status.unreachable_nodes = vec!["10.0.0.1".to_string()];

        let err = compute_node_map(&status).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("live"), "got: {text}");
        assert!(text.contains("unreachable"), "got: {text}");
    }

    #[test]
    fn unmapped_live_host_is_rejected() {
        let status = AdminStatus {
            live_nodes: vec!["10.0.0.9".to_string()],
            ..Default::default()
        };
        let err = compute_node_map(&status).unwrap_err();
        assert!(err.to_string().contains("10.0.0.9"));
        assert!(err.to_string().contains("host id map"));
    }

    #[test]
    fn unmapped_membership_host_is_rejected() {
        let status = AdminStatus {
            joining_nodes: vec!["10.0.0.9".to_string()],
            ..Default::default()
        };
        let err = compute_node_map(&status).unwrap_err();
        assert!(err.to_string().contains("joining"));
    }

    #[test]
    fn overlapping_membership_sets_are_rejected() {
        let mut status = snapshot();
        status.leaving_nodes = vec!["10.0.0.1".to_string()];
        status.moving_nodes = vec!["10.0.0.1".to_string()];

        let err = compute_node_map(&status).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("leaving"), "got: {text}");
        assert!(text.contains("moving"), "got: {text}");
    }

    #[test]
    fn statuses_and_states_are_assigned_per_set() {
        let status = AdminStatus {
            host_id_map: [
                ("a".to_string(), "id-a".to_string()),
                ("b".to_string(), "id-b".to_string()),
                ("c".to_string(), "id-c".to_string()),
            ]
            .into(),
            live_nodes: vec!["a".to_string()],
            unreachable_nodes: vec!["b".to_string()],
            leaving_nodes: vec!["a".to_string()],
            joining_nodes: vec!["b".to_string()],
            moving_nodes: vec!["c".to_string()],
            ..Default::default()
        };

        let map = compute_node_map(&status).unwrap();
        assert_eq!(map["a"].status, NodeStatus::Up);
        assert_eq!(map["a"].state, NodeState::Leaving);
        assert_eq!(map["b"].status, NodeStatus::Down);
        assert_eq!(map["b"].state, NodeState::Joining);
        assert_eq!(map["c"].status, NodeStatus::Unknown);
        assert_eq!(map["c"].state, NodeState::Moving);
    }

    #[test]
    fn local_flag_set_on_matching_host_id() {
        let mut status = snapshot();
        status.local_host_id = Some("id-1".to_string());

        let map = compute_node_map(&status).unwrap();
        assert!(map["10.0.0.1"].local);
    }

    #[test]
    fn at_most_one_node_is_local() {
        let status = AdminStatus {
            host_id_map: [
                ("a".to_string(), "id-a".to_string()),
                ("b".to_string(), "id-b".to_string()),
            ]
            .into(),
            local_host_id: Some("id-a".to_string()),
            ..Default::default()
        };
        let map = compute_node_map(&status).unwrap();
        let locals = map.values().filter(|n| n.local).count();
        assert_eq!(locals, 1);
        assert!(map["a"].local);
        assert!(!map["b"].local);
    }
}
