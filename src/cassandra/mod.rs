//! Cassandra pilot support
//!
//! Talks to the node's administrative (introspection) interface to derive
//! cluster membership, reachability and the running version, and provides
//! the Cassandra [`PilotStrategy`](crate::controller::PilotStrategy)
//! implementation.

mod client;
mod nodes;
mod strategy;

pub use client::{AdminClient, AdminStatus, DEFAULT_ADMIN_PORT};
pub use nodes::{compute_node_map, Node, NodeMap, NodeState, NodeStatus};
pub use strategy::CassandraStrategy;
