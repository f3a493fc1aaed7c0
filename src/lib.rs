//! Navigator - Kubernetes-native operator for stateful database clusters
//!
//! Navigator manages Elasticsearch and Cassandra clusters running on
//! Kubernetes. This crate contains the Pilot: a per-pod sidecar control loop
//! that supervises a single database process (start, health-check,
//! reconfigure, graceful stop) while participating in the cluster-wide
//! reconciliation protocol driven by the Pilot custom resource.
//!
//! # Architecture
//!
//! Each database pod runs a pilot sidecar that:
//! - Watches Pilot resources and reconciles the one matching its own pod
//! - Runs lifecycle hooks around process start/stop (PreStart, PostStart,
//!   PreStop, PostStop)
//! - Queries the database's administrative interface to derive node
//!   membership and version information
//! - Writes observed state back to the Pilot's status subresource
//!
//! # Modules
//!
//! - [`crd`] - Pilot Custom Resource Definition
//! - [`controller`] - Pilot reconciler, work queue and scheduled resync
//! - [`hook`] - Lifecycle hook phase engine
//! - [`process`] - External database process supervision
//! - [`cassandra`] - Cassandra admin client, node-status model and strategy
//! - [`elasticsearch`] - Elasticsearch strategy
//! - [`version`] - Tolerant database version parsing
//! - [`probe`] - Liveness/readiness probe HTTP servers
//! - [`leader`] - Lease-based leader election
//! - [`events`] - Kubernetes Event publishing
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod cassandra;
pub mod controller;
pub mod crd;
pub mod elasticsearch;
pub mod error;
pub mod events;
pub mod hook;
pub mod leader;
pub mod probe;
pub mod process;
pub mod retry;
pub mod version;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Centralizing defaults here keeps CLI flags, server configs and test
// fixtures consistent.

/// Default period after which a synced Pilot key is re-queued
pub const DEFAULT_RESYNC_PERIOD_SECS: u64 = 10;

/// Default port for the liveness probe HTTP server
pub const DEFAULT_LIVENESS_PORT: u16 = 12000;

/// Default port for the readiness probe HTTP server
pub const DEFAULT_READINESS_PORT: u16 = 12001;

/// Default name of the leader-election Lease
pub const DEFAULT_LEADER_LEASE_NAME: &str = "navigator-pilot-leader";
