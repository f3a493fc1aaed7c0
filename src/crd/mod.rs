//! Custom Resource Definitions for Navigator
//!
//! The Pilot resource represents one supervised database instance's
//! desired and observed state. Pilots are created by the cluster-level
//! controllers (one per member pod) and reconciled by the pilot sidecar
//! running in that pod.

mod pilot;
mod types;

pub use pilot::{controller_ref, same_controller, Pilot, PilotSpec, PilotStatus};
pub use types::{
    CassandraPilotSpec, CassandraPilotStatus, ElasticsearchPilotSpec, ElasticsearchPilotStatus,
    PilotCondition, PilotConditionStatus, PilotPhase,
};
