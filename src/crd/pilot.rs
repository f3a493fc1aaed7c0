//! Pilot Custom Resource Definition
//!
//! A Pilot represents one supervised database instance. The cluster-level
//! controller creates one Pilot per member pod and links it to the owning
//! cluster resource via a controlling owner reference. The pilot sidecar
//! in that pod reconciles "its" Pilot and treats Pilots sharing the same
//! controlling owner as peers.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    CassandraPilotSpec, CassandraPilotStatus, ElasticsearchPilotSpec, ElasticsearchPilotStatus,
    PilotCondition, PilotPhase,
};

/// Specification for a Pilot
///
/// Exactly one of the database-specific sections is expected to be set,
/// matching the strategy the sidecar was started with.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "navigator.dev",
    version = "v1alpha1",
    kind = "Pilot",
    plural = "pilots",
    status = "PilotStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.lastCompletedPhase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PilotSpec {
    /// Cassandra pilot configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cassandra: Option<CassandraPilotSpec>,

    /// Elasticsearch pilot configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elasticsearch: Option<ElasticsearchPilotSpec>,
}

/// Observed state of a Pilot
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PilotStatus {
    /// Conditions representing the pilot state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<PilotCondition>,

    /// Most recent lifecycle phase whose hooks all completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed_phase: Option<PilotPhase>,

    /// Cassandra-specific observed state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cassandra: Option<CassandraPilotStatus>,

    /// Elasticsearch-specific observed state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elasticsearch: Option<ElasticsearchPilotStatus>,
}

impl PilotStatus {
    /// Upsert a condition, replacing any existing condition of the same type
    pub fn set_condition(&mut self, condition: PilotCondition) {
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
    }

    /// Look up a condition by type
    pub fn condition(&self, type_: &str) -> Option<&PilotCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

/// The controlling owner reference of a Pilot, if any.
///
/// Pilots are owned by their cluster resource; the owner identifies which
/// logical database cluster the pilot belongs to.
pub fn controller_ref(pilot: &Pilot) -> Option<&OwnerReference> {
    pilot
        .meta()
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|r| r.controller == Some(true))
}

/// Whether two owner references identify the same controller.
///
/// Compares name, UID, kind and apiVersion; two Pilots are peers iff their
/// controlling owners are the same by this comparison.
pub fn same_controller(a: &OwnerReference, b: &OwnerReference) -> bool {
    a.name == b.name && a.uid == b.uid && a.kind == b.kind && a.api_version == b.api_version
}
