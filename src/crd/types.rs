//! Supporting types for the Pilot CRD

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::version::Version;

/// Lifecycle phases a pilot transitions through.
///
/// PreStart/PostStart fire around each process start, PreStop/PostStop
/// around each process stop. A restarted process fires the start phases
/// again for the same Pilot object.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum PilotPhase {
    /// Before the database process is started
    PreStart,
    /// After the database process has been started
    PostStart,
    /// Before the database process is stopped
    PreStop,
    /// After the database process has stopped
    PostStop,
}

impl PilotPhase {
    /// All phases, in lifecycle order
    pub const ALL: [PilotPhase; 4] = [
        PilotPhase::PreStart,
        PilotPhase::PostStart,
        PilotPhase::PreStop,
        PilotPhase::PostStop,
    ];
}

impl std::fmt::Display for PilotPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreStart => write!(f, "PreStart"),
            Self::PostStart => write!(f, "PostStart"),
            Self::PreStop => write!(f, "PreStop"),
            Self::PostStop => write!(f, "PostStop"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PilotConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for PilotConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for Pilot status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct PilotCondition {
    /// Type of condition (e.g. Started)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: PilotConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl PilotCondition {
    /// Condition type reporting whether the supervised process was started
    pub const STARTED: &'static str = "Started";

    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: PilotConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Cassandra-specific pilot configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CassandraPilotSpec {
    /// Port of the node's administrative (introspection) interface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_port: Option<u16>,
}

/// Elasticsearch-specific pilot configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchPilotSpec {
    /// Port of the node's HTTP interface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
}

/// Observed state of a supervised Cassandra node
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CassandraPilotStatus {
    /// Version reported by the node's administrative interface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,

    /// Number of cluster nodes visible from this node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_count: Option<u32>,
}

/// Observed state of a supervised Elasticsearch node
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchPilotStatus {
    /// Version reported by the node's HTTP interface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_display_matches_status_strings() {
        assert_eq!(PilotPhase::PreStart.to_string(), "PreStart");
        assert_eq!(PilotPhase::PostStop.to_string(), "PostStop");
    }

    #[test]
    fn phases_are_listed_in_lifecycle_order() {
        assert_eq!(
            PilotPhase::ALL,
            [
                PilotPhase::PreStart,
                PilotPhase::PostStart,
                PilotPhase::PreStop,
                PilotPhase::PostStop,
            ]
        );
    }

    #[test]
    fn condition_serializes_with_kubernetes_field_names() {
        let condition = PilotCondition::new(
            PilotCondition::STARTED,
            PilotConditionStatus::True,
            "ProcessRunning",
            "database process is running",
        );
        let json = serde_json::to_value(&condition).unwrap();
        assert_eq!(json["type"], "Started");
        assert_eq!(json["status"], "True");
        assert!(json["lastTransitionTime"].is_string());
    }

    #[test]
    fn cassandra_status_round_trips_version() {
        let status = CassandraPilotStatus {
            version: Some(Version::parse("3.9").unwrap()),
            node_count: Some(3),
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"3.9\""));
        let back: CassandraPilotStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
    }
}
