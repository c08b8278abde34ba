//! Types shared by both machine models

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Which model is authoritative for a machine
///
/// Read from the legacy machine's status. Transitions into and out of
/// `Migrating` are written by the migration controller only.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum AuthoritativeApi {
    /// Not yet observed
    #[default]
    #[serde(rename = "")]
    Unset,
    /// The legacy Machine API is authoritative
    #[serde(rename = "MachineAPI")]
    MachineApi,
    /// Cluster API is authoritative
    #[serde(rename = "ClusterAPI")]
    ClusterApi,
    /// Authority is being handed over between the models
    Migrating,
}

impl std::fmt::Display for AuthoritativeApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unset => write!(f, "<unset>"),
            Self::MachineApi => write!(f, "MachineAPI"),
            Self::ClusterApi => write!(f, "ClusterAPI"),
            Self::Migrating => write!(f, "Migrating"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// How bad a non-True condition is
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum ConditionSeverity {
    /// No severity (used for True conditions)
    #[default]
    #[serde(rename = "")]
    None,
    /// Something is broken
    Error,
    /// Something needs attention
    Warning,
    /// Informational only
    Info,
}

impl ConditionSeverity {
    /// Severity implied by a condition status: True is none, False is an
    /// error, Unknown is informational
    pub fn for_status(status: ConditionStatus) -> Self {
        match status {
            ConditionStatus::True => Self::None,
            ConditionStatus::False => Self::Error,
            ConditionStatus::Unknown => Self::Info,
        }
    }
}

/// Kubernetes-style condition with Cluster API severity
///
/// Both machine models use this shape for `status.conditions`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., Synchronized, Ready)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Severity, empty when status is True
    #[serde(default, skip_serializing_if = "is_no_severity")]
    pub severity: ConditionSeverity,

    /// Machine-readable reason for the condition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: DateTime<Utc>,
}

fn is_no_severity(severity: &ConditionSeverity) -> bool {
    *severity == ConditionSeverity::None
}

impl Condition {
    /// Create a new condition stamped with the current time
    ///
    /// Severity is derived from the status. Timestamps are truncated to whole
    /// seconds, the precision the API server stores.
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            severity: ConditionSeverity::for_status(status),
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now().trunc_subsecs(0),
        }
    }

    /// True if both conditions say the same thing, ignoring the timestamp
    pub fn same_state(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.severity == other.severity
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Address reported for a machine (same shape in both models)
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct MachineAddress {
    /// Address type (InternalIP, ExternalDNS, ...)
    #[serde(rename = "type")]
    pub type_: String,
    /// The address itself
    pub address: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_round_trips_through_json() {
        for (value, json) in [
            (AuthoritativeApi::Unset, "\"\""),
            (AuthoritativeApi::MachineApi, "\"MachineAPI\""),
            (AuthoritativeApi::ClusterApi, "\"ClusterAPI\""),
            (AuthoritativeApi::Migrating, "\"Migrating\""),
        ] {
            assert_eq!(serde_json::to_string(&value).unwrap(), json);
            let parsed: AuthoritativeApi = serde_json::from_str(json).unwrap();
            assert_eq!(parsed, value);
        }
    }

    #[test]
    fn severity_follows_status() {
        assert_eq!(
            ConditionSeverity::for_status(ConditionStatus::True),
            ConditionSeverity::None
        );
        assert_eq!(
            ConditionSeverity::for_status(ConditionStatus::False),
            ConditionSeverity::Error
        );
        assert_eq!(
            ConditionSeverity::for_status(ConditionStatus::Unknown),
            ConditionSeverity::Info
        );
    }

    #[test]
    fn true_condition_serializes_without_severity() {
        let condition = Condition::new(
            "Synchronized",
            ConditionStatus::True,
            "ResourceSynchronized",
            "",
        );
        let json = serde_json::to_value(&condition).unwrap();
        assert!(json.get("severity").is_none());
        assert!(json.get("message").is_none());
        assert_eq!(json["type"], "Synchronized");
        assert_eq!(json["status"], "True");

        let parsed: Condition = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, condition);
    }

    #[test]
    fn same_state_ignores_timestamp() {
        let a = Condition::new("Synchronized", ConditionStatus::False, "ConversionFailed", "x");
        let mut b = a.clone();
        b.last_transition_time = a.last_transition_time - chrono::Duration::hours(1);
        assert!(a.same_state(&b));
        b.reason = "Other".into();
        assert!(!a.same_state(&b));
    }
}
