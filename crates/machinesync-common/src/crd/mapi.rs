//! Machine API (`machine.openshift.io/v1beta1`) resources
//!
//! These CRDs are owned and installed by the Machine API operator; the
//! types below only cover the fields the sync core reads or writes.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

use super::types::{AuthoritativeApi, Condition, MachineAddress};

/// API group of the legacy machine model
pub const MAPI_GROUP: &str = "machine.openshift.io";

/// API version of the legacy machine model
pub const MAPI_API_VERSION: &str = "machine.openshift.io/v1beta1";

/// Finalizer the Machine API machine controller places on every machine
pub const MAPI_MACHINE_FINALIZER: &str = "machine.machine.openshift.io";

/// Label carrying the infrastructure (cluster) name
pub const MAPI_CLUSTER_LABEL: &str = "machine.openshift.io/cluster-api-cluster";

/// Label carrying the machine role (master, worker, infra)
pub const MAPI_ROLE_LABEL: &str = "machine.openshift.io/cluster-api-machine-role";

/// Label carrying the machine type
pub const MAPI_TYPE_LABEL: &str = "machine.openshift.io/cluster-api-machine-type";

/// Prefix of labels and annotations the Machine API controllers manage
pub const MAPI_DOMAIN_PREFIX: &str = "machine.openshift.io/";

/// Opaque provider payload
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ProviderSpec {
    /// Provider-specific configuration, interpreted by the platform strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

/// Spec of a legacy machine
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "machine.openshift.io",
    version = "v1beta1",
    kind = "Machine",
    root = "MapiMachine",
    namespaced,
    status = "MapiMachineStatus",
    schema = "disabled",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct MapiMachineSpec {
    /// Cloud provider ID of the instance backing this machine
    #[serde(default, rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Provider-specific configuration
    #[serde(default)]
    pub provider_spec: ProviderSpec,

    /// Desired authority, set by users; the observed value lives in status
    #[serde(
        default,
        rename = "authoritativeAPI",
        skip_serializing_if = "Option::is_none"
    )]
    pub authoritative_api: Option<AuthoritativeApi>,
}

/// Status of a legacy machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MapiMachineStatus {
    /// Node backed by this machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<ObjectReference>,

    /// Lifecycle phase (Provisioning, Running, Deleting, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Addresses assigned to the instance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,

    /// Terminal error reason, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,

    /// Terminal error message, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Provider-specific status, opaque to the sync core
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<serde_json::Value>,

    /// Conditions, each owned by its own writer
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Observed authority (the authority field)
    #[serde(
        default,
        rename = "authoritativeAPI",
        skip_serializing_if = "Option::is_none"
    )]
    pub authoritative_api: Option<AuthoritativeApi>,

    /// Generation of the authoritative object last mirrored successfully
    #[serde(default, skip_serializing_if = "is_zero")]
    pub synchronized_generation: i64,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

impl MapiMachine {
    /// The authority field as observed in status (unset if not yet written)
    pub fn authority(&self) -> AuthoritativeApi {
        self.status
            .as_ref()
            .and_then(|s| s.authoritative_api)
            .unwrap_or_default()
    }

    /// Generation last mirrored successfully
    pub fn synchronized_generation(&self) -> i64 {
        self.status
            .as_ref()
            .map(|s| s.synchronized_generation)
            .unwrap_or_default()
    }
}

/// Spec of a legacy machine set
///
/// Only the identity of machine sets matters to the sync core.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "machine.openshift.io",
    version = "v1beta1",
    kind = "MachineSet",
    root = "MapiMachineSet",
    namespaced,
    schema = "disabled",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct MapiMachineSetSpec {
    /// Desired replica count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Desired authority of the machine set
    #[serde(
        default,
        rename = "authoritativeAPI",
        skip_serializing_if = "Option::is_none"
    )]
    pub authoritative_api: Option<AuthoritativeApi>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_machine_with_authority_and_sync_generation() {
        let machine: MapiMachine = serde_json::from_value(json!({
            "apiVersion": "machine.openshift.io/v1beta1",
            "kind": "Machine",
            "metadata": {"name": "worker-a", "namespace": "openshift-machine-api", "generation": 3},
            "spec": {
                "providerID": "aws:///us-east-1a/i-0123",
                "providerSpec": {"value": {"instanceType": "m6i.large"}},
                "authoritativeAPI": "MachineAPI"
            },
            "status": {
                "authoritativeAPI": "ClusterAPI",
                "synchronizedGeneration": 2,
                "phase": "Running"
            }
        }))
        .unwrap();

        assert_eq!(machine.authority(), AuthoritativeApi::ClusterApi);
        assert_eq!(machine.synchronized_generation(), 2);
        assert_eq!(
            machine.spec.provider_id.as_deref(),
            Some("aws:///us-east-1a/i-0123")
        );
        assert_eq!(machine.spec.authoritative_api, Some(AuthoritativeApi::MachineApi));
    }

    #[test]
    fn missing_status_means_unset_authority() {
        let machine = MapiMachine::new("worker-a", MapiMachineSpec::default());
        assert_eq!(machine.authority(), AuthoritativeApi::Unset);
        assert_eq!(machine.synchronized_generation(), 0);
    }
}
