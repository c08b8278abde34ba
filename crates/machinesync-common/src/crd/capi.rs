//! Cluster API (`cluster.x-k8s.io/v1beta1`) resources
//!
//! Installed by the CAPI core provider. Only the fields the sync core needs
//! are modelled; infrastructure machines and clusters are platform specific
//! and handled as dynamic objects.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

use super::types::{Condition, MachineAddress};

/// API group of the Cluster API model
pub const CAPI_GROUP: &str = "cluster.x-k8s.io";

/// API version of the Cluster API model
pub const CAPI_API_VERSION: &str = "cluster.x-k8s.io/v1beta1";

/// Finalizer the CAPI machine controller places on every machine
pub const CAPI_MACHINE_FINALIZER: &str = "machine.cluster.x-k8s.io";

/// Annotation telling CAPI controllers to leave an object alone
pub const PAUSED_ANNOTATION: &str = "cluster.x-k8s.io/paused";

/// Label naming the cluster a machine belongs to
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Label marking control-plane machines
pub const CONTROL_PLANE_LABEL: &str = "cluster.x-k8s.io/control-plane";

/// Prefix of labels and annotations the CAPI controllers manage
pub const CAPI_DOMAIN_PREFIX: &str = "cluster.x-k8s.io/";

/// Suffix shared by infrastructure provider finalizers (e.g. `awsmachine.infrastructure.cluster.x-k8s.io`)
pub const INFRA_FINALIZER_SUFFIX: &str = ".infrastructure.cluster.x-k8s.io";

/// Bootstrap configuration of a CAPI machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bootstrap {
    /// Reference to a bootstrap config object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_ref: Option<ObjectReference>,

    /// Secret holding pre-rendered bootstrap (user) data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_secret_name: Option<String>,
}

/// Spec of a CAPI machine
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Machine",
    root = "CapiMachine",
    namespaced,
    status = "CapiMachineStatus",
    schema = "disabled",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct CapiMachineSpec {
    /// Name of the owning CAPI cluster
    pub cluster_name: String,

    /// Bootstrap data source
    #[serde(default)]
    pub bootstrap: Bootstrap,

    /// Reference to the infrastructure machine
    pub infrastructure_ref: ObjectReference,

    /// Kubernetes version of the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Cloud provider ID of the instance
    #[serde(default, rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Failure domain (availability zone)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_domain: Option<String>,
}

/// Status of a CAPI machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CapiMachineStatus {
    /// Node backed by this machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<ObjectReference>,

    /// Lifecycle phase (Pending, Provisioning, Provisioned, Running, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Addresses assigned to the instance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,

    /// Terminal failure reason, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Terminal failure message, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    /// Whether bootstrap data is ready
    #[serde(default)]
    pub bootstrap_ready: bool,

    /// Whether the infrastructure machine is ready
    #[serde(default)]
    pub infrastructure_ready: bool,

    /// Conditions, owned by the CAPI controllers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Spec of a CAPI machine set (identity only)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "MachineSet",
    root = "CapiMachineSet",
    namespaced,
    schema = "disabled",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct CapiMachineSetSpec {
    /// Name of the owning CAPI cluster
    pub cluster_name: String,

    /// Desired replica count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

/// Spec of a CAPI cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Cluster",
    root = "CapiCluster",
    namespaced,
    schema = "disabled",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct CapiClusterSpec {
    /// Reference to the platform infrastructure cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectReference>,

    /// Whether CAPI reconciliation of the cluster is paused
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub paused: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_capi_machine() {
        let machine: CapiMachine = serde_json::from_value(json!({
            "apiVersion": "cluster.x-k8s.io/v1beta1",
            "kind": "Machine",
            "metadata": {"name": "worker-a", "namespace": "openshift-cluster-api"},
            "spec": {
                "clusterName": "ci-abc12",
                "bootstrap": {"dataSecretName": "worker-user-data"},
                "infrastructureRef": {
                    "apiVersion": "infrastructure.cluster.x-k8s.io/v1beta2",
                    "kind": "AWSMachine",
                    "name": "worker-a"
                },
                "providerID": "aws:///us-east-1a/i-0123",
                "failureDomain": "us-east-1a"
            },
            "status": {"phase": "Running", "infrastructureReady": true}
        }))
        .unwrap();

        assert_eq!(machine.spec.cluster_name, "ci-abc12");
        assert_eq!(
            machine.spec.bootstrap.data_secret_name.as_deref(),
            Some("worker-user-data")
        );
        assert_eq!(machine.spec.infrastructure_ref.kind.as_deref(), Some("AWSMachine"));
        let status = machine.status.unwrap();
        assert!(status.infrastructure_ready);
        assert!(!status.bootstrap_ready);
    }

    #[test]
    fn infra_finalizer_suffix_matches_provider_finalizers() {
        assert!("awsmachine.infrastructure.cluster.x-k8s.io".ends_with(INFRA_FINALIZER_SUFFIX));
        assert!(!CAPI_MACHINE_FINALIZER.ends_with(INFRA_FINALIZER_SUFFIX));
    }
}
