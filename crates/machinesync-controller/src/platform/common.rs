//! Platform-independent parts of machine conversion
//!
//! Labels, annotations, provider IDs and the lifecycle status look the same on
//! every platform; strategies build on these skeletons and only fill in the
//! provider payload.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use serde_json::{json, Value};

use machinesync_common::crd::{
    CapiMachine, CapiMachineSpec, CapiMachineStatus, MapiMachine, MapiMachineSpec,
    MapiMachineStatus, ProviderSpec, CAPI_DOMAIN_PREFIX, CLUSTER_NAME_LABEL, CONTROL_PLANE_LABEL,
    MAPI_CLUSTER_LABEL, MAPI_ROLE_LABEL, PAUSED_ANNOTATION,
};

/// Role label value of legacy control-plane machines
const MASTER_ROLE: &str = "master";

/// Phases after which the instance exists
const PROVISIONED_PHASES: &[&str] = &["Provisioned", "Running"];

/// True if a legacy machine is a control-plane machine
pub fn is_control_plane_mapi(mapi: &MapiMachine) -> bool {
    mapi.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(MAPI_ROLE_LABEL))
        .is_some_and(|role| role == MASTER_ROLE)
}

/// True if a CAPI machine is a control-plane machine
pub fn is_control_plane_capi(capi: &CapiMachine) -> bool {
    capi.metadata
        .labels
        .as_ref()
        .is_some_and(|l| l.contains_key(CONTROL_PLANE_LABEL))
}

fn without_paused(annotations: Option<&BTreeMap<String, String>>) -> Option<BTreeMap<String, String>> {
    let mut annotations = annotations.cloned()?;
    annotations.remove(PAUSED_ANNOTATION);
    (!annotations.is_empty()).then_some(annotations)
}

fn capi_labels(mapi: &MapiMachine, cluster_name: &str) -> BTreeMap<String, String> {
    let mut labels = mapi.metadata.labels.clone().unwrap_or_default();
    labels.insert(CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string());
    if is_control_plane_mapi(mapi) {
        labels.insert(CONTROL_PLANE_LABEL.to_string(), String::new());
    }
    labels
}

fn mapi_labels(capi: &CapiMachine) -> Option<BTreeMap<String, String>> {
    let source = capi.metadata.labels.clone().unwrap_or_default();
    let mut labels: BTreeMap<String, String> = source
        .iter()
        .filter(|(k, _)| !k.starts_with(CAPI_DOMAIN_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if let Some(cluster) = source.get(CLUSTER_NAME_LABEL) {
        labels
            .entry(MAPI_CLUSTER_LABEL.to_string())
            .or_insert_with(|| cluster.clone());
    }
    (!labels.is_empty()).then_some(labels)
}

/// CAPI lifecycle status derived from a legacy machine's status
pub fn capi_status_from_mapi(status: Option<&MapiMachineStatus>) -> CapiMachineStatus {
    let Some(status) = status else {
        return CapiMachineStatus::default();
    };
    let provisioned = status
        .phase
        .as_deref()
        .is_some_and(|p| PROVISIONED_PHASES.contains(&p));
    CapiMachineStatus {
        node_ref: status.node_ref.clone(),
        phase: status.phase.clone(),
        addresses: status.addresses.clone(),
        failure_reason: status.error_reason.clone(),
        failure_message: status.error_message.clone(),
        bootstrap_ready: provisioned,
        infrastructure_ready: provisioned,
        conditions: Vec::new(),
    }
}

/// Legacy lifecycle status derived from a CAPI machine's status
pub fn mapi_status_from_capi(status: Option<&CapiMachineStatus>) -> MapiMachineStatus {
    let Some(status) = status else {
        return MapiMachineStatus::default();
    };
    MapiMachineStatus {
        node_ref: status.node_ref.clone(),
        phase: status.phase.clone(),
        addresses: status.addresses.clone(),
        error_reason: status.failure_reason.clone(),
        error_message: status.failure_message.clone(),
        ..Default::default()
    }
}

/// CAPI machine carrying everything but the platform-specific spec fields
pub fn capi_machine_skeleton(
    mapi: &MapiMachine,
    cluster_name: &str,
    infra: &ApiResource,
) -> CapiMachine {
    let name = mapi.metadata.name.clone().unwrap_or_default();
    CapiMachine {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            labels: Some(capi_labels(mapi, cluster_name)),
            annotations: without_paused(mapi.metadata.annotations.as_ref()),
            ..Default::default()
        },
        spec: CapiMachineSpec {
            cluster_name: cluster_name.to_string(),
            infrastructure_ref: ObjectReference {
                api_version: Some(infra.api_version.clone()),
                kind: Some(infra.kind.clone()),
                name: Some(name),
                ..Default::default()
            },
            provider_id: mapi.spec.provider_id.clone(),
            ..Default::default()
        },
        status: Some(capi_status_from_mapi(mapi.status.as_ref())),
    }
}

/// Legacy machine carrying everything but the provider payload
pub fn mapi_machine_skeleton(capi: &CapiMachine, provider_value: Value) -> MapiMachine {
    MapiMachine {
        metadata: ObjectMeta {
            name: capi.metadata.name.clone(),
            labels: mapi_labels(capi),
            annotations: without_paused(capi.metadata.annotations.as_ref()),
            ..Default::default()
        },
        spec: MapiMachineSpec {
            provider_id: capi.spec.provider_id.clone(),
            provider_spec: ProviderSpec {
                value: Some(provider_value),
            },
            authoritative_api: None,
        },
        status: Some(mapi_status_from_capi(capi.status.as_ref())),
    }
}

/// Infrastructure machine of the given kind with the given spec
pub fn infra_object(resource: &ApiResource, name: &str, spec: Value) -> DynamicObject {
    let mut obj = DynamicObject::new(name, resource);
    obj.data = json!({ "spec": spec });
    obj
}

/// The `spec` of a dynamic object, or `null`
pub fn dynamic_spec(obj: &DynamicObject) -> &Value {
    obj.data.get("spec").unwrap_or(&Value::Null)
}
