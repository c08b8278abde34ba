//! Owner reference translation between the two models
//!
//! A machine has at most one owner. Machine sets map to the same-named machine
//! set in the other model; the CAPI cluster owner has no legacy equivalent and
//! is synthesized on the way in and dropped on the way out.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use machinesync_common::crd::{CAPI_API_VERSION, CAPI_GROUP, MAPI_API_VERSION, MAPI_GROUP};
use machinesync_common::Error;

use crate::client::MachineClient;
use crate::platform::ClusterContext;

const OWNER_REFERENCES_FIELD: &str = "metadata.ownerReferences";
const MACHINE_SET_KIND: &str = "MachineSet";
const CLUSTER_KIND: &str = "Cluster";

fn group_of(api_version: &str) -> &str {
    match api_version.split_once('/') {
        Some((group, _)) => group,
        None => "",
    }
}

fn is_kind(owner: &OwnerReference, group: &str, kind: &str) -> bool {
    owner.kind == kind && group_of(&owner.api_version) == group
}

fn single_owner<'a>(
    machine: &str,
    owners: &'a [OwnerReference],
) -> Result<Option<&'a OwnerReference>, Error> {
    match owners {
        [] => Ok(None),
        [owner] => Ok(Some(owner)),
        _ => Err(Error::validation_for_field(
            machine,
            OWNER_REFERENCES_FIELD,
            format!("too many owner references: {} (at most one is supported)", owners.len()),
        )),
    }
}

fn unsupported(machine: &str, owner: &OwnerReference) -> Error {
    Error::validation_for_field(
        machine,
        OWNER_REFERENCES_FIELD,
        format!(
            "unsupported owner reference kind {} ({})",
            owner.kind, owner.api_version
        ),
    )
}

fn mirrored(owner: &OwnerReference, api_version: &str, uid: Option<String>) -> OwnerReference {
    OwnerReference {
        api_version: api_version.to_string(),
        kind: owner.kind.clone(),
        name: owner.name.clone(),
        uid: uid.unwrap_or_default(),
        controller: owner.controller,
        block_owner_deletion: owner.block_owner_deletion,
    }
}

/// Owner references of the CAPI mirror of a legacy machine
pub async fn to_capi_owner_references(
    client: &dyn MachineClient,
    machine: &str,
    owners: &[OwnerReference],
    cluster: &ClusterContext,
) -> Result<Vec<OwnerReference>, Error> {
    let Some(owner) = single_owner(machine, owners)? else {
        let Some(uid) = cluster.uid.clone() else {
            return Ok(Vec::new());
        };
        return Ok(vec![OwnerReference {
            api_version: CAPI_API_VERSION.to_string(),
            kind: CLUSTER_KIND.to_string(),
            name: cluster.name.clone(),
            uid,
            ..Default::default()
        }]);
    };

    if !is_kind(owner, MAPI_GROUP, MACHINE_SET_KIND) {
        return Err(unsupported(machine, owner));
    }

    let set = client
        .get_capi_machine_set(&owner.name)
        .await?
        .ok_or_else(|| Error::missing_counterpart("CAPI MachineSet", &owner.name))?;
    Ok(vec![mirrored(owner, CAPI_API_VERSION, set.uid())])
}

/// Owner references of the legacy mirror of a CAPI machine
pub async fn to_mapi_owner_references(
    client: &dyn MachineClient,
    machine: &str,
    owners: &[OwnerReference],
) -> Result<Vec<OwnerReference>, Error> {
    let Some(owner) = single_owner(machine, owners)? else {
        return Ok(Vec::new());
    };

    if is_kind(owner, CAPI_GROUP, CLUSTER_KIND) {
        return Ok(Vec::new());
    }
    if !is_kind(owner, CAPI_GROUP, MACHINE_SET_KIND) {
        return Err(unsupported(machine, owner));
    }

    let set = client
        .get_mapi_machine_set(&owner.name)
        .await?
        .ok_or_else(|| Error::missing_counterpart("MAPI MachineSet", &owner.name))?;
    Ok(vec![mirrored(owner, MAPI_API_VERSION, set.uid())])
}

/// True if a CAPI machine is owned by a machine set that has a legacy counterpart
pub async fn has_mirrored_machine_set_owner(
    client: &dyn MachineClient,
    owners: &[OwnerReference],
) -> Result<bool, Error> {
    let [owner] = owners else {
        return Ok(false);
    };
    if !is_kind(owner, CAPI_GROUP, MACHINE_SET_KIND) {
        return Ok(false);
    }
    Ok(client.get_mapi_machine_set(&owner.name).await?.is_some())
}
