//! Synchronized condition reporting
//!
//! The sync controller owns exactly one condition on the legacy machine,
//! `Synchronized`, plus `status.synchronizedGeneration`. Both are written with
//! a forced server-side apply under our own field manager, so other status
//! writers keep their fields and cannot take ours.

use kube::ResourceExt;
use serde_json::{json, Value};
use tracing::debug;

use machinesync_common::crd::{
    find_condition, Condition, ConditionStatus, MapiMachine, MAPI_API_VERSION,
};
use machinesync_common::Error;

use crate::client::MachineClient;

/// Type of the condition this controller owns
pub const SYNCHRONIZED_CONDITION: &str = "Synchronized";

/// Reasons written on the Synchronized condition
pub mod reasons {
    /// Both sides match
    pub const RESOURCE_SYNCHRONIZED: &str = "ResourceSynchronized";
    /// The infrastructure machine was replaced and is awaiting recreation
    pub const PROGRESSING_TO_CREATE_MIRROR_INFRA: &str = "ProgressingToCreateMirrorInfra";
    /// The conversion function rejected the payload
    pub const CONVERSION_FAILED: &str = "ConversionFailed";
    /// The infrastructure machine could not be read
    pub const INFRA_MACHINE_FETCH_FAILED: &str = "InfraMachineFetchFailed";
    /// The cluster or infrastructure cluster could not be read
    pub const CLUSTER_CONTEXT_FETCH_FAILED: &str = "ClusterContextFetchFailed";
    /// Creating the mirror machine failed
    pub const MIRROR_CREATE_FAILED: &str = "MirrorCreateFailed";
    /// Updating the mirror machine failed
    pub const MIRROR_UPDATE_FAILED: &str = "MirrorUpdateFailed";
    /// Updating the mirror machine's status failed
    pub const MIRROR_STATUS_UPDATE_FAILED: &str = "MirrorStatusUpdateFailed";
    /// Creating the infrastructure machine failed
    pub const INFRA_CREATE_FAILED: &str = "InfraCreateFailed";
    /// Deleting an out-of-date infrastructure machine failed
    pub const INFRA_DELETE_FAILED: &str = "InfraDeleteFailed";
    /// Owner references have an unsupported shape or no counterpart
    pub const OWNER_REFERENCE_TRANSLATION_FAILED: &str = "OwnerReferenceTranslationFailed";
    /// A platform invariant does not hold
    pub const PLATFORM_VALIDATION_FAILED: &str = "PlatformValidationFailed";
    /// The authoritative machine expected to exist is absent
    pub const MIRROR_NOT_FOUND: &str = "MirrorNotFound";
    /// Adding the bookkeeping finalizer failed
    pub const FINALIZER_UPDATE_FAILED: &str = "FinalizerUpdateFailed";
}

/// Build the apply patch for the Synchronized condition, or `None` if the
/// machine already reports exactly this
///
/// `observed_generation` is recorded only when `status` is True; otherwise the
/// previously synchronized generation is kept.
pub fn synchronized_patch(
    machine: &MapiMachine,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    observed_generation: i64,
) -> Option<Value> {
    let existing = machine
        .status
        .as_ref()
        .and_then(|s| find_condition(&s.conditions, SYNCHRONIZED_CONDITION));

    let mut condition = Condition::new(SYNCHRONIZED_CONDITION, status, reason, message);
    if let Some(existing) = existing.filter(|c| c.status == status) {
        condition.last_transition_time = existing.last_transition_time;
    }

    let current_generation = machine.synchronized_generation();
    let generation = if status == ConditionStatus::True {
        observed_generation
    } else {
        current_generation
    };

    if existing.is_some_and(|c| c.same_state(&condition)) && generation == current_generation {
        return None;
    }

    Some(json!({
        "apiVersion": MAPI_API_VERSION,
        "kind": "Machine",
        "metadata": {
            "name": machine.name_any(),
            "namespace": machine.namespace(),
        },
        "status": {
            "conditions": [condition],
            "synchronizedGeneration": generation,
        }
    }))
}

/// Write the Synchronized condition if it changed
pub async fn apply_synchronized_condition(
    client: &dyn MachineClient,
    machine: &MapiMachine,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    observed_generation: i64,
) -> Result<(), Error> {
    let Some(patch) = synchronized_patch(machine, status, reason, message, observed_generation)
    else {
        debug!(machine = %machine.name_any(), %status, reason, "Synchronized condition unchanged");
        return Ok(());
    };
    client.apply_mapi_status(&machine.name_any(), patch).await
}
