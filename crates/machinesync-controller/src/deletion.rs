//! Deletion coordination across the model boundary
//!
//! Deletion of one logical machine touches three objects that different
//! controllers own. The coordinator is re-entrant: every pass re-derives the
//! next step from the freshly loaded [`LinkedMachines`] and performs at most
//! one deletion request batch or one finalizer removal, so each transition is
//! independently observable and a stale pass cannot skip ahead.
//!
//! The bookkeeping finalizer is never removed from the mirror or the mirrored
//! infrastructure machine while the authoritative machine still carries its
//! model-native finalizer: that finalizer is the signal that the authoritative
//! controller has released the physical instance.

use tracing::{debug, info};

use machinesync_common::crd::{CAPI_MACHINE_FINALIZER, INFRA_FINALIZER_SUFFIX, MAPI_MACHINE_FINALIZER};
use machinesync_common::meta::{has_finalizer, is_deleting, without_finalizers};
use machinesync_common::{Error, SYNC_FINALIZER};

use crate::client::{LinkedKind, MachineClient};
use crate::linked::{Direction, LinkedMachines};

/// What the coordinator did on this pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeletionOutcome {
    /// Neither side is being deleted; sync may proceed
    NotDeleting,
    /// A deletion request or finalizer removal was issued; reconcile again
    InProgress,
    /// Blocked on the authoritative controller releasing its native finalizer
    WaitingForNative,
    /// Our bookkeeping finalizer is gone from every object; nothing left to do
    Released,
}

impl DeletionOutcome {
    /// True if the sync steps must not run on this pass
    pub fn stops_sync(self) -> bool {
        self != Self::NotDeleting
    }
}

/// Finalizer the model's own machine controller adds
pub fn native_finalizer(kind: LinkedKind) -> Option<&'static str> {
    match kind {
        LinkedKind::MapiMachine => Some(MAPI_MACHINE_FINALIZER),
        LinkedKind::CapiMachine => Some(CAPI_MACHINE_FINALIZER),
        LinkedKind::InfraMachine => None,
    }
}

fn is_provider_finalizer(finalizer: &str) -> bool {
    finalizer.ends_with(INFRA_FINALIZER_SUFFIX)
}

fn is_sync_finalizer(finalizer: &str) -> bool {
    finalizer == SYNC_FINALIZER
}

/// One finalizer-removal layer: which object, and which finalizers go
struct Layer {
    kind: LinkedKind,
    matches: fn(&str) -> bool,
}

/// Finalizer layers stripped after the native finalizer cleared, in order
fn release_layers(direction: Direction) -> Vec<Layer> {
    let mirror = direction.mirror();
    let mut layers = Vec::new();
    if direction.mirrors_infra() {
        layers.push(Layer {
            kind: LinkedKind::InfraMachine,
            matches: is_provider_finalizer,
        });
    }
    let native_mirror: fn(&str) -> bool = match mirror {
        LinkedKind::CapiMachine => |f| f == CAPI_MACHINE_FINALIZER,
        _ => |f| f == MAPI_MACHINE_FINALIZER,
    };
    layers.push(Layer {
        kind: mirror,
        matches: native_mirror,
    });
    layers.push(Layer {
        kind: mirror,
        matches: is_sync_finalizer,
    });
    layers.push(Layer {
        kind: LinkedKind::InfraMachine,
        matches: is_sync_finalizer,
    });
    layers.push(Layer {
        kind: direction.authoritative(),
        matches: is_sync_finalizer,
    });
    layers
}

/// Remove the first matching layer; returns the kind written, if any
async fn strip_first_layer(
    client: &dyn MachineClient,
    linked: &LinkedMachines,
    layers: &[Layer],
) -> Result<Option<LinkedKind>, Error> {
    for layer in layers {
        let Some(meta) = linked.meta(layer.kind) else {
            continue;
        };
        let Some(remaining) = without_finalizers(meta, layer.matches) else {
            continue;
        };
        let name = linked.name_of(layer.kind);
        info!(kind = %layer.kind, name, ?remaining, "Removing finalizer");
        client
            .set_finalizers(layer.kind, name, meta.resource_version.clone(), remaining)
            .await?;
        return Ok(Some(layer.kind));
    }
    Ok(None)
}

/// Advance teardown of the linked machines by at most one step
///
/// Returns [`DeletionOutcome::NotDeleting`] when neither machine is marked for
/// deletion; every other outcome means the caller must not sync this pass.
pub async fn reconcile_deletion(
    client: &dyn MachineClient,
    linked: &LinkedMachines,
    direction: Direction,
) -> Result<DeletionOutcome, Error> {
    let auth = direction.authoritative();
    let mirror = direction.mirror();
    let auth_meta = linked.meta(auth);
    let mirror_meta = linked.meta(mirror);

    let auth_deleting = auth_meta.is_some_and(is_deleting);
    let mirror_deleting = mirror_meta.is_some_and(is_deleting);

    if !auth_deleting {
        if !mirror_deleting {
            return Ok(DeletionOutcome::NotDeleting);
        }
        if auth_meta.is_some() {
            info!(%direction, "Mirror is being deleted, propagating deletion to the authoritative machine");
            client.delete(auth, &linked.name).await?;
            return Ok(DeletionOutcome::InProgress);
        }
        // Nothing left to coordinate with; let the mirror go.
        return match strip_first_layer(
            client,
            linked,
            &[Layer {
                kind: mirror,
                matches: is_sync_finalizer,
            }],
        )
        .await?
        {
            Some(_) => Ok(DeletionOutcome::InProgress),
            None => Ok(DeletionOutcome::Released),
        };
    }

    // The CAPI controller waits for the infrastructure machine to disappear
    // before it drops its own finalizer.
    if !direction.mirrors_infra() {
        if let Some(infra) = linked.meta(LinkedKind::InfraMachine).filter(|m| is_deleting(m)) {
            if has_finalizer(infra, SYNC_FINALIZER) {
                let layer = Layer {
                    kind: LinkedKind::InfraMachine,
                    matches: is_sync_finalizer,
                };
                strip_first_layer(client, linked, &[layer]).await?;
                return Ok(DeletionOutcome::InProgress);
            }
        }
    }

    let mirror_infra = if direction.mirrors_infra() {
        linked.meta(LinkedKind::InfraMachine)
    } else {
        None
    };

    if mirror_meta.is_none() && mirror_infra.is_none() {
        debug!(%direction, "No mirror to tear down, releasing the authoritative machine");
        let mut layers = Vec::new();
        if !direction.mirrors_infra() {
            layers.push(Layer {
                kind: LinkedKind::InfraMachine,
                matches: is_sync_finalizer,
            });
        }
        layers.push(Layer {
            kind: auth,
            matches: is_sync_finalizer,
        });
        return match strip_first_layer(client, linked, &layers).await? {
            Some(kind) if kind != auth => Ok(DeletionOutcome::InProgress),
            _ => Ok(DeletionOutcome::Released),
        };
    }

    let mut requested = false;
    if mirror_meta.is_some_and(|m| !is_deleting(m)) {
        info!(%direction, kind = %mirror, "Propagating deletion to mirror machine");
        client.delete(mirror, &linked.name).await?;
        requested = true;
    }
    if mirror_infra.is_some_and(|m| !is_deleting(m)) {
        info!(%direction, name = linked.infra_name(), "Propagating deletion to infrastructure machine");
        client
            .delete(LinkedKind::InfraMachine, linked.infra_name())
            .await?;
        requested = true;
    }
    if requested {
        return Ok(DeletionOutcome::InProgress);
    }

    if let (Some(meta), Some(native)) = (auth_meta, native_finalizer(auth)) {
        if has_finalizer(meta, native) {
            debug!(%direction, finalizer = native, "Waiting for native finalizer on the authoritative machine");
            return Ok(DeletionOutcome::WaitingForNative);
        }
    }

    match strip_first_layer(client, linked, &release_layers(direction)).await? {
        Some(kind) if kind == auth => Ok(DeletionOutcome::Released),
        Some(_) => Ok(DeletionOutcome::InProgress),
        None => Ok(DeletionOutcome::Released),
    }
}
