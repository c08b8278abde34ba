//! Machine sync reconciler
//!
//! Every reconcile is keyed by machine name and starts from a fresh read of
//! the linked triple. The dispatcher picks a direction from the legacy
//! machine's authority field; the forward and reverse procedures then run the
//! same sequence: deletion interception, bookkeeping finalizers, cluster
//! context, owner references, validation, conversion, then create-or-update
//! through the diff engine. Every failure is reported on the Synchronized
//! condition (or as an event when no legacy machine exists yet).

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use machinesync_common::crd::{
    AuthoritativeApi, CapiMachine, ConditionStatus, MapiMachine, CAPI_DOMAIN_PREFIX,
    CLUSTER_NAME_LABEL, MAPI_DOMAIN_PREFIX, PAUSED_ANNOTATION,
};
use machinesync_common::events::{actions, reasons as event_reasons, EventPublisher, NoopEventPublisher};
use machinesync_common::meta::{
    has_finalizer, is_deleting, merge_out_of_band, remove_annotation, set_annotation,
    splice_identity, with_finalizer, without_finalizers,
};
use machinesync_common::{
    Error, DEFAULT_CAPI_NAMESPACE, DEFAULT_MAPI_NAMESPACE, SYNC_FINALIZER,
};

use crate::client::{LinkedKind, MachineClient};
use crate::conditions::{apply_synchronized_condition, reasons};
use crate::deletion::{reconcile_deletion, DeletionOutcome};
use crate::diff::{diff_capi_machines, diff_mapi_machines, STATUS};
use crate::linked::{Direction, LinkedMachines};
use crate::ownership::{
    has_mirrored_machine_set_owner, to_capi_owner_references, to_mapi_owner_references,
};
use crate::platform::{ClusterContext, PlatformStrategy};

/// Requeue delay after a single teardown or finalizer step
const STEP_REQUEUE: Duration = Duration::from_secs(1);

/// Retry delay after a write conflict; the next read will see the newer version
const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// Retry delay after any other failure
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Retry delay for failures a retry cannot fix (RBAC, rejected payloads)
const NON_RETRYABLE_REQUEUE: Duration = Duration::from_secs(300);

/// Resolved settings the reconciler needs
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Namespace of legacy machines
    pub mapi_namespace: String,
    /// Namespace of CAPI machines and infrastructure machines
    pub capi_namespace: String,
    /// Name of the CAPI `Cluster` (the cluster's infrastructure name)
    pub infrastructure_name: String,
    /// Requeue delay while a progressing condition is reported
    pub progress_requeue: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mapi_namespace: DEFAULT_MAPI_NAMESPACE.to_string(),
            capi_namespace: DEFAULT_CAPI_NAMESPACE.to_string(),
            infrastructure_name: String::new(),
            progress_requeue: Duration::from_secs(5),
        }
    }
}

/// Shared context for the machine sync controllers
pub struct Context {
    /// Resource store access
    pub client: Arc<dyn MachineClient>,
    /// Strategy for the cluster's platform, selected once at startup
    pub platform: Arc<dyn PlatformStrategy>,
    /// Kubernetes Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Resolved settings
    pub config: SyncConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(
        client: Arc<dyn MachineClient>,
        platform: Arc<dyn PlatformStrategy>,
    ) -> ContextBuilder {
        ContextBuilder {
            client,
            platform,
            events: None,
            config: SyncConfig::default(),
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Arc<dyn MachineClient>,
    platform: Arc<dyn PlatformStrategy>,
    events: Option<Arc<dyn EventPublisher>>,
    config: SyncConfig,
}

impl ContextBuilder {
    /// Publish events through the given publisher (default: discard them)
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Use the given settings
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            client: self.client,
            platform: self.platform,
            events: self
                .events
                .unwrap_or_else(|| Arc::new(NoopEventPublisher)),
            config: self.config,
        }
    }
}

/// Reconcile a legacy machine
#[instrument(skip(machine, ctx), fields(machine = %machine.name_any()))]
pub async fn reconcile(machine: Arc<MapiMachine>, ctx: Arc<Context>) -> Result<Action, Error> {
    dispatch(&machine.name_any(), &ctx).await
}

/// Reconcile a CAPI machine that has no legacy counterpart
///
/// CAPI machines with a legacy machine of the same name are handled through
/// the legacy machine's reconcile, which the watch mapping also triggers.
#[instrument(skip(machine, ctx), fields(machine = %machine.name_any()))]
pub async fn reconcile_capi(machine: Arc<CapiMachine>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = machine.name_any();
    if ctx.client.get_mapi_machine(&name).await?.is_some() {
        debug!("legacy machine exists, handled by its own reconcile");
        return Ok(Action::await_change());
    }
    dispatch(&name, &ctx).await
}

/// Error policy shared by both controllers
pub fn error_policy<K: ResourceExt>(machine: Arc<K>, error: &Error, _ctx: Arc<Context>) -> Action {
    if error.is_conflict() {
        debug!(machine = %machine.name_any(), %error, "stale read, retrying");
        return Action::requeue(CONFLICT_REQUEUE);
    }
    if !error.is_retryable() {
        error!(
            ?error,
            machine = %machine.name_any(),
            "reconciliation failed, not retryable until the object or cluster changes"
        );
        return Action::requeue(NON_RETRYABLE_REQUEUE);
    }
    error!(
        ?error,
        machine = %machine.name_any(),
        "reconciliation failed"
    );
    Action::requeue(ERROR_REQUEUE)
}

/// Pick the sync direction for one logical machine and run it
pub async fn dispatch(name: &str, ctx: &Context) -> Result<Action, Error> {
    let client = ctx.client.as_ref();
    let mut linked = LinkedMachines::load_machines(client, name).await?;

    let orphan_deleting = linked.mapi.is_none()
        && linked
            .capi
            .as_ref()
            .is_some_and(|c| is_deleting(&c.metadata) && has_finalizer(&c.metadata, SYNC_FINALIZER));
    if orphan_deleting {
        return release_orphan(ctx, linked).await;
    }

    let direction = match (&linked.mapi, &linked.capi) {
        (None, None) => {
            debug!("neither machine exists");
            return Ok(Action::await_change());
        }
        (None, Some(capi)) => {
            if !has_mirrored_machine_set_owner(client, capi.owner_references()).await? {
                debug!("CAPI machine is not owned by a mirrored machine set, ignoring");
                return Ok(Action::await_change());
            }
            Direction::CapiToMapi
        }
        (Some(mapi), capi) => match mapi.authority() {
            AuthoritativeApi::MachineApi => Direction::MapiToCapi,
            AuthoritativeApi::ClusterApi if capi.is_some() => Direction::CapiToMapi,
            AuthoritativeApi::ClusterApi => Direction::MapiToCapi,
            authority @ (AuthoritativeApi::Migrating | AuthoritativeApi::Unset) => {
                debug!(%authority, "authority is not settled, nothing to do");
                return Ok(Action::await_change());
            }
        },
    };

    let authority = linked
        .mapi
        .as_ref()
        .map(MapiMachine::authority)
        .unwrap_or(AuthoritativeApi::ClusterApi);
    info!(%direction, %authority, "syncing machine");

    if let Some(action) = load_infra(ctx, &mut linked).await? {
        return Ok(action);
    }
    match direction {
        Direction::MapiToCapi => sync_mapi_to_capi(ctx, &linked, authority).await,
        Direction::CapiToMapi => sync_capi_to_mapi(ctx, &linked).await,
    }
}

/// Tear down the bookkeeping of a deleted CAPI machine that has no legacy machine
async fn release_orphan(ctx: &Context, mut linked: LinkedMachines) -> Result<Action, Error> {
    info!("releasing CAPI machine without a legacy counterpart");
    if let Some(action) = load_infra(ctx, &mut linked).await? {
        return Ok(action);
    }
    Ok(
        match reconcile_deletion(ctx.client.as_ref(), &linked, Direction::CapiToMapi).await? {
            DeletionOutcome::InProgress => Action::requeue(STEP_REQUEUE),
            _ => Action::await_change(),
        },
    )
}

/// Load the infrastructure machine; `Some` means the failure ended the pass
async fn load_infra(ctx: &Context, linked: &mut LinkedMachines) -> Result<Option<Action>, Error> {
    match linked.load_infra(ctx.client.as_ref()).await {
        Ok(()) => Ok(None),
        Err(e) => report_failure(ctx, linked, reasons::INFRA_MACHINE_FETCH_FAILED, e)
            .await
            .map(Some),
    }
}

// =============================================================================
// Forward: legacy machine -> CAPI machine + infrastructure machine
// =============================================================================

async fn sync_mapi_to_capi(
    ctx: &Context,
    linked: &LinkedMachines,
    authority: AuthoritativeApi,
) -> Result<Action, Error> {
    let client = ctx.client.as_ref();
    let Some(mapi) = linked.mapi.as_ref() else {
        return Ok(Action::await_change());
    };

    if let Some(action) = intercept_deletion(ctx, linked, Direction::MapiToCapi).await? {
        return Ok(action);
    }
    if let Some(action) = ensure_sync_finalizers(ctx, linked).await? {
        return Ok(action);
    }

    let cluster = match ClusterContext::load(client, &ctx.config.infrastructure_name).await {
        Ok(cluster) => cluster,
        Err(e) => return report_failure(ctx, linked, reasons::CLUSTER_CONTEXT_FETCH_FAILED, e).await,
    };

    let owners =
        match to_capi_owner_references(client, &linked.name, mapi.owner_references(), &cluster)
            .await
        {
            Ok(owners) => owners,
            Err(e) => {
                return report_failure(ctx, linked, reasons::OWNER_REFERENCE_TRANSLATION_FAILED, e)
                    .await
            }
        };

    if let Err(e) = ctx.platform.validate(mapi, &cluster) {
        return report_failure(ctx, linked, reasons::PLATFORM_VALIDATION_FAILED, e).await;
    }

    let conversion = match ctx.platform.to_capi(mapi, &cluster) {
        Ok(conversion) => conversion,
        Err(e) => return report_failure(ctx, linked, reasons::CONVERSION_FAILED, e).await,
    };
    publish_warnings(ctx, mapi.object_ref(&()), &conversion.warnings).await;

    // The mirror stays paused unless CAPI is authoritative.
    let paused = authority != AuthoritativeApi::ClusterApi;

    let mut desired = conversion.machine;
    desired.metadata.namespace = Some(ctx.config.capi_namespace.clone());
    desired.metadata.owner_references = (!owners.is_empty()).then_some(owners);
    match linked.capi.as_ref() {
        Some(current) => {
            splice_identity(&mut desired.metadata, &current.metadata);
            merge_foreign_keys(&mut desired.metadata, &current.metadata, CAPI_DOMAIN_PREFIX);
            if let (Some(status), Some(current_status)) =
                (desired.status.as_mut(), current.status.as_ref())
            {
                status.conditions = current_status.conditions.clone();
            }
        }
        None => desired.metadata.finalizers = Some(vec![SYNC_FINALIZER.to_string()]),
    }
    set_paused(&mut desired.metadata, paused);

    let capi = match linked.capi.as_ref() {
        None => match client.create_capi_machine(&desired).await {
            Ok(created) => {
                info!(paused, "created CAPI machine");
                ctx.events
                    .publish(
                        &mapi.object_ref(&()),
                        EventType::Normal,
                        event_reasons::MIRROR_CREATED,
                        actions::SYNC,
                        Some(format!("Created CAPI machine {}", linked.name)),
                    )
                    .await;
                created
            }
            Err(e) => return report_failure(ctx, linked, reasons::MIRROR_CREATE_FAILED, e).await,
        },
        Some(current) => {
            let changes = diff_capi_machines(current, &desired);
            if changes.has_object_changes() {
                info!(%changes, "updating CAPI machine");
                match client.update_capi_machine(&desired).await {
                    Ok(updated) => updated,
                    Err(e) => {
                        return report_failure(ctx, linked, reasons::MIRROR_UPDATE_FAILED, e).await
                    }
                }
            } else {
                current.clone()
            }
        }
    };

    let generation = mapi.metadata.generation.unwrap_or_default();
    if mapi.synchronized_generation() == generation {
        let mut with_status = capi.clone();
        with_status.status = desired.status.clone();
        let changes = diff_capi_machines(&capi, &with_status);
        if changes.has(STATUS) {
            debug!(paths = ?changes.paths(STATUS), "updating CAPI machine status");
            if let Err(e) = client.update_capi_machine_status(&with_status).await {
                return report_failure(ctx, linked, reasons::MIRROR_STATUS_UPDATE_FAILED, e).await;
            }
        }
    }

    let mut infra = conversion.infra;
    infra.metadata.namespace = Some(ctx.config.capi_namespace.clone());
    infra.metadata.owner_references = capi.controller_owner_ref(&()).map(|r| vec![r]);
    infra
        .metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(CLUSTER_NAME_LABEL.to_string(), cluster.name.clone());
    set_paused(&mut infra.metadata, paused);

    let infra_name = linked.infra_name().to_string();
    let mut progressing = false;
    match linked.infra.as_ref() {
        None => {
            infra.metadata.finalizers = Some(vec![SYNC_FINALIZER.to_string()]);
            if let Err(e) = client.create_infra_machine(&infra).await {
                return report_failure(ctx, linked, reasons::INFRA_CREATE_FAILED, e).await;
            }
            info!(name = %infra_name, "created infrastructure machine");
        }
        Some(current) if is_deleting(&current.metadata) => {
            // Its controller is paused and will not release it.
            if let Err(e) = release_infra(client, current, &infra_name).await {
                return report_failure(ctx, linked, reasons::INFRA_DELETE_FAILED, e).await;
            }
            progressing = true;
        }
        Some(current) => {
            let paths = ctx.platform.diff_infra(current, &infra);
            if !paths.is_empty() {
                info!(?paths, "infrastructure machine is out of date, replacing it");
                if let Err(e) = replace_infra(client, current, &infra_name).await {
                    return report_failure(ctx, linked, reasons::INFRA_DELETE_FAILED, e).await;
                }
                progressing = true;
            }
        }
    }

    if progressing {
        return report_progressing(
            ctx,
            linked,
            "Waiting for the out-of-date infrastructure machine to be replaced",
        )
        .await;
    }
    report_synchronized(ctx, mapi, generation).await
}

/// Delete an out-of-date infrastructure machine so the next pass recreates it
async fn replace_infra(
    client: &dyn MachineClient,
    current: &DynamicObject,
    name: &str,
) -> Result<(), Error> {
    client.delete(LinkedKind::InfraMachine, name).await?;
    release_infra(client, current, name).await
}

/// Drop every finalizer of an infrastructure machine that is being deleted
async fn release_infra(
    client: &dyn MachineClient,
    current: &DynamicObject,
    name: &str,
) -> Result<(), Error> {
    let has_finalizers = current
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| !f.is_empty());
    if has_finalizers {
        client
            .set_finalizers(LinkedKind::InfraMachine, name, None, Vec::new())
            .await?;
    }
    Ok(())
}

// =============================================================================
// Reverse: CAPI machine + infrastructure machine -> legacy machine
// =============================================================================

async fn sync_capi_to_mapi(ctx: &Context, linked: &LinkedMachines) -> Result<Action, Error> {
    let client = ctx.client.as_ref();
    let Some(capi) = linked.capi.as_ref() else {
        return Ok(Action::await_change());
    };

    if let Some(action) = intercept_deletion(ctx, linked, Direction::CapiToMapi).await? {
        return Ok(action);
    }
    if let Some(action) = ensure_sync_finalizers(ctx, linked).await? {
        return Ok(action);
    }

    let cluster = match ClusterContext::load(client, &ctx.config.infrastructure_name).await {
        Ok(cluster) => cluster,
        Err(e) => return report_failure(ctx, linked, reasons::CLUSTER_CONTEXT_FETCH_FAILED, e).await,
    };

    let infra = match linked.infra.as_ref() {
        None => return recreate_infra(ctx, linked, capi, &cluster).await,
        Some(infra) if is_deleting(&infra.metadata) => {
            if let Some(remaining) = without_finalizers(&infra.metadata, |f| f == SYNC_FINALIZER) {
                let released = client
                    .set_finalizers(
                        LinkedKind::InfraMachine,
                        linked.infra_name(),
                        infra.metadata.resource_version.clone(),
                        remaining,
                    )
                    .await;
                if let Err(e) = released {
                    return report_failure(ctx, linked, reasons::INFRA_DELETE_FAILED, e).await;
                }
            }
            return report_progressing(
                ctx,
                linked,
                "Waiting for the deleted infrastructure machine to go away",
            )
            .await;
        }
        Some(infra) => infra,
    };

    let owners = match to_mapi_owner_references(client, &linked.name, capi.owner_references()).await
    {
        Ok(owners) => owners,
        Err(e) => {
            return report_failure(ctx, linked, reasons::OWNER_REFERENCE_TRANSLATION_FAILED, e).await
        }
    };

    let conversion = match ctx.platform.to_mapi(capi, infra, &cluster) {
        Ok(conversion) => conversion,
        Err(e) => return report_failure(ctx, linked, reasons::CONVERSION_FAILED, e).await,
    };
    if let Some(target) = event_target(linked) {
        publish_warnings(ctx, target, &conversion.warnings).await;
    }

    if let Err(e) = ctx.platform.validate(&conversion.machine, &cluster) {
        return report_failure(ctx, linked, reasons::PLATFORM_VALIDATION_FAILED, e).await;
    }

    let mut desired = conversion.machine;
    desired.metadata.namespace = Some(ctx.config.mapi_namespace.clone());
    desired.metadata.owner_references = (!owners.is_empty()).then_some(owners);

    let capi_generation = capi.metadata.generation.unwrap_or_default();
    let Some(current) = linked.mapi.as_ref() else {
        return create_mapi(ctx, linked, desired, capi, capi_generation).await;
    };

    splice_identity(&mut desired.metadata, &current.metadata);
    merge_foreign_keys(&mut desired.metadata, &current.metadata, MAPI_DOMAIN_PREFIX);
    desired.spec.authoritative_api = current.spec.authoritative_api;
    if let (Some(current_value), Some(desired_value)) = (
        current.spec.provider_spec.value.as_ref(),
        desired.spec.provider_spec.value.as_mut(),
    ) {
        ctx.platform
            .preserve_unmodeled_fields(current_value, desired_value);
    }
    if let (Some(status), Some(current_status)) = (desired.status.as_mut(), current.status.as_ref())
    {
        status.conditions = current_status.conditions.clone();
        status.authoritative_api = current_status.authoritative_api;
        status.synchronized_generation = current_status.synchronized_generation;
        status.provider_status = current_status.provider_status.clone();
    }

    let changes = diff_mapi_machines(current, &desired, ctx.platform.as_ref());
    let mut mapi = current.clone();
    if changes.has_object_changes() {
        info!(%changes, "updating legacy machine");
        mapi = match client.update_mapi_machine(&desired).await {
            Ok(updated) => updated,
            Err(e) => return report_failure(ctx, linked, reasons::MIRROR_UPDATE_FAILED, e).await,
        };
    }

    if current.synchronized_generation() == capi_generation && changes.has(STATUS) {
        debug!(paths = ?changes.paths(STATUS), "updating legacy machine status");
        let mut with_status = mapi.clone();
        with_status.status = desired.status.clone();
        mapi = match client.update_mapi_machine_status(&with_status).await {
            Ok(updated) => updated,
            Err(e) => {
                return report_failure(ctx, linked, reasons::MIRROR_STATUS_UPDATE_FAILED, e).await
            }
        };
    }

    report_synchronized(ctx, &mapi, capi_generation).await
}

/// Create the legacy mirror of a CAPI machine, authority already handed to CAPI
async fn create_mapi(
    ctx: &Context,
    linked: &LinkedMachines,
    mut desired: MapiMachine,
    capi: &CapiMachine,
    capi_generation: i64,
) -> Result<Action, Error> {
    let client = ctx.client.as_ref();
    desired.metadata.finalizers = Some(vec![SYNC_FINALIZER.to_string()]);
    desired.spec.authoritative_api = Some(AuthoritativeApi::ClusterApi);

    let created = match client.create_mapi_machine(&desired).await {
        Ok(created) => created,
        Err(e) => return report_failure(ctx, linked, reasons::MIRROR_CREATE_FAILED, e).await,
    };
    info!("created legacy machine");
    ctx.events
        .publish(
            &capi.object_ref(&()),
            EventType::Normal,
            event_reasons::MIRROR_CREATED,
            actions::SYNC,
            Some(format!("Created legacy machine {}", linked.name)),
        )
        .await;

    // The authority in status is what pauses the legacy controller.
    let mut with_status = created;
    let mut status = desired.status.unwrap_or_default();
    status.authoritative_api = Some(AuthoritativeApi::ClusterApi);
    with_status.status = Some(status);
    let mapi = match client.update_mapi_machine_status(&with_status).await {
        Ok(updated) => updated,
        Err(e) => {
            return report_failure(ctx, linked, reasons::MIRROR_STATUS_UPDATE_FAILED, e).await
        }
    };

    report_synchronized(ctx, &mapi, capi_generation).await
}

/// Recreate an infrastructure machine that disappeared under a CAPI-authoritative machine
async fn recreate_infra(
    ctx: &Context,
    linked: &LinkedMachines,
    capi: &CapiMachine,
    cluster: &ClusterContext,
) -> Result<Action, Error> {
    let Some(mapi) = linked.mapi.as_ref() else {
        let kind = ctx.platform.infra_machine_resource().kind;
        let err = Error::missing_counterpart(kind, linked.infra_name());
        return report_failure(ctx, linked, reasons::MIRROR_NOT_FOUND, err).await;
    };

    let conversion = match ctx.platform.to_capi(mapi, cluster) {
        Ok(conversion) => conversion,
        Err(e) => return report_failure(ctx, linked, reasons::CONVERSION_FAILED, e).await,
    };

    let mut infra = conversion.infra;
    infra.metadata.name = Some(linked.infra_name().to_string());
    infra.metadata.namespace = Some(ctx.config.capi_namespace.clone());
    infra.metadata.owner_references = capi.controller_owner_ref(&()).map(|r| vec![r]);
    infra.metadata.finalizers = Some(vec![SYNC_FINALIZER.to_string()]);
    infra
        .metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(CLUSTER_NAME_LABEL.to_string(), cluster.name.clone());

    warn!(
        name = linked.infra_name(),
        "infrastructure machine of a CAPI-authoritative machine is missing, recreating it"
    );
    if let Err(e) = ctx.client.create_infra_machine(&infra).await {
        return report_failure(ctx, linked, reasons::INFRA_CREATE_FAILED, e).await;
    }
    report_progressing(ctx, linked, "Recreated missing infrastructure machine").await
}

// =============================================================================
// Shared steps
// =============================================================================

/// Run the deletion coordinator; `Some` means the pass ends here
async fn intercept_deletion(
    ctx: &Context,
    linked: &LinkedMachines,
    direction: Direction,
) -> Result<Option<Action>, Error> {
    let propagating = match (linked.meta(direction.authoritative()), linked.meta(direction.mirror())) {
        (Some(auth), Some(mirror)) => is_deleting(auth) != is_deleting(mirror),
        _ => false,
    };

    let outcome = reconcile_deletion(ctx.client.as_ref(), linked, direction).await?;
    debug!(?outcome, "deletion check");
    if propagating && outcome == DeletionOutcome::InProgress {
        if let Some(target) = event_target(linked) {
            ctx.events
                .publish(
                    &target,
                    EventType::Normal,
                    event_reasons::DELETION_PROPAGATED,
                    actions::DELETE,
                    Some(format!("Deletion of {} propagated across models", linked.name)),
                )
                .await;
        }
    }
    if !outcome.stops_sync() {
        return Ok(None);
    }
    Ok(Some(if outcome == DeletionOutcome::InProgress {
        Action::requeue(STEP_REQUEUE)
    } else {
        Action::await_change()
    }))
}

/// Add the bookkeeping finalizer to every linked object that lacks it
///
/// The finalizer must be stored before any destructive step can run, so any
/// addition ends the pass.
async fn ensure_sync_finalizers(
    ctx: &Context,
    linked: &LinkedMachines,
) -> Result<Option<Action>, Error> {
    let client = ctx.client.as_ref();
    let mut added = false;
    for kind in [
        LinkedKind::MapiMachine,
        LinkedKind::CapiMachine,
        LinkedKind::InfraMachine,
    ] {
        let Some(meta) = linked.meta(kind).filter(|m| !is_deleting(m)) else {
            continue;
        };
        let Some(finalizers) = with_finalizer(meta, SYNC_FINALIZER) else {
            continue;
        };
        debug!(%kind, "adding sync finalizer");
        let name = linked.name_of(kind);
        if let Err(e) = client
            .set_finalizers(kind, name, meta.resource_version.clone(), finalizers)
            .await
        {
            return report_failure(ctx, linked, reasons::FINALIZER_UPDATE_FAILED, e)
                .await
                .map(Some);
        }
        added = true;
    }
    Ok(added.then(|| Action::requeue(STEP_REQUEUE)))
}

/// Object events about the logical machine are published on
fn event_target(linked: &LinkedMachines) -> Option<ObjectReference> {
    match (&linked.mapi, &linked.capi) {
        (Some(mapi), _) => Some(mapi.object_ref(&())),
        (None, Some(capi)) => Some(capi.object_ref(&())),
        (None, None) => None,
    }
}

fn set_paused(meta: &mut ObjectMeta, paused: bool) {
    if paused {
        set_annotation(meta, PAUSED_ANNOTATION, "");
    } else {
        remove_annotation(meta, PAUSED_ANNOTATION);
    }
}

/// Keep labels and annotations the receiving model's controllers added
fn merge_foreign_keys(desired: &mut ObjectMeta, current: &ObjectMeta, prefix: &str) {
    desired.labels = merge_out_of_band(desired.labels.take(), current.labels.as_ref(), prefix);
    desired.annotations =
        merge_out_of_band(desired.annotations.take(), current.annotations.as_ref(), prefix);
}

async fn publish_warnings(ctx: &Context, target: ObjectReference, warnings: &[String]) {
    for warning in warnings {
        ctx.events
            .publish(
                &target,
                EventType::Normal,
                event_reasons::CONVERSION_WARNING,
                actions::SYNC,
                Some(warning.clone()),
            )
            .await;
    }
}

async fn report_synchronized(
    ctx: &Context,
    mapi: &MapiMachine,
    generation: i64,
) -> Result<Action, Error> {
    apply_synchronized_condition(
        ctx.client.as_ref(),
        mapi,
        ConditionStatus::True,
        reasons::RESOURCE_SYNCHRONIZED,
        "",
        generation,
    )
    .await?;
    debug!(generation, "machine synchronized");
    Ok(Action::await_change())
}

async fn report_progressing(
    ctx: &Context,
    linked: &LinkedMachines,
    message: &str,
) -> Result<Action, Error> {
    if let Some(mapi) = linked.mapi.as_ref() {
        apply_synchronized_condition(
            ctx.client.as_ref(),
            mapi,
            ConditionStatus::Unknown,
            reasons::PROGRESSING_TO_CREATE_MIRROR_INFRA,
            message,
            0,
        )
        .await?;
    }
    debug!(message, "sync in progress");
    Ok(Action::requeue(ctx.config.progress_requeue))
}

/// Record a failed step and decide how the pass ends
///
/// Terminal failures end the pass without requeue once recorded; everything
/// else is returned so the error policy retries it. A failed condition write
/// is returned together with the original failure.
async fn report_failure(
    ctx: &Context,
    linked: &LinkedMachines,
    reason: &str,
    err: Error,
) -> Result<Action, Error> {
    let message = err.to_string();
    if err.is_terminal() {
        warn!(reason, error = %message, "sync failed, waiting for the machine to change");
    }

    let recorded = match linked.mapi.as_ref() {
        Some(mapi) => {
            apply_synchronized_condition(
                ctx.client.as_ref(),
                mapi,
                ConditionStatus::False,
                reason,
                &message,
                0,
            )
            .await
        }
        None => {
            let worth_an_event =
                err.is_terminal() || matches!(err, Error::MissingCounterpart { .. });
            if let (true, Some(capi)) = (worth_an_event, linked.capi.as_ref()) {
                ctx.events
                    .publish(
                        &capi.object_ref(&()),
                        EventType::Warning,
                        event_reasons::SYNC_FAILED,
                        actions::SYNC,
                        Some(format!("{reason}: {message}")),
                    )
                    .await;
            }
            Ok(())
        }
    };

    match recorded {
        Ok(()) if err.is_terminal() => Ok(Action::await_change()),
        Ok(()) => Err(err),
        Err(condition) => Err(err.with_condition_failure(condition)),
    }
}
