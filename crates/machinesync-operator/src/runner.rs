//! Controller runner - builds the controller futures
//!
//! Both controllers share one [`Context`] and funnel into the same name-keyed
//! dispatcher; the watches only decide which machine name to enqueue.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::api::DynamicObject;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource, ResourceExt};

use machinesync_common::crd::{CapiMachine, MapiMachine};
use machinesync_controller::controller::{error_policy, reconcile, reconcile_capi, Context};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Name of the machine an infrastructure machine belongs to
fn owning_machine(infra: &DynamicObject) -> String {
    infra
        .owner_references()
        .iter()
        .find(|o| o.kind == "Machine" && o.controller == Some(true))
        .map(|o| o.name.clone())
        .unwrap_or_else(|| infra.name_any())
}

/// Map infrastructure machine events to the owning machine of kind `K` in `namespace`
fn infra_mapper<K>(
    namespace: String,
) -> impl Fn(DynamicObject) -> Option<ObjectRef<K>> + Send + 'static
where
    K: Resource + 'static,
    K::DynamicType: Default,
{
    move |infra| Some(ObjectRef::<K>::new(&owning_machine(&infra)).within(&namespace))
}

/// Build the machine sync controller futures
pub fn build_controllers(client: Client, ctx: Arc<Context>) -> Vec<ControllerFuture> {
    let mapi_ns = ctx.config.mapi_namespace.clone();
    let capi_ns = ctx.config.capi_namespace.clone();
    let infra_resource = ctx.platform.infra_machine_resource();

    let mapi_machines: Api<MapiMachine> = Api::namespaced(client.clone(), &mapi_ns);
    let capi_machines: Api<CapiMachine> = Api::namespaced(client.clone(), &capi_ns);
    let infra_machines: Api<DynamicObject> =
        Api::namespaced_with(client, &capi_ns, &infra_resource);

    let mapi_ns_for_capi = mapi_ns.clone();

    let mapi_ctrl = Controller::new(
        mapi_machines,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .watches(
        capi_machines.clone(),
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        move |capi: CapiMachine| {
            Some(ObjectRef::<MapiMachine>::new(&capi.name_any()).within(&mapi_ns_for_capi))
        },
    )
    .watches_with(
        infra_machines.clone(),
        infra_resource.clone(),
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        infra_mapper::<MapiMachine>(mapi_ns),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy::<MapiMachine>, ctx.clone())
    .for_each(log_reconcile_result("Machine API machine"));

    let capi_ctrl = Controller::new(
        capi_machines,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .watches_with(
        infra_machines,
        infra_resource,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        infra_mapper::<CapiMachine>(capi_ns),
    )
    .shutdown_on_signal()
    .run(reconcile_capi, error_policy::<CapiMachine>, ctx)
    .for_each(log_reconcile_result("Cluster API machine"));

    tracing::info!("- Machine API machine controller");
    tracing::info!("- Cluster API machine controller");

    vec![Box::pin(mapi_ctrl), Box::pin(capi_ctrl)]
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
