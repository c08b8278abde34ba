//! Resource store access for the sync core
//!
//! Every read and write the reconciler performs goes through [`MachineClient`]
//! so the state machine can be driven against an in-memory store in tests.
//! All writes are resource-version checked; a stale write surfaces as a 409
//! and the pass is retried from a fresh read.

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::{Client, Resource};
use serde_json::json;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use machinesync_common::crd::{
    CapiCluster, CapiMachine, CapiMachineSet, MapiMachine, MapiMachineSet,
};
use machinesync_common::{Error, FIELD_MANAGER};

/// The three objects that make up one logical machine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LinkedKind {
    /// Legacy machine in the Machine API namespace
    MapiMachine,
    /// Cluster API machine in the CAPI namespace
    CapiMachine,
    /// Platform infrastructure machine in the CAPI namespace
    InfraMachine,
}

impl fmt::Display for LinkedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MapiMachine => write!(f, "MAPI Machine"),
            Self::CapiMachine => write!(f, "CAPI Machine"),
            Self::InfraMachine => write!(f, "infrastructure machine"),
        }
    }
}

/// Trait abstracting resource store operations for machine sync
///
/// Getters return `Ok(None)` for absent objects so "absent" is a value,
/// never an error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineClient: Send + Sync {
    /// Get a legacy machine by name
    async fn get_mapi_machine(&self, name: &str) -> Result<Option<MapiMachine>, Error>;

    /// Get a CAPI machine by name
    async fn get_capi_machine(&self, name: &str) -> Result<Option<CapiMachine>, Error>;

    /// Get an infrastructure machine by name
    async fn get_infra_machine(&self, name: &str) -> Result<Option<DynamicObject>, Error>;

    /// Get a legacy machine set by name
    async fn get_mapi_machine_set(&self, name: &str) -> Result<Option<MapiMachineSet>, Error>;

    /// Get a CAPI machine set by name
    async fn get_capi_machine_set(&self, name: &str) -> Result<Option<CapiMachineSet>, Error>;

    /// Get a CAPI cluster by name
    async fn get_capi_cluster(&self, name: &str) -> Result<Option<CapiCluster>, Error>;

    /// Get an infrastructure cluster by name
    async fn get_infra_cluster(&self, name: &str) -> Result<Option<DynamicObject>, Error>;

    /// Create a legacy machine, returning the stored object
    async fn create_mapi_machine(&self, machine: &MapiMachine) -> Result<MapiMachine, Error>;

    /// Replace a legacy machine (spec and metadata)
    async fn update_mapi_machine(&self, machine: &MapiMachine) -> Result<MapiMachine, Error>;

    /// Replace the status of a legacy machine
    async fn update_mapi_machine_status(&self, machine: &MapiMachine)
        -> Result<MapiMachine, Error>;

    /// Create a CAPI machine, returning the stored object
    async fn create_capi_machine(&self, machine: &CapiMachine) -> Result<CapiMachine, Error>;

    /// Replace a CAPI machine (spec and metadata)
    async fn update_capi_machine(&self, machine: &CapiMachine) -> Result<CapiMachine, Error>;

    /// Replace the status of a CAPI machine
    async fn update_capi_machine_status(&self, machine: &CapiMachine)
        -> Result<CapiMachine, Error>;

    /// Create an infrastructure machine, returning the stored object
    async fn create_infra_machine(&self, machine: &DynamicObject) -> Result<DynamicObject, Error>;

    /// Request deletion; an already absent object is not an error
    async fn delete(&self, kind: LinkedKind, name: &str) -> Result<(), Error>;

    /// Overwrite the finalizer list, guarded by `resource_version` when given
    async fn set_finalizers(
        &self,
        kind: LinkedKind,
        name: &str,
        resource_version: Option<String>,
        finalizers: Vec<String>,
    ) -> Result<(), Error>;

    /// Server-side apply a status fragment on a legacy machine with forced ownership
    async fn apply_mapi_status(&self, name: &str, patch: serde_json::Value) -> Result<(), Error>;
}

/// Real resource store implementation backed by the Kubernetes API
pub struct KubeMachineClient {
    client: Client,
    mapi_namespace: String,
    capi_namespace: String,
    infra_machine: ApiResource,
    infra_cluster: ApiResource,
}

impl KubeMachineClient {
    /// Create a client for the given namespaces and platform infrastructure kinds
    pub fn new(
        client: Client,
        mapi_namespace: &str,
        capi_namespace: &str,
        infra_machine: ApiResource,
        infra_cluster: ApiResource,
    ) -> Self {
        Self {
            client,
            mapi_namespace: mapi_namespace.to_string(),
            capi_namespace: capi_namespace.to_string(),
            infra_machine,
            infra_cluster,
        }
    }

    fn mapi<K>(&self) -> Api<K>
    where
        K: Resource<Scope = kube::core::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.mapi_namespace)
    }

    fn capi<K>(&self) -> Api<K>
    where
        K: Resource<Scope = kube::core::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.capi_namespace)
    }

    fn infra_machines(&self) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.capi_namespace, &self.infra_machine)
    }

    fn infra_clusters(&self) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.capi_namespace, &self.infra_cluster)
    }

    fn dynamic(&self, kind: LinkedKind) -> Api<DynamicObject> {
        match kind {
            LinkedKind::MapiMachine => Api::namespaced_with(
                self.client.clone(),
                &self.mapi_namespace,
                &ApiResource::erase::<MapiMachine>(&()),
            ),
            LinkedKind::CapiMachine => Api::namespaced_with(
                self.client.clone(),
                &self.capi_namespace,
                &ApiResource::erase::<CapiMachine>(&()),
            ),
            LinkedKind::InfraMachine => self.infra_machines(),
        }
    }
}

/// Name of an object about to be written
fn object_name<'a>(kind: &str, meta: &'a ObjectMeta) -> Result<&'a str, Error> {
    meta.name
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::internal_with_context("client", format!("{kind} has no name")))
}

fn status_body<K: serde::Serialize>(kind: &str, object: &K) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(object).map_err(|e| Error::serialization_for_kind(kind, e.to_string()))
}

#[async_trait]
impl MachineClient for KubeMachineClient {
    async fn get_mapi_machine(&self, name: &str) -> Result<Option<MapiMachine>, Error> {
        Ok(self.mapi::<MapiMachine>().get_opt(name).await?)
    }

    async fn get_capi_machine(&self, name: &str) -> Result<Option<CapiMachine>, Error> {
        Ok(self.capi::<CapiMachine>().get_opt(name).await?)
    }

    async fn get_infra_machine(&self, name: &str) -> Result<Option<DynamicObject>, Error> {
        Ok(self.infra_machines().get_opt(name).await?)
    }

    async fn get_mapi_machine_set(&self, name: &str) -> Result<Option<MapiMachineSet>, Error> {
        Ok(self.mapi::<MapiMachineSet>().get_opt(name).await?)
    }

    async fn get_capi_machine_set(&self, name: &str) -> Result<Option<CapiMachineSet>, Error> {
        Ok(self.capi::<CapiMachineSet>().get_opt(name).await?)
    }

    async fn get_capi_cluster(&self, name: &str) -> Result<Option<CapiCluster>, Error> {
        Ok(self.capi::<CapiCluster>().get_opt(name).await?)
    }

    async fn get_infra_cluster(&self, name: &str) -> Result<Option<DynamicObject>, Error> {
        Ok(self.infra_clusters().get_opt(name).await?)
    }

    async fn create_mapi_machine(&self, machine: &MapiMachine) -> Result<MapiMachine, Error> {
        Ok(self
            .mapi::<MapiMachine>()
            .create(&PostParams::default(), machine)
            .await?)
    }

    async fn update_mapi_machine(&self, machine: &MapiMachine) -> Result<MapiMachine, Error> {
        let name = object_name("Machine", &machine.metadata)?;
        Ok(self
            .mapi::<MapiMachine>()
            .replace(name, &PostParams::default(), machine)
            .await?)
    }

    async fn update_mapi_machine_status(
        &self,
        machine: &MapiMachine,
    ) -> Result<MapiMachine, Error> {
        let name = object_name("Machine", &machine.metadata)?;
        let body = status_body("Machine", machine)?;
        Ok(self
            .mapi::<MapiMachine>()
            .replace_status(name, &PostParams::default(), body)
            .await?)
    }

    async fn create_capi_machine(&self, machine: &CapiMachine) -> Result<CapiMachine, Error> {
        Ok(self
            .capi::<CapiMachine>()
            .create(&PostParams::default(), machine)
            .await?)
    }

    async fn update_capi_machine(&self, machine: &CapiMachine) -> Result<CapiMachine, Error> {
        let name = object_name("Machine", &machine.metadata)?;
        Ok(self
            .capi::<CapiMachine>()
            .replace(name, &PostParams::default(), machine)
            .await?)
    }

    async fn update_capi_machine_status(
        &self,
        machine: &CapiMachine,
    ) -> Result<CapiMachine, Error> {
        let name = object_name("Machine", &machine.metadata)?;
        let body = status_body("Machine", machine)?;
        Ok(self
            .capi::<CapiMachine>()
            .replace_status(name, &PostParams::default(), body)
            .await?)
    }

    async fn create_infra_machine(&self, machine: &DynamicObject) -> Result<DynamicObject, Error> {
        Ok(self
            .infra_machines()
            .create(&PostParams::default(), machine)
            .await?)
    }

    async fn delete(&self, kind: LinkedKind, name: &str) -> Result<(), Error> {
        match self.dynamic(kind).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = Error::from(e);
                if err.is_not_found() {
                    debug!(%kind, name, "Already deleted");
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn set_finalizers(
        &self,
        kind: LinkedKind,
        name: &str,
        resource_version: Option<String>,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let mut patch = json!({ "metadata": { "finalizers": finalizers } });
        if let Some(rv) = resource_version {
            patch["metadata"]["resourceVersion"] = json!(rv);
        }
        self.dynamic(kind)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn apply_mapi_status(&self, name: &str, patch: serde_json::Value) -> Result<(), Error> {
        self.mapi::<MapiMachine>()
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&patch),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linked_kinds_render_for_logs() {
        assert_eq!(LinkedKind::MapiMachine.to_string(), "MAPI Machine");
        assert_eq!(LinkedKind::InfraMachine.to_string(), "infrastructure machine");
    }

    #[test]
    fn writes_need_a_named_object() {
        let named = ObjectMeta {
            name: Some("worker-a".to_string()),
            ..Default::default()
        };
        assert_eq!(object_name("Machine", &named).unwrap(), "worker-a");

        let err = object_name("Machine", &ObjectMeta::default()).unwrap_err();
        assert!(err.to_string().contains("[client]"));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn mock_client_reports_absent_objects_as_none() {
        let mut mock = MockMachineClient::new();
        mock.expect_get_capi_machine()
            .withf(|name| name == "worker-a")
            .returning(|_| Ok(None));

        let client: &dyn MachineClient = &mock;
        assert!(client.get_capi_machine("worker-a").await.unwrap().is_none());
    }
}
