//! In-memory resource store for reconcile tests
//!
//! Behaves like the API server where the sync core depends on it: resource
//! versions are checked on writes, generations advance on spec changes, status
//! is only written through the status calls, and deletion is gated on
//! finalizers. Every write is appended to a log so tests can assert exactly
//! what a pass did.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::DynamicObject;
use kube::Resource;
use serde_json::Value;

use machinesync_common::crd::{
    CapiCluster, CapiMachine, CapiMachineSet, Condition, MapiMachine, MapiMachineSet,
};
use machinesync_common::Error;

use crate::client::{LinkedKind, MachineClient};

/// One write issued against the store
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Write {
    Create(LinkedKind, String),
    Update(LinkedKind, String),
    UpdateStatus(LinkedKind, String),
    Delete(LinkedKind, String),
    Finalizers(LinkedKind, String),
    ApplyStatus(String),
}

#[derive(Default)]
struct State {
    mapi: BTreeMap<String, MapiMachine>,
    capi: BTreeMap<String, CapiMachine>,
    infra: BTreeMap<String, DynamicObject>,
    mapi_sets: BTreeMap<String, MapiMachineSet>,
    capi_sets: BTreeMap<String, CapiMachineSet>,
    clusters: BTreeMap<String, CapiCluster>,
    infra_clusters: BTreeMap<String, DynamicObject>,
    revision: u64,
    writes: Vec<Write>,
}

impl State {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::Kube {
        source: kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message,
            reason: reason.to_string(),
            code,
        }),
    }
}

fn not_found(name: &str) -> Error {
    api_error(404, "NotFound", format!("{name} not found"))
}

fn check_revision(stored: &ObjectMeta, given: Option<&String>) -> Result<(), Error> {
    match given {
        Some(rv) if stored.resource_version.as_ref() != Some(rv) => Err(api_error(
            409,
            "Conflict",
            format!(
                "resource version {rv} is stale (current {:?})",
                stored.resource_version
            ),
        )),
        _ => Ok(()),
    }
}

fn admit(meta: &mut ObjectMeta, revision: String) {
    let name = meta.name.clone().unwrap_or_default();
    meta.uid.get_or_insert_with(|| format!("{name}-uid-{revision}"));
    meta.generation.get_or_insert(1);
    meta.creation_timestamp
        .get_or_insert_with(|| Time(Utc::now()));
    meta.resource_version = Some(revision);
}

/// Store the object, or drop it if it is deleting and no finalizer is left
fn settle<K: Resource + Clone>(map: &mut BTreeMap<String, K>, name: &str, object: K) {
    let meta = object.meta();
    let released = meta.deletion_timestamp.is_some()
        && meta.finalizers.as_ref().map_or(true, |f| f.is_empty());
    if released {
        map.remove(name);
    } else {
        map.insert(name.to_string(), object);
    }
}

fn create_in<K: Resource + Clone>(
    map: &mut BTreeMap<String, K>,
    object: &K,
    revision: String,
    clear_status: fn(&mut K),
) -> Result<K, Error> {
    let name = object.meta().name.clone().unwrap_or_default();
    if map.contains_key(&name) {
        return Err(api_error(409, "AlreadyExists", format!("{name} already exists")));
    }
    let mut stored = object.clone();
    clear_status(&mut stored);
    let meta = stored.meta_mut();
    meta.uid = None;
    meta.generation = None;
    meta.creation_timestamp = None;
    meta.deletion_timestamp = None;
    admit(meta, revision);
    map.insert(name, stored.clone());
    Ok(stored)
}

fn update_in<K: Resource + Clone>(
    map: &mut BTreeMap<String, K>,
    object: &K,
    revision: String,
    spec_of: fn(&K) -> Value,
    keep_status: fn(&mut K, &K),
) -> Result<K, Error> {
    let name = object.meta().name.clone().unwrap_or_default();
    let stored = map.get(&name).ok_or_else(|| not_found(&name))?;
    check_revision(stored.meta(), object.meta().resource_version.as_ref())?;

    let mut next = object.clone();
    keep_status(&mut next, stored);
    let spec_changed = spec_of(stored) != spec_of(&next);
    let previous = stored.meta().clone();
    let meta = next.meta_mut();
    meta.uid = previous.uid;
    meta.creation_timestamp = previous.creation_timestamp;
    meta.deletion_timestamp = previous.deletion_timestamp;
    let generation = previous.generation.unwrap_or(1);
    meta.generation = Some(if spec_changed { generation + 1 } else { generation });
    meta.resource_version = Some(revision);

    settle(map, &name, next.clone());
    Ok(next)
}

fn update_status_in<K: Resource + Clone>(
    map: &mut BTreeMap<String, K>,
    object: &K,
    revision: String,
    copy_status: fn(&mut K, &K),
) -> Result<K, Error> {
    let name = object.meta().name.clone().unwrap_or_default();
    let stored = map.get(&name).ok_or_else(|| not_found(&name))?;
    check_revision(stored.meta(), object.meta().resource_version.as_ref())?;

    let mut next = stored.clone();
    copy_status(&mut next, object);
    next.meta_mut().resource_version = Some(revision);
    map.insert(name, next.clone());
    Ok(next)
}

fn delete_in<K: Resource + Clone>(map: &mut BTreeMap<String, K>, name: &str, revision: String) {
    let Some(mut object) = map.get(name).cloned() else {
        return;
    };
    let meta = object.meta_mut();
    if meta.deletion_timestamp.is_none() {
        meta.deletion_timestamp = Some(Time(Utc::now()));
        meta.resource_version = Some(revision);
    }
    settle(map, name, object);
}

fn finalizers_in<K: Resource + Clone>(
    map: &mut BTreeMap<String, K>,
    name: &str,
    given: Option<&String>,
    finalizers: Vec<String>,
    revision: String,
) -> Result<(), Error> {
    let mut object = map.get(name).cloned().ok_or_else(|| not_found(name))?;
    check_revision(object.meta(), given)?;
    let meta = object.meta_mut();
    meta.finalizers = Some(finalizers);
    meta.resource_version = Some(revision);
    settle(map, name, object);
    Ok(())
}

fn seed_in<K: Resource + Clone>(map: &mut BTreeMap<String, K>, mut object: K, revision: String) {
    let name = object.meta().name.clone().unwrap_or_default();
    admit(object.meta_mut(), revision);
    map.insert(name, object);
}

fn mapi_spec(m: &MapiMachine) -> Value {
    serde_json::to_value(&m.spec).unwrap_or_default()
}

fn capi_spec(m: &CapiMachine) -> Value {
    serde_json::to_value(&m.spec).unwrap_or_default()
}

/// Store-backed [`MachineClient`] for tests
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<State>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn seed_mapi(&self, machine: MapiMachine) {
        self.with(|s| {
            let rv = s.next_revision();
            seed_in(&mut s.mapi, machine, rv)
        })
    }

    pub fn seed_capi(&self, machine: CapiMachine) {
        self.with(|s| {
            let rv = s.next_revision();
            seed_in(&mut s.capi, machine, rv)
        })
    }

    pub fn seed_infra(&self, machine: DynamicObject) {
        self.with(|s| {
            let rv = s.next_revision();
            seed_in(&mut s.infra, machine, rv)
        })
    }

    pub fn seed_mapi_set(&self, set: MapiMachineSet) {
        self.with(|s| {
            let rv = s.next_revision();
            seed_in(&mut s.mapi_sets, set, rv)
        })
    }

    pub fn seed_capi_set(&self, set: CapiMachineSet) {
        self.with(|s| {
            let rv = s.next_revision();
            seed_in(&mut s.capi_sets, set, rv)
        })
    }

    pub fn seed_cluster(&self, cluster: CapiCluster) {
        self.with(|s| {
            let rv = s.next_revision();
            seed_in(&mut s.clusters, cluster, rv)
        })
    }

    pub fn seed_infra_cluster(&self, cluster: DynamicObject) {
        self.with(|s| {
            let rv = s.next_revision();
            seed_in(&mut s.infra_clusters, cluster, rv)
        })
    }

    pub fn mapi(&self, name: &str) -> Option<MapiMachine> {
        self.with(|s| s.mapi.get(name).cloned())
    }

    pub fn capi(&self, name: &str) -> Option<CapiMachine> {
        self.with(|s| s.capi.get(name).cloned())
    }

    pub fn infra(&self, name: &str) -> Option<DynamicObject> {
        self.with(|s| s.infra.get(name).cloned())
    }

    pub fn writes(&self) -> Vec<Write> {
        self.with(|s| s.writes.clone())
    }

    pub fn clear_writes(&self) {
        self.with(|s| s.writes.clear())
    }

    /// Edit a legacy machine the way a user or another controller would
    pub fn edit_mapi(&self, name: &str, edit: impl FnOnce(&mut MapiMachine)) {
        self.with(|s| {
            let rv = s.next_revision();
            if let Some(machine) = s.mapi.get_mut(name) {
                let before = mapi_spec(machine);
                edit(machine);
                if mapi_spec(machine) != before {
                    let generation = machine.metadata.generation.unwrap_or(1);
                    machine.metadata.generation = Some(generation + 1);
                }
                machine.metadata.resource_version = Some(rv);
            }
        })
    }

    /// Edit a CAPI machine the way a user or another controller would
    pub fn edit_capi(&self, name: &str, edit: impl FnOnce(&mut CapiMachine)) {
        self.with(|s| {
            let rv = s.next_revision();
            if let Some(machine) = s.capi.get_mut(name) {
                let before = capi_spec(machine);
                edit(machine);
                if capi_spec(machine) != before {
                    let generation = machine.metadata.generation.unwrap_or(1);
                    machine.metadata.generation = Some(generation + 1);
                }
                machine.metadata.resource_version = Some(rv);
            }
        })
    }

    /// Drop an infrastructure machine regardless of finalizers
    pub fn purge_infra(&self, name: &str) {
        self.with(|s| {
            s.infra.remove(name);
        })
    }

    /// Remove a finalizer the way its owning controller would
    pub fn remove_finalizer(&self, kind: LinkedKind, name: &str, finalizer: &str) {
        self.with(|s| {
            let rv = s.next_revision();
            let strip = |meta: &ObjectMeta| -> Vec<String> {
                meta.finalizers
                    .clone()
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|f| f != finalizer)
                    .collect()
            };
            let result = match kind {
                LinkedKind::MapiMachine => match s.mapi.get(name) {
                    Some(m) => {
                        let remaining = strip(&m.metadata);
                        finalizers_in(&mut s.mapi, name, None, remaining, rv)
                    }
                    None => Ok(()),
                },
                LinkedKind::CapiMachine => match s.capi.get(name) {
                    Some(m) => {
                        let remaining = strip(&m.metadata);
                        finalizers_in(&mut s.capi, name, None, remaining, rv)
                    }
                    None => Ok(()),
                },
                LinkedKind::InfraMachine => match s.infra.get(name) {
                    Some(m) => {
                        let remaining = strip(&m.metadata);
                        finalizers_in(&mut s.infra, name, None, remaining, rv)
                    }
                    None => Ok(()),
                },
            };
            result.unwrap();
        })
    }
}

#[async_trait]
impl MachineClient for FakeStore {
    async fn get_mapi_machine(&self, name: &str) -> Result<Option<MapiMachine>, Error> {
        Ok(self.mapi(name))
    }

    async fn get_capi_machine(&self, name: &str) -> Result<Option<CapiMachine>, Error> {
        Ok(self.capi(name))
    }

    async fn get_infra_machine(&self, name: &str) -> Result<Option<DynamicObject>, Error> {
        Ok(self.infra(name))
    }

    async fn get_mapi_machine_set(&self, name: &str) -> Result<Option<MapiMachineSet>, Error> {
        Ok(self.with(|s| s.mapi_sets.get(name).cloned()))
    }

    async fn get_capi_machine_set(&self, name: &str) -> Result<Option<CapiMachineSet>, Error> {
        Ok(self.with(|s| s.capi_sets.get(name).cloned()))
    }

    async fn get_capi_cluster(&self, name: &str) -> Result<Option<CapiCluster>, Error> {
        Ok(self.with(|s| s.clusters.get(name).cloned()))
    }

    async fn get_infra_cluster(&self, name: &str) -> Result<Option<DynamicObject>, Error> {
        Ok(self.with(|s| s.infra_clusters.get(name).cloned()))
    }

    async fn create_mapi_machine(&self, machine: &MapiMachine) -> Result<MapiMachine, Error> {
        self.with(|s| {
            let rv = s.next_revision();
            let created = create_in(&mut s.mapi, machine, rv, |m| m.status = None)?;
            s.writes
                .push(Write::Create(LinkedKind::MapiMachine, created.metadata.name.clone().unwrap_or_default()));
            Ok(created)
        })
    }

    async fn update_mapi_machine(&self, machine: &MapiMachine) -> Result<MapiMachine, Error> {
        self.with(|s| {
            let rv = s.next_revision();
            let updated = update_in(&mut s.mapi, machine, rv, mapi_spec, |next, stored| {
                next.status = stored.status.clone()
            })?;
            s.writes
                .push(Write::Update(LinkedKind::MapiMachine, updated.metadata.name.clone().unwrap_or_default()));
            Ok(updated)
        })
    }

    async fn update_mapi_machine_status(
        &self,
        machine: &MapiMachine,
    ) -> Result<MapiMachine, Error> {
        self.with(|s| {
            let rv = s.next_revision();
            let updated = update_status_in(&mut s.mapi, machine, rv, |next, given| {
                next.status = given.status.clone()
            })?;
            s.writes.push(Write::UpdateStatus(
                LinkedKind::MapiMachine,
                updated.metadata.name.clone().unwrap_or_default(),
            ));
            Ok(updated)
        })
    }

    async fn create_capi_machine(&self, machine: &CapiMachine) -> Result<CapiMachine, Error> {
        self.with(|s| {
            let rv = s.next_revision();
            let created = create_in(&mut s.capi, machine, rv, |m| m.status = None)?;
            s.writes
                .push(Write::Create(LinkedKind::CapiMachine, created.metadata.name.clone().unwrap_or_default()));
            Ok(created)
        })
    }

    async fn update_capi_machine(&self, machine: &CapiMachine) -> Result<CapiMachine, Error> {
        self.with(|s| {
            let rv = s.next_revision();
            let updated = update_in(&mut s.capi, machine, rv, capi_spec, |next, stored| {
                next.status = stored.status.clone()
            })?;
            s.writes
                .push(Write::Update(LinkedKind::CapiMachine, updated.metadata.name.clone().unwrap_or_default()));
            Ok(updated)
        })
    }

    async fn update_capi_machine_status(
        &self,
        machine: &CapiMachine,
    ) -> Result<CapiMachine, Error> {
        self.with(|s| {
            let rv = s.next_revision();
            let updated = update_status_in(&mut s.capi, machine, rv, |next, given| {
                next.status = given.status.clone()
            })?;
            s.writes.push(Write::UpdateStatus(
                LinkedKind::CapiMachine,
                updated.metadata.name.clone().unwrap_or_default(),
            ));
            Ok(updated)
        })
    }

    async fn create_infra_machine(&self, machine: &DynamicObject) -> Result<DynamicObject, Error> {
        self.with(|s| {
            let rv = s.next_revision();
            let created = create_in(&mut s.infra, machine, rv, |_| {})?;
            s.writes.push(Write::Create(
                LinkedKind::InfraMachine,
                created.metadata.name.clone().unwrap_or_default(),
            ));
            Ok(created)
        })
    }

    async fn delete(&self, kind: LinkedKind, name: &str) -> Result<(), Error> {
        self.with(|s| {
            let rv = s.next_revision();
            match kind {
                LinkedKind::MapiMachine => delete_in(&mut s.mapi, name, rv),
                LinkedKind::CapiMachine => delete_in(&mut s.capi, name, rv),
                LinkedKind::InfraMachine => delete_in(&mut s.infra, name, rv),
            }
            s.writes.push(Write::Delete(kind, name.to_string()));
            Ok(())
        })
    }

    async fn set_finalizers(
        &self,
        kind: LinkedKind,
        name: &str,
        resource_version: Option<String>,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        self.with(|s| {
            let rv = s.next_revision();
            let given = resource_version.as_ref();
            match kind {
                LinkedKind::MapiMachine => finalizers_in(&mut s.mapi, name, given, finalizers, rv),
                LinkedKind::CapiMachine => finalizers_in(&mut s.capi, name, given, finalizers, rv),
                LinkedKind::InfraMachine => {
                    finalizers_in(&mut s.infra, name, given, finalizers, rv)
                }
            }?;
            s.writes.push(Write::Finalizers(kind, name.to_string()));
            Ok(())
        })
    }

    async fn apply_mapi_status(&self, name: &str, patch: Value) -> Result<(), Error> {
        self.with(|s| {
            let rv = s.next_revision();
            let machine = s.mapi.get_mut(name).ok_or_else(|| not_found(name))?;
            let applied: Vec<Condition> =
                serde_json::from_value(patch["status"]["conditions"].clone())
                    .map_err(|e| Error::serialization(e.to_string()))?;
            let status = machine.status.get_or_insert_with(Default::default);
            for condition in applied {
                match status.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
                    Some(existing) => *existing = condition,
                    None => status.conditions.push(condition),
                }
            }
            if let Some(generation) = patch["status"]["synchronizedGeneration"].as_i64() {
                status.synchronized_generation = generation;
            }
            machine.metadata.resource_version = Some(rv);
            s.writes.push(Write::ApplyStatus(name.to_string()));
            Ok(())
        })
    }
}

/// Metadata with the given finalizers, optionally already marked for deletion
pub fn deleting_meta(name: &str, finalizers: &[&str], deleting: bool) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        finalizers: Some(finalizers.iter().map(|f| f.to_string()).collect()),
        deletion_timestamp: deleting.then(|| Time(Utc::now())),
        ..Default::default()
    }
}
