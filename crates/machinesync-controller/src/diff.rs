//! Structural comparison of current and desired machines
//!
//! Every write produces a watch event and therefore another reconcile, so a
//! write is only issued when the [`ChangeSet`] is non-empty. The opaque
//! provider payload is compared in its canonical form so that reordered
//! lists do not register as changes.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;
use serde_json::{json, Value};

use machinesync_common::crd::{CapiMachine, MapiMachine};

use crate::platform::PlatformStrategy;

/// Spec fields other than the provider payload
pub const SPEC: &str = ".spec";
/// Labels, annotations, owner references and finalizers
pub const METADATA: &str = ".metadata";
/// The provider payload
pub const PROVIDER_SPEC: &str = ".providerSpec";
/// Status fields
pub const STATUS: &str = ".status";

/// Differing field paths, grouped by key
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChangeSet {
    changes: BTreeMap<&'static str, Vec<String>>,
}

impl ChangeSet {
    fn record(&mut self, key: &'static str, paths: Vec<String>) {
        if !paths.is_empty() {
            self.changes.insert(key, paths);
        }
    }

    /// True if nothing differs
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// True if the given key has changes
    pub fn has(&self, key: &str) -> bool {
        self.changes.contains_key(key)
    }

    /// True if anything written through the main resource differs
    pub fn has_object_changes(&self) -> bool {
        self.has(SPEC) || self.has(METADATA) || self.has(PROVIDER_SPEC)
    }

    /// Paths that differ under a key
    pub fn paths(&self, key: &str) -> &[String] {
        self.changes.get(key).map(Vec::as_slice).unwrap_or_default()
    }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .changes
            .iter()
            .map(|(key, paths)| format!("{key}: [{}]", paths.join(", ")))
            .collect();
        write!(f, "{{{}}}", parts.join("; "))
    }
}

/// Paths under `prefix` where two JSON documents differ
///
/// Missing keys compare equal to `null`. Arrays of equal length are compared
/// element-wise; arrays of different lengths differ as a whole.
pub fn json_paths(prefix: &str, current: &Value, desired: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    collect_paths(prefix, current, desired, &mut paths);
    paths
}

fn collect_paths(path: &str, current: &Value, desired: &Value, out: &mut Vec<String>) {
    match (current, desired) {
        (Value::Object(a), Value::Object(b)) => {
            let keys: std::collections::BTreeSet<&String> = a.keys().chain(b.keys()).collect();
            for key in keys {
                let child = format!("{path}.{key}");
                collect_paths(
                    &child,
                    a.get(key).unwrap_or(&Value::Null),
                    b.get(key).unwrap_or(&Value::Null),
                    out,
                );
            }
        }
        (Value::Array(a), Value::Array(b)) if a.len() == b.len() => {
            for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
                collect_paths(&format!("{path}[{i}]"), x, y, out);
            }
        }
        (a, b) if a == b => {}
        _ => out.push(path.to_string()),
    }
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_default()
}

fn metadata_value(meta: &ObjectMeta) -> Value {
    json!({
        "labels": meta.labels.clone().unwrap_or_default(),
        "annotations": meta.annotations.clone().unwrap_or_default(),
        "ownerReferences": meta.owner_references.clone().unwrap_or_default(),
        "finalizers": meta.finalizers.clone().unwrap_or_default(),
    })
}

/// Compare two CAPI machines
pub fn diff_capi_machines(current: &CapiMachine, desired: &CapiMachine) -> ChangeSet {
    let mut changes = ChangeSet::default();
    changes.record(
        SPEC,
        json_paths("spec", &to_json(&current.spec), &to_json(&desired.spec)),
    );
    changes.record(
        METADATA,
        json_paths(
            "metadata",
            &metadata_value(&current.metadata),
            &metadata_value(&desired.metadata),
        ),
    );
    changes.record(
        STATUS,
        json_paths(
            "status",
            &to_json(&current.status.clone().unwrap_or_default()),
            &to_json(&desired.status.clone().unwrap_or_default()),
        ),
    );
    changes
}

/// Compare two legacy machines, the provider payload through the platform's canonical form
pub fn diff_mapi_machines(
    current: &MapiMachine,
    desired: &MapiMachine,
    platform: &dyn PlatformStrategy,
) -> ChangeSet {
    let spec_without_payload = |machine: &MapiMachine| {
        let mut spec = to_json(&machine.spec);
        if let Some(map) = spec.as_object_mut() {
            map.remove("providerSpec");
        }
        spec
    };
    let payload = |machine: &MapiMachine| {
        machine
            .spec
            .provider_spec
            .value
            .as_ref()
            .map(|v| platform.canonical_provider_spec(v))
            .unwrap_or_default()
    };

    let mut changes = ChangeSet::default();
    changes.record(
        SPEC,
        json_paths(
            "spec",
            &spec_without_payload(current),
            &spec_without_payload(desired),
        ),
    );
    changes.record(
        PROVIDER_SPEC,
        json_paths(
            "spec.providerSpec.value",
            &payload(current),
            &payload(desired),
        ),
    );
    changes.record(
        METADATA,
        json_paths(
            "metadata",
            &metadata_value(&current.metadata),
            &metadata_value(&desired.metadata),
        ),
    );
    changes.record(
        STATUS,
        json_paths(
            "status",
            &to_json(&current.status.clone().unwrap_or_default()),
            &to_json(&desired.status.clone().unwrap_or_default()),
        ),
    );
    changes
}
