//! Object metadata helpers shared by the sync procedures
//!
//! All helpers work on `ObjectMeta` so the same code handles both machine
//! models and the dynamically typed infrastructure objects.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// True if the object has been marked for deletion
pub fn is_deleting(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}

/// True if the object carries the given finalizer
pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|existing| existing == finalizer))
}

/// Finalizer list with `finalizer` appended, or `None` if it is already present
pub fn with_finalizer(meta: &ObjectMeta, finalizer: &str) -> Option<Vec<String>> {
    if has_finalizer(meta, finalizer) {
        return None;
    }
    let mut finalizers = meta.finalizers.clone().unwrap_or_default();
    finalizers.push(finalizer.to_string());
    Some(finalizers)
}

/// Finalizer list without entries matching `remove`, or `None` if nothing matched
pub fn without_finalizers(
    meta: &ObjectMeta,
    remove: impl Fn(&str) -> bool,
) -> Option<Vec<String>> {
    let current = meta.finalizers.as_deref().unwrap_or_default();
    let kept: Vec<String> = current.iter().filter(|f| !remove(f)).cloned().collect();
    (kept.len() != current.len()).then_some(kept)
}

/// Set an annotation, creating the map if needed
pub fn set_annotation(meta: &mut ObjectMeta, key: &str, value: &str) {
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
}

/// Remove an annotation, dropping the map when it becomes empty
pub fn remove_annotation(meta: &mut ObjectMeta, key: &str) {
    if let Some(annotations) = meta.annotations.as_mut() {
        annotations.remove(key);
        if annotations.is_empty() {
            meta.annotations = None;
        }
    }
}

/// Copy server-managed identity fields from the current object onto a freshly
/// converted one so an update targets the observed resource version
pub fn splice_identity(target: &mut ObjectMeta, current: &ObjectMeta) {
    target.resource_version = current.resource_version.clone();
    target.generation = current.generation;
    target.uid = current.uid.clone();
    target.creation_timestamp = current.creation_timestamp.clone();
    target.deletion_timestamp = current.deletion_timestamp.clone();
    target.finalizers = current.finalizers.clone();
}

/// Merge keys another controller added out-of-band back into a converted map
///
/// Keys under `prefix` that exist on the current object but were not produced
/// by the conversion are kept; everything else comes from the conversion.
pub fn merge_out_of_band(
    converted: Option<BTreeMap<String, String>>,
    current: Option<&BTreeMap<String, String>>,
    prefix: &str,
) -> Option<BTreeMap<String, String>> {
    let mut merged = converted.unwrap_or_default();
    if let Some(current) = current {
        for (key, value) in current {
            if key.starts_with(prefix) && !merged.contains_key(key) {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    (!merged.is_empty()).then_some(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn meta_with_finalizers(finalizers: &[&str]) -> ObjectMeta {
        ObjectMeta {
            name: Some("worker-a".to_string()),
            finalizers: Some(finalizers.iter().map(|f| f.to_string()).collect()),
            ..Default::default()
        }
    }

    #[test]
    fn with_finalizer_only_adds_once() {
        let meta = meta_with_finalizers(&["a"]);
        assert_eq!(with_finalizer(&meta, "b"), Some(vec!["a".into(), "b".into()]));
        assert_eq!(with_finalizer(&meta, "a"), None);
        assert_eq!(
            with_finalizer(&ObjectMeta::default(), "a"),
            Some(vec!["a".into()])
        );
    }

    #[test]
    fn without_finalizers_reports_no_change() {
        let meta = meta_with_finalizers(&["a", "x.infrastructure.cluster.x-k8s.io", "b"]);
        assert_eq!(
            without_finalizers(&meta, |f| f.ends_with(".infrastructure.cluster.x-k8s.io")),
            Some(vec!["a".into(), "b".into()])
        );
        assert_eq!(without_finalizers(&meta, |f| f == "missing"), None);
        assert_eq!(without_finalizers(&ObjectMeta::default(), |_| true), None);
    }

    #[test]
    fn deletion_and_annotations() {
        let mut meta = ObjectMeta::default();
        assert!(!is_deleting(&meta));
        meta.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(is_deleting(&meta));

        set_annotation(&mut meta, "cluster.x-k8s.io/paused", "");
        assert_eq!(meta.annotations.as_ref().map(|a| a.len()), Some(1));
        remove_annotation(&mut meta, "cluster.x-k8s.io/paused");
        assert!(meta.annotations.is_none());
    }

    #[test]
    fn splice_identity_takes_server_fields_from_current() {
        let current = ObjectMeta {
            name: Some("worker-a".into()),
            resource_version: Some("42".into()),
            generation: Some(7),
            uid: Some("uid-1".into()),
            finalizers: Some(vec!["f".into()]),
            ..Default::default()
        };
        let mut target = ObjectMeta {
            name: Some("worker-a".into()),
            labels: Some(BTreeMap::from([("k".into(), "v".into())])),
            ..Default::default()
        };

        splice_identity(&mut target, &current);

        assert_eq!(target.resource_version.as_deref(), Some("42"));
        assert_eq!(target.generation, Some(7));
        assert_eq!(target.uid.as_deref(), Some("uid-1"));
        assert_eq!(target.finalizers, Some(vec!["f".to_string()]));
        assert!(target.labels.is_some());
    }

    #[test]
    fn out_of_band_keys_survive_conversion() {
        let converted = Some(BTreeMap::from([
            ("cluster.x-k8s.io/cluster-name".to_string(), "ci".to_string()),
            ("team".to_string(), "infra".to_string()),
        ]));
        let current = BTreeMap::from([
            ("cluster.x-k8s.io/set-name".to_string(), "workers".to_string()),
            ("cluster.x-k8s.io/cluster-name".to_string(), "stale".to_string()),
            ("removed-upstream".to_string(), "x".to_string()),
        ]);

        let merged = merge_out_of_band(converted, Some(&current), "cluster.x-k8s.io/").unwrap();

        assert_eq!(merged["cluster.x-k8s.io/set-name"], "workers");
        assert_eq!(merged["cluster.x-k8s.io/cluster-name"], "ci");
        assert_eq!(merged["team"], "infra");
        assert!(!merged.contains_key("removed-upstream"));
        assert_eq!(merge_out_of_band(None, None, "x/"), None);
    }
}
