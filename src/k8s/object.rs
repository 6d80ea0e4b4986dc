//! Loosely-typed cluster objects
//!
//! Objects are kept as the raw JSON tree the API server returned. The only
//! parts this crate looks at are the ones that make up an [`Identity`] plus
//! `metadata.resourceVersion`, which the watch handlers use to resume streams.

use crate::error::{Error, Result};
use k8s_openapi::serde_json::{Map, Value, json};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Unique name of one tracked object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    pub namespace: String,
    /// API group, empty for the core group
    pub group: String,
    pub version: String,
    pub kind: String,
    pub name: String,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{} {}/{}", self.version, self.kind, self.namespace, self.name)
        } else {
            write!(
                f,
                "{}/{}/{} {}/{}",
                self.group, self.version, self.kind, self.namespace, self.name
            )
        }
    }
}

/// Partial key used to query the cache
///
/// `namespace` is always compared; every other field narrows the match only
/// when it is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheKey {
    pub namespace: String,
    pub group: Option<String>,
    pub version: Option<String>,
    pub kind: Option<String>,
    pub name: Option<String>,
}

impl CacheKey {
    /// Key matching everything in `namespace`
    #[must_use]
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// Key matching every object of one resource type in `namespace`
    #[must_use]
    pub fn for_type(namespace: &str, group: &str, version: &str, kind: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            group: Some(group.to_string()),
            version: Some(version.to_string()),
            kind: Some(kind.to_string()),
            name: None,
        }
    }

    #[must_use]
    pub fn matches(&self, id: &Identity) -> bool {
        fn narrows(field: Option<&String>, value: &str) -> bool {
            field.is_none_or(|f| f == value)
        }

        self.namespace == id.namespace
            && narrows(self.group.as_ref(), &id.group)
            && narrows(self.version.as_ref(), &id.version)
            && narrows(self.kind.as_ref(), &id.kind)
            && narrows(self.name.as_ref(), &id.name)
    }
}

/// A cluster object with an arbitrary attribute tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Object(Value);

impl Object {
    /// Build a bare object with only type and object metadata filled in
    #[must_use]
    pub fn new(api_version: &str, kind: &str, namespace: &str, name: &str) -> Self {
        Self(json!({
            "apiVersion": api_version,
            "kind": kind,
            "metadata": {
                "namespace": namespace,
                "name": name,
            },
        }))
    }

    /// Wrap a JSON tree
    ///
    /// # Errors
    ///
    /// Returns an error if `value` is not a JSON object
    pub fn from_value(value: Value) -> Result<Self> {
        if value.is_object() {
            Ok(Self(value))
        } else {
            Err(Error::Custom(format!(
                "cluster object must be a JSON map, got {value}"
            )))
        }
    }

    #[must_use]
    pub const fn as_value(&self) -> &Value {
        &self.0
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        self.0
    }

    #[must_use]
    pub fn api_version(&self) -> Option<&str> {
        self.0.get("apiVersion").and_then(Value::as_str)
    }

    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        self.0.get("kind").and_then(Value::as_str)
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.metadata_str("name")
    }

    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.metadata_str("namespace")
    }

    #[must_use]
    pub fn resource_version(&self) -> Option<&str> {
        self.metadata_str("resourceVersion")
    }

    pub fn set_resource_version(&mut self, version: &str) {
        if let Some(metadata) = self.metadata_mut() {
            metadata.insert("resourceVersion".to_string(), Value::from(version));
        }
    }

    /// Fill in `apiVersion` and `kind` when the server left them out
    ///
    /// Items in a list response usually carry no type metadata of their own.
    pub fn ensure_type_meta(&mut self, api_version: &str, kind: &str) {
        if let Some(map) = self.0.as_object_mut() {
            map.entry("apiVersion")
                .or_insert_with(|| Value::from(api_version));
            map.entry("kind").or_insert_with(|| Value::from(kind));
        }
    }

    #[must_use]
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.string_map("labels")
    }

    #[must_use]
    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.string_map("annotations")
    }

    pub fn set_annotations(&mut self, annotations: BTreeMap<String, String>) {
        let map: Map<String, Value> = annotations
            .into_iter()
            .map(|(k, v)| (k, Value::from(v)))
            .collect();
        if let Some(metadata) = self.metadata_mut() {
            metadata.insert("annotations".to_string(), Value::Object(map));
        }
    }

    /// Split `apiVersion` into group and version, the core group being empty
    #[must_use]
    pub fn group_version(&self) -> Option<(&str, &str)> {
        let api_version = self.api_version()?;
        Some(
            api_version
                .split_once('/')
                .unwrap_or(("", api_version)),
        )
    }

    /// The identity this object is cached under
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingIdentity`] when `apiVersion`, `kind` or
    /// `metadata.name` is absent. A missing namespace is taken as empty.
    pub fn identity(&self) -> Result<Identity> {
        let (group, version) = self
            .group_version()
            .ok_or(Error::MissingIdentity("apiVersion"))?;
        let kind = self.kind().ok_or(Error::MissingIdentity("kind"))?;
        let name = self
            .name()
            .filter(|n| !n.is_empty())
            .ok_or(Error::MissingIdentity("metadata.name"))?;

        Ok(Identity {
            namespace: self.namespace().unwrap_or_default().to_string(),
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
        })
    }

    fn metadata_str(&self, field: &str) -> Option<&str> {
        self.0.get("metadata")?.get(field)?.as_str()
    }

    fn string_map(&self, field: &str) -> BTreeMap<String, String> {
        self.0
            .get("metadata")
            .and_then(|m| m.get(field))
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn metadata_mut(&mut self) -> Option<&mut Map<String, Value>> {
        let metadata = self
            .0
            .as_object_mut()?
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if !metadata.is_object() {
            *metadata = Value::Object(Map::new());
        }
        metadata.as_object_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_from_grouped_object() {
        let obj = Object::new("apps/v1", "Deployment", "default", "web");
        let id = obj.identity().unwrap();
        assert_eq!(id.group, "apps");
        assert_eq!(id.version, "v1");
        assert_eq!(id.kind, "Deployment");
        assert_eq!(id.namespace, "default");
        assert_eq!(id.name, "web");
    }

    #[test]
    fn test_identity_core_group_is_empty() {
        let obj = Object::new("v1", "Service", "default", "api");
        let id = obj.identity().unwrap();
        assert_eq!(id.group, "");
        assert_eq!(id.version, "v1");
    }

    #[test]
    fn test_identity_requires_name() {
        let obj = Object::from_value(json!({"apiVersion": "v1", "kind": "Pod"})).unwrap();
        assert!(matches!(
            obj.identity(),
            Err(Error::MissingIdentity("metadata.name"))
        ));
    }

    #[test]
    fn test_from_value_rejects_scalars() {
        assert!(Object::from_value(json!("nope")).is_err());
    }

    #[test]
    fn test_annotations_round_trip() {
        let mut obj = Object::new("apps/v1", "Deployment", "default", "web");
        assert!(obj.annotations().is_empty());

        let annotations = BTreeMap::from([("update".to_string(), "update".to_string())]);
        obj.set_annotations(annotations.clone());
        assert_eq!(obj.annotations(), annotations);
    }

    #[test]
    fn test_labels_and_raw_tree() {
        let obj = Object::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "web-0",
                "namespace": "default",
                "labels": {"app": "web", "replicas": 3},
            },
            "spec": {"nodeName": "n1"},
        }))
        .unwrap();

        // non-string label values are skipped
        assert_eq!(
            obj.labels(),
            BTreeMap::from([("app".to_string(), "web".to_string())])
        );
        assert_eq!(obj.as_value()["spec"]["nodeName"], "n1");

        let tree = obj.into_value();
        assert_eq!(tree["metadata"]["name"], "web-0");
    }

    #[test]
    fn test_ensure_type_meta_keeps_existing() {
        let mut bare = Object::from_value(json!({"metadata": {"name": "a"}})).unwrap();
        bare.ensure_type_meta("apps/v1", "Deployment");
        assert_eq!(bare.api_version(), Some("apps/v1"));

        let mut typed = Object::new("v1", "Pod", "ns", "p");
        typed.ensure_type_meta("apps/v1", "Deployment");
        assert_eq!(typed.kind(), Some("Pod"));
    }

    #[test]
    fn test_cache_key_narrowing() {
        let id = Object::new("apps/v1", "Deployment", "default", "web")
            .identity()
            .unwrap();

        assert!(CacheKey::namespace("default").matches(&id));
        assert!(!CacheKey::namespace("other").matches(&id));
        assert!(CacheKey::for_type("default", "apps", "v1", "Deployment").matches(&id));
        assert!(!CacheKey::for_type("default", "", "v1", "Deployment").matches(&id));

        let by_name = CacheKey {
            name: Some("db".to_string()),
            ..CacheKey::namespace("default")
        };
        assert!(!by_name.matches(&id));
    }
}
