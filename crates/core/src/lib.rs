//! Opreq core types: record metadata, resource kinds, and the operand request data model.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Label marking installation-subsystem records (and operand resources) created by this controller.
pub const MANAGED_LABEL: &str = "operator.ibm.com/opreq-control";
/// Finalizer that gates deletion of an OperandRequest until teardown completes.
pub const REQUEST_FINALIZER: &str = "finalizer.request.ibm.com";
/// Name of the OperatorGroup created in target namespaces that have none.
pub const OPERATOR_GROUP_NAME: &str = "operand-deployment-lifecycle-manager-operatorgroup";
/// CSV annotation carrying the JSON array of example custom resources.
pub const ALM_EXAMPLES_ANNOTATION: &str = "alm-examples";

/// A served resource kind, addressed the same way kube addresses a GVK.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl ResourceKind {
    pub fn new(group: &str, version: &str, kind: &str, namespaced: bool) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string(), namespaced }
    }

    /// Parse `apiVersion` + `kind` as they appear in a manifest. Scope defaults to namespaced.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", api_version),
        };
        Self::new(group, version, kind, true)
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.gvk_key()) }
}

/// Namespaced name of a record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() { f.write_str(&self.name) } else { write!(f, "{}/{}", self.namespace, self.name) }
    }
}

/// The subset of object metadata the controller reads and writes.
/// Fields it does not model are carried through untouched in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Meta {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Meta {
    pub fn named(namespace: &str, name: &str) -> Self {
        Self { name: name.to_string(), namespace: namespace.to_string(), ..Default::default() }
    }

    pub fn key(&self) -> ObjectKey { ObjectKey::new(self.namespace.clone(), self.name.clone()) }

    pub fn has_finalizer(&self, finalizer: &str) -> bool { self.finalizers.iter().any(|f| f == finalizer) }

    /// Explicit ownership marker derived from the managed label.
    pub fn ownership(&self) -> Ownership {
        if self.labels.contains_key(MANAGED_LABEL) { Ownership::OwnedBySystem } else { Ownership::Unowned }
    }

    /// Finalizer-gated lifecycle: Active until deletion is requested, Terminating while
    /// `finalizer` still blocks removal, Removed once nothing holds the record.
    pub fn lifecycle(&self, finalizer: &str) -> Lifecycle {
        match (&self.deletion_timestamp, self.has_finalizer(finalizer)) {
            (None, _) => Lifecycle::Active,
            (Some(_), true) => Lifecycle::Terminating,
            (Some(_), false) => Lifecycle::Removed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Unowned,
    OwnedBySystem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    Terminating,
    Removed,
}

/// A typed record that can round-trip through the JSON store.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn kind() -> ResourceKind;
    fn meta(&self) -> &Meta;
    fn meta_mut(&mut self) -> &mut Meta;

    fn key(&self) -> ObjectKey { self.meta().key() }
}

macro_rules! record {
    ($ty:ty, $group:expr, $version:expr, $kind:expr, $namespaced:expr) => {
        impl $crate::Record for $ty {
            fn kind() -> $crate::ResourceKind { $crate::ResourceKind::new($group, $version, $kind, $namespaced) }
            fn meta(&self) -> &$crate::Meta { &self.metadata }
            fn meta_mut(&mut self) -> &mut $crate::Meta { &mut self.metadata }
        }
    };
}

pub mod model;
pub mod olm;

pub use model::*;
pub use olm::*;

/// Deduplicate preserving first-seen order.
pub fn unique<T: Clone + Eq + std::hash::Hash>(items: &[T]) -> Vec<T> {
    let mut seen = HashSet::with_capacity(items.len());
    items.iter().filter(|i| seen.insert((*i).clone())).cloned().collect()
}
