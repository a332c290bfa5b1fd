//! Operator-side records: requests, registries (catalog), configs and bind infos.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::{Meta, ObjectKey};

pub const GROUP: &str = "operator.ibm.com";
pub const VERSION: &str = "v1alpha1";

// ---- OperandRequest ----

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OperandRequest {
    pub metadata: Meta,
    #[serde(default)]
    pub spec: RequestSpec,
    #[serde(default)]
    pub status: RequestStatus,
}
record!(OperandRequest, GROUP, VERSION, "OperandRequest", true);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RequestSpec {
    #[serde(default)]
    pub requests: Vec<RequestEntry>,
}

/// One `(registry, operands[])` entry of a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RequestEntry {
    pub registry: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub registry_namespace: String,
    #[serde(default)]
    pub operands: Vec<OperandRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct OperandRef {
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClusterPhase {
    Creating,
    Running,
    Failed,
    Updating,
    Deleting,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MemberStatus {
    pub name: String,
    /// Install plan completed for the backing subscription.
    #[serde(default)]
    pub installed: bool,
    /// Installed, operator running, and configuration applied.
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RequestStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ClusterPhase>,
    #[serde(default)]
    pub members: Vec<MemberStatus>,
    #[serde(default)]
    pub request_namespaces: Vec<String>,
}

impl OperandRequest {
    pub fn new(namespace: &str, name: &str, requests: Vec<RequestEntry>) -> Self {
        Self { metadata: Meta::named(namespace, name), spec: RequestSpec { requests }, status: RequestStatus::default() }
    }

    /// Fill `registryNamespace` from the request's own namespace. Returns true when anything changed.
    pub fn set_defaults(&mut self) -> bool {
        let ns = self.metadata.namespace.clone();
        let mut changed = false;
        for entry in self.spec.requests.iter_mut() {
            if entry.registry_namespace.is_empty() {
                entry.registry_namespace = ns.clone();
                changed = true;
            }
        }
        changed
    }

    /// Label the request with every registry it references. Returns true when anything changed.
    pub fn add_labels(&mut self) -> bool {
        let mut changed = false;
        for entry in &self.spec.requests {
            let key = registry_label(&entry.registry_namespace, &entry.registry);
            if self.metadata.labels.get(&key).map(String::as_str) != Some("true") {
                self.metadata.labels.insert(key, "true".to_string());
                changed = true;
            }
        }
        changed
    }

    pub fn registry_key(&self, entry: &RequestEntry) -> ObjectKey {
        let ns = if entry.registry_namespace.is_empty() { &self.metadata.namespace } else { &entry.registry_namespace };
        ObjectKey::new(ns.clone(), entry.registry.clone())
    }

    pub fn member(&self, name: &str) -> Option<&MemberStatus> {
        self.status.members.iter().find(|m| m.name == name)
    }
}

/// Label key recording that a request references `namespace/name` registry.
pub fn registry_label(namespace: &str, name: &str) -> String {
    format!("{}.{}/registry", namespace, name)
}

// ---- OperandRegistry ----

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OperandRegistry {
    pub metadata: Meta,
    #[serde(default)]
    pub spec: RegistrySpec,
    #[serde(default)]
    pub status: RegistryStatus,
}
record!(OperandRegistry, GROUP, VERSION, "OperandRegistry", true);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RegistrySpec {
    #[serde(default)]
    pub operators: Vec<Operator>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Approval {
    #[default]
    Automatic,
    Manual,
}

/// A catalog entry: how to install one operand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Operator {
    pub name: String,
    pub namespace: String,
    pub channel: String,
    #[serde(default)]
    pub package_name: String,
    #[serde(default)]
    pub source_name: String,
    #[serde(default)]
    pub source_namespace: String,
    #[serde(default)]
    pub install_plan_approval: Approval,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_namespaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_csv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Operator {
    /// Package to subscribe to; the operand name doubles as the package when unset.
    pub fn package(&self) -> &str {
        if self.package_name.is_empty() { &self.name } else { &self.package_name }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OperatorPhase {
    Running,
    Failed,
    NotFound,
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OperatorStatus {
    pub phase: OperatorPhase,
    #[serde(default)]
    pub reconcile_requests: Vec<ObjectKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatus {
    #[serde(default)]
    pub operators_status: BTreeMap<String, OperatorStatus>,
}

impl OperandRegistry {
    pub fn new(namespace: &str, name: &str, operators: Vec<Operator>) -> Self {
        Self { metadata: Meta::named(namespace, name), spec: RegistrySpec { operators }, status: RegistryStatus::default() }
    }

    pub fn get_operator(&self, name: &str) -> Option<&Operator> {
        self.spec.operators.iter().find(|o| o.name == name)
    }
}

// ---- OperandConfig ----

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OperandConfig {
    pub metadata: Meta,
    #[serde(default)]
    pub spec: ConfigSpec,
}
record!(OperandConfig, GROUP, VERSION, "OperandConfig", true);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConfigSpec {
    #[serde(default)]
    pub services: Vec<ConfigService>,
}

/// Per-operand configuration: custom resource kind (lower camel) -> spec payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConfigService {
    pub name: String,
    #[serde(default)]
    pub spec: BTreeMap<String, Json>,
}

impl OperandConfig {
    pub fn new(namespace: &str, name: &str, services: Vec<ConfigService>) -> Self {
        Self { metadata: Meta::named(namespace, name), spec: ConfigSpec { services } }
    }

    pub fn get_service(&self, name: &str) -> Option<&ConfigService> {
        self.spec.services.iter().find(|s| s.name == name)
    }
}

// ---- OperandBindInfo ----

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OperandBindInfo {
    pub metadata: Meta,
    #[serde(default)]
    pub spec: BindInfoSpec,
    #[serde(default)]
    pub status: BindInfoStatus,
}
record!(OperandBindInfo, GROUP, VERSION, "OperandBindInfo", true);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BindInfoSpec {
    pub operand: String,
    pub registry: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub registry_namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub bindings: BTreeMap<String, Binding>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Binding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configmap: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BindInfoPhase {
    Initialized,
    Completed,
    Failed,
    Waiting,
    Updating,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BindInfoStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<BindInfoPhase>,
    #[serde(default)]
    pub request_namespaces: Vec<String>,
}

impl OperandBindInfo {
    pub fn registry_key(&self) -> ObjectKey {
        let ns = if self.spec.registry_namespace.is_empty() { &self.metadata.namespace } else { &self.spec.registry_namespace };
        ObjectKey::new(ns.clone(), self.spec.registry.clone())
    }
}
