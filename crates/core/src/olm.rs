//! Installation-subsystem records (OLM shapes). Observed and created, never owned outright.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::{Approval, Meta, Operator, ALM_EXAMPLES_ANNOTATION, MANAGED_LABEL};

pub const OLM_GROUP: &str = "operators.coreos.com";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Subscription {
    pub metadata: Meta,
    #[serde(default)]
    pub spec: SubscriptionSpec,
    #[serde(default)]
    pub status: SubscriptionStatus,
}
record!(Subscription, OLM_GROUP, "v1alpha1", "Subscription", true);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSpec {
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub source_namespace: String,
    #[serde(default)]
    pub install_plan_approval: Approval,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "startingCSV")]
    pub starting_csv: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PlanRef {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_plan_ref: Option<PlanRef>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "installedCSV")]
    pub installed_csv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl Subscription {
    /// A managed subscription for `op`, labelled so teardown can find it again.
    pub fn for_operator(op: &Operator) -> Self {
        let mut metadata = Meta::named(&op.namespace, &op.name);
        metadata.labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        Self { metadata, spec: SubscriptionSpec::for_operator(op), status: SubscriptionStatus::default() }
    }
}

impl SubscriptionSpec {
    pub fn for_operator(op: &Operator) -> Self {
        Self {
            channel: op.channel.clone(),
            name: op.package().to_string(),
            source: op.source_name.clone(),
            source_namespace: op.source_namespace.clone(),
            install_plan_approval: op.install_plan_approval,
            starting_csv: op.starting_csv.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InstallPlan {
    pub metadata: Meta,
    #[serde(default)]
    pub status: InstallPlanStatus,
}
record!(InstallPlan, OLM_GROUP, "v1alpha1", "InstallPlan", true);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum InstallPlanPhase {
    #[default]
    #[serde(rename = "")]
    None,
    Planning,
    RequiresApproval,
    Installing,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct InstallPlanStatus {
    #[serde(default)]
    pub phase: InstallPlanPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ClusterServiceVersion {
    pub metadata: Meta,
    #[serde(default)]
    pub status: CsvStatus,
}
record!(ClusterServiceVersion, OLM_GROUP, "v1alpha1", "ClusterServiceVersion", true);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CsvStatus {
    #[serde(default)]
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ClusterServiceVersion {
    pub fn succeeded(&self) -> bool { self.status.phase == "Succeeded" }

    /// Example custom resources published by the CSV. A malformed annotation yields none.
    pub fn alm_examples(&self) -> Vec<Json> {
        self.metadata
            .annotations
            .get(ALM_EXAMPLES_ANNOTATION)
            .and_then(|s| serde_json::from_str::<Vec<Json>>(s).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OperatorGroup {
    pub metadata: Meta,
    #[serde(default)]
    pub spec: OperatorGroupSpec,
}
record!(OperatorGroup, OLM_GROUP, "v1", "OperatorGroup", true);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct OperatorGroupSpec {
    #[serde(default)]
    pub target_namespaces: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Namespace {
    pub metadata: Meta,
}
record!(Namespace, "", "v1", "Namespace", false);

impl Namespace {
    pub fn named(name: &str) -> Self { Self { metadata: Meta::named("", name) } }
}
