#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use opreq_controller::{Context, ControllerConfig};
use opreq_core::{
    ClusterServiceVersion, ConfigService, InstallPlan, InstallPlanPhase, Meta, ObjectKey, OperandConfig, OperandRef,
    OperandRegistry, OperandRequest, Operator, Ownership, PlanRef, Record, RequestEntry, Subscription,
    ALM_EXAMPLES_ANNOTATION,
};
use opreq_store::{MemStore, Records};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const CATALOG_NS: &str = "cs";
pub const CATALOG: &str = "common";

pub struct Cluster {
    pub mem: Arc<MemStore>,
    pub records: Records,
    pub ctx: Arc<Context>,
}

impl Cluster {
    pub fn new() -> Self {
        let mem = Arc::new(MemStore::new());
        let records = Records::new(mem.clone());
        let ctx = Arc::new(Context::new(records.clone(), ControllerConfig::default()));
        Self { mem, records, ctx }
    }

    /// Registry `cs/common` listing `operators`, plus a config that sizes etcd clusters.
    pub async fn seed_catalog(&self, operators: Vec<Operator>) {
        self.records.create(&OperandRegistry::new(CATALOG_NS, CATALOG, operators)).await.unwrap();
        let etcd = ConfigService {
            name: "etcd".into(),
            spec: BTreeMap::from([("etcdCluster".to_string(), json!({ "size": 5 }))]),
        };
        self.records.create(&OperandConfig::new(CATALOG_NS, CATALOG, vec![etcd])).await.unwrap();
    }

    pub async fn request(&self, namespace: &str, name: &str, operands: &[&str]) -> ObjectKey {
        let req = OperandRequest::new(namespace, name, vec![RequestEntry {
            registry: CATALOG.into(),
            registry_namespace: CATALOG_NS.into(),
            operands: operands.iter().map(|o| OperandRef { name: (*o).into() }).collect(),
            description: None,
        }]);
        self.records.create(&req).await.unwrap().key()
    }

    pub async fn get_request(&self, key: &ObjectKey) -> Option<OperandRequest> {
        self.records.get::<OperandRequest>(&key.namespace, &key.name).await.unwrap()
    }

    pub async fn registry(&self) -> OperandRegistry {
        self.records.fetch::<OperandRegistry>(&ObjectKey::new(CATALOG_NS, CATALOG)).await.unwrap()
    }

    pub async fn subscription(&self, ns: &str, name: &str) -> Option<Subscription> {
        self.records.get::<Subscription>(ns, name).await.unwrap()
    }

    pub fn subscription_deletes(&self, ns: &str, name: &str) -> u64 {
        self.mem.delete_count(&Subscription::kind(), ns, name)
    }
}

pub fn operator(name: &str, namespace: &str) -> Operator {
    Operator {
        name: name.into(),
        namespace: namespace.into(),
        channel: "stable".into(),
        source_name: "community".into(),
        source_namespace: "olm".into(),
        ..Default::default()
    }
}

pub fn etcd_alm_examples() -> String {
    json!([{
        "apiVersion": "etcd.database.coreos.com/v1beta2",
        "kind": "EtcdCluster",
        "metadata": { "name": "example" },
        "spec": { "size": 3, "version": "3.2.13" }
    }])
    .to_string()
}

pub fn csv_name(subscription: &str) -> String { format!("{}.v1.0.0", subscription) }

/// A succeeded CSV, the way the installation subsystem leaves it.
pub fn succeeded_csv(namespace: &str, name: &str) -> ClusterServiceVersion {
    let mut csv = ClusterServiceVersion { metadata: Meta::named(namespace, name), ..Default::default() };
    csv.metadata.annotations.insert(ALM_EXAMPLES_ANNOTATION.into(), etcd_alm_examples());
    csv.status.phase = "Succeeded".into();
    csv
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Complete,
    Fail(&'static str),
}

/// Stand-in for the installation subsystem: `delay` after it first sees a managed
/// subscription it publishes an install plan (and, on success, a succeeded CSV).
pub fn spawn_olm(records: Records, delay: Duration, outcome: Outcome) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut seen: HashMap<ObjectKey, Instant> = HashMap::new();
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let Ok(subs) = records.list::<Subscription>(None, None).await else { continue };
            for mut sub in subs {
                if sub.status.install_plan_ref.is_some() || sub.metadata.ownership() == Ownership::Unowned {
                    continue;
                }
                let first = *seen.entry(sub.key()).or_insert_with(Instant::now);
                if first.elapsed() < delay {
                    continue;
                }
                let ns = sub.metadata.namespace.clone();
                let plan_name = format!("install-{}", sub.metadata.name);
                let mut plan = InstallPlan { metadata: Meta::named(&ns, &plan_name), ..Default::default() };
                match &outcome {
                    Outcome::Complete => {
                        plan.status.phase = InstallPlanPhase::Complete;
                        let csv = csv_name(&sub.metadata.name);
                        let _ = records.create_if_absent(&succeeded_csv(&ns, &csv)).await;
                        sub.status.installed_csv = Some(csv);
                    }
                    Outcome::Fail(reason) => {
                        plan.status.phase = InstallPlanPhase::Failed;
                        plan.status.message = Some((*reason).to_string());
                    }
                }
                let _ = records.create_if_absent(&plan).await;
                sub.status.install_plan_ref = Some(PlanRef { name: plan_name, namespace: ns });
                let _ = records.update_status(&sub).await;
            }
        }
    })
}
