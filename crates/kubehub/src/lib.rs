//! Opreq kubehub: kube-rs backed `ClusterStore` and the OperandRequest watcher.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use opreq_core::{ObjectKey, OperandRequest, Record, ResourceKind, GROUP, OLM_GROUP};
use opreq_store::{ClusterStore, StoreError, StoreResult};
use serde_json::Value as Json;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from the current context")
}

/// `ClusterStore` over the Kubernetes API. Resources of this controller's own and OLM
/// groups are addressed directly; anything else (operand custom resources) is
/// resolved through discovery once and cached.
pub struct KubeStore {
    client: Client,
    discovered: RwLock<HashMap<String, (ApiResource, bool)>>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client, discovered: RwLock::new(HashMap::new()) } }

    pub async fn try_default() -> Result<Self> { Ok(Self::new(get_kube_client().await?)) }

    pub fn client(&self) -> Client { self.client.clone() }

    /// `major.minor (gitVersion)` of the API server, for the startup log.
    pub async fn server_version(&self) -> Result<String> {
        let info: k8s_openapi::apimachinery::pkg::version::Info =
            self.client.apiserver_version().await.context("querying API server version")?;
        Ok(format!("{}.{} ({})", info.major, info.minor, info.git_version))
    }

    async fn resource(&self, kind: &ResourceKind) -> StoreResult<(ApiResource, bool)> {
        let gvk = GroupVersionKind { group: kind.group.clone(), version: kind.version.clone(), kind: kind.kind.clone() };
        if kind.group == GROUP || kind.group == OLM_GROUP || kind.group.is_empty() {
            return Ok((ApiResource::from_gvk(&gvk), kind.namespaced));
        }
        let key = kind.gvk_key();
        if let Some(found) = self.discovered.read().await.get(&key) {
            return Ok(found.clone());
        }
        let found = find_api_resource(self.client.clone(), &gvk)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        self.discovered.write().await.insert(key, found.clone());
        Ok(found)
    }

    async fn api(&self, kind: &ResourceKind, namespace: Option<&str>) -> StoreResult<Api<DynamicObject>> {
        let (ar, namespaced) = self.resource(kind).await?;
        Ok(match (namespaced, namespace) {
            (true, Some(ns)) if !ns.is_empty() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        })
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow::anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn to_dynamic(kind: &ResourceKind, obj: Json) -> StoreResult<DynamicObject> {
    serde_json::from_value(obj).map_err(|source| StoreError::Serde { kind: kind.kind.clone(), source })
}

fn from_dynamic(kind: &ResourceKind, obj: &DynamicObject) -> StoreResult<Json> {
    let mut v = serde_json::to_value(obj).map_err(|source| StoreError::Serde { kind: kind.kind.clone(), source })?;
    strip_managed_fields(&mut v);
    Ok(v)
}

fn name_of(obj: &Json) -> (String, String) {
    let meta = obj.get("metadata");
    let field = |f: &str| meta.and_then(|m| m.get(f)).and_then(|v| v.as_str()).unwrap_or_default().to_string();
    (field("namespace"), field("name"))
}

fn map_err(kind: &ResourceKind, namespace: &str, name: &str, e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::not_found(kind, namespace, name),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => StoreError::already_exists(kind, namespace, name),
        kube::Error::Api(ae) if ae.code == 409 => {
            counter!("kube_write_conflicts_total", 1u64);
            StoreError::conflict(kind, namespace, name, ae.message)
        }
        other => StoreError::Backend(other.to_string()),
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get(&self, kind: &ResourceKind, namespace: &str, name: &str) -> StoreResult<Option<Json>> {
        let api = self.api(kind, Some(namespace)).await?;
        match api.get_opt(name).await.map_err(|e| map_err(kind, namespace, name, e))? {
            Some(obj) => Ok(Some(from_dynamic(kind, &obj)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>, label: Option<&str>) -> StoreResult<Vec<Json>> {
        let api = self.api(kind, namespace).await?;
        let mut lp = ListParams::default();
        if let Some(sel) = label { lp = lp.labels(sel); }
        let list = api.list(&lp).await.map_err(|e| map_err(kind, namespace.unwrap_or(""), "", e))?;
        debug!(kind = %kind.kind, ns = ?namespace, label = ?label, count = list.items.len(), "kube: listed");
        list.items.iter().map(|o| from_dynamic(kind, o)).collect()
    }

    async fn create(&self, kind: &ResourceKind, obj: Json) -> StoreResult<Json> {
        let (ns, name) = name_of(&obj);
        let api = self.api(kind, Some(&ns)).await?;
        let created = api
            .create(&PostParams::default(), &to_dynamic(kind, obj)?)
            .await
            .map_err(|e| map_err(kind, &ns, &name, e))?;
        from_dynamic(kind, &created)
    }

    async fn update(&self, kind: &ResourceKind, obj: Json) -> StoreResult<Json> {
        let (ns, name) = name_of(&obj);
        let api = self.api(kind, Some(&ns)).await?;
        let replaced = api
            .replace(&name, &PostParams::default(), &to_dynamic(kind, obj)?)
            .await
            .map_err(|e| map_err(kind, &ns, &name, e))?;
        from_dynamic(kind, &replaced)
    }

    async fn update_status(&self, kind: &ResourceKind, obj: Json) -> StoreResult<Json> {
        let (ns, name) = name_of(&obj);
        let api = self.api(kind, Some(&ns)).await?;
        let body = serde_json::to_vec(&obj).map_err(|source| StoreError::Serde { kind: kind.kind.clone(), source })?;
        let replaced = api
            .replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(|e| map_err(kind, &ns, &name, e))?;
        from_dynamic(kind, &replaced)
    }

    async fn delete(&self, kind: &ResourceKind, namespace: &str, name: &str) -> StoreResult<()> {
        let api = self.api(kind, Some(namespace)).await?;
        api.delete(name, &DeleteParams::default()).await.map_err(|e| map_err(kind, namespace, name, e))?;
        Ok(())
    }
}

fn key_of(obj: &DynamicObject) -> Option<ObjectKey> {
    let name = obj.metadata.name.clone()?;
    Some(ObjectKey::new(obj.metadata.namespace.clone().unwrap_or_default(), name))
}

/// List+watch OperandRequests and forward the key of every observed change.
/// Returns when the stream ends or the receiver is gone.
pub async fn watch_requests(client: Client, namespace: Option<&str>, key_tx: mpsc::Sender<ObjectKey>) -> Result<()> {
    let kind = OperandRequest::kind();
    let gvk = GroupVersionKind { group: kind.group.clone(), version: kind.version.clone(), kind: kind.kind.clone() };
    let ar = ApiResource::from_gvk(&gvk);
    let api: Api<DynamicObject> = match namespace {
        Some(ns) => Api::namespaced_with(client, ns, &ar),
        None => Api::all_with(client, &ar),
    };

    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(gvk = %kind.gvk_key(), ns = ?namespace, "request watcher started");
    while let Some(ev) = stream.try_next().await? {
        let keys: Vec<ObjectKey> = match ev {
            Event::Applied(o) | Event::Deleted(o) => key_of(&o).into_iter().collect(),
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                list.iter().filter_map(key_of).collect()
            }
        };
        for k in keys {
            counter!("watch_events_total", 1u64);
            if key_tx.send(k).await.is_err() {
                warn!("work queue closed; stopping request watcher");
                return Ok(());
            }
        }
    }
    warn!("request watcher stream ended");
    Ok(())
}
