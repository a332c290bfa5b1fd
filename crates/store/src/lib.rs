//! Opreq store: the versioned cluster-store seam every controller component talks through.
//!
//! `ClusterStore` is object-safe and JSON-typed so kube-backed and in-memory
//! implementations can sit behind one `Arc<dyn ClusterStore>`. `Records` layers
//! typed access on top for anything implementing `opreq_core::Record`.

#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use opreq_core::{ObjectKey, Record, ResourceKind};
use serde_json::Value as Json;
use tracing::debug;

mod mem;

pub use mem::MemStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound { kind: String, namespace: String, name: String },
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists { kind: String, namespace: String, name: String },
    #[error("conflict writing {kind} {namespace}/{name}: {message}")]
    Conflict { kind: String, namespace: String, name: String, message: String },
    #[error("decoding {kind}: {source}")]
    Serde { kind: String, #[source] source: serde_json::Error },
    #[error("backend: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(kind: &ResourceKind, namespace: &str, name: &str) -> Self {
        Self::NotFound { kind: kind.kind.clone(), namespace: namespace.to_string(), name: name.to_string() }
    }

    pub fn already_exists(kind: &ResourceKind, namespace: &str, name: &str) -> Self {
        Self::AlreadyExists { kind: kind.kind.clone(), namespace: namespace.to_string(), name: name.to_string() }
    }

    pub fn conflict(kind: &ResourceKind, namespace: &str, name: &str, message: impl Into<String>) -> Self {
        Self::Conflict { kind: kind.kind.clone(), namespace: namespace.to_string(), name: name.to_string(), message: message.into() }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound { .. }) }
    pub fn is_conflict(&self) -> bool { matches!(self, Self::Conflict { .. }) }
    pub fn is_already_exists(&self) -> bool { matches!(self, Self::AlreadyExists { .. }) }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Generic get/list/create/update/delete over JSON records with resourceVersion
/// optimistic concurrency. `update`/`update_status` fail with `Conflict` on a stale version.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get(&self, kind: &ResourceKind, namespace: &str, name: &str) -> StoreResult<Option<Json>>;

    /// `namespace = None` lists across all namespaces. `label` is either a bare key
    /// (existence) or `key=value`.
    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>, label: Option<&str>) -> StoreResult<Vec<Json>>;

    async fn create(&self, kind: &ResourceKind, obj: Json) -> StoreResult<Json>;

    /// Replace spec/metadata. The status subresource is left as stored.
    async fn update(&self, kind: &ResourceKind, obj: Json) -> StoreResult<Json>;

    /// Replace only the status subresource.
    async fn update_status(&self, kind: &ResourceKind, obj: Json) -> StoreResult<Json>;

    /// Records holding finalizers are only marked for deletion.
    async fn delete(&self, kind: &ResourceKind, namespace: &str, name: &str) -> StoreResult<()>;
}

/// Typed access to a `ClusterStore`.
#[derive(Clone)]
pub struct Records {
    inner: Arc<dyn ClusterStore>,
}

impl Records {
    pub fn new(inner: Arc<dyn ClusterStore>) -> Self { Self { inner } }

    pub fn raw(&self) -> &dyn ClusterStore { self.inner.as_ref() }

    pub async fn get<T: Record>(&self, namespace: &str, name: &str) -> StoreResult<Option<T>> {
        match self.inner.get(&T::kind(), namespace, name).await? {
            Some(v) => Ok(Some(decode(v)?)),
            None => Ok(None),
        }
    }

    /// Like `get`, but a missing record is a `NotFound` error.
    pub async fn fetch<T: Record>(&self, key: &ObjectKey) -> StoreResult<T> {
        self.get::<T>(&key.namespace, &key.name)
            .await?
            .ok_or_else(|| StoreError::not_found(&T::kind(), &key.namespace, &key.name))
    }

    pub async fn list<T: Record>(&self, namespace: Option<&str>, label: Option<&str>) -> StoreResult<Vec<T>> {
        let raw = self.inner.list(&T::kind(), namespace, label).await?;
        raw.into_iter().map(decode).collect()
    }

    pub async fn create<T: Record>(&self, obj: &T) -> StoreResult<T> {
        let kind = T::kind();
        decode(self.inner.create(&kind, encode(obj)?).await?)
    }

    /// Idempotent create: "already exists" is success. Returns whether this call created it.
    pub async fn create_if_absent<T: Record>(&self, obj: &T) -> StoreResult<bool> {
        match self.create(obj).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_already_exists() => {
                debug!(kind = %T::kind().kind, key = %obj.key(), "create skipped; already exists");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn update<T: Record>(&self, obj: &T) -> StoreResult<T> {
        let kind = T::kind();
        decode(self.inner.update(&kind, encode(obj)?).await?)
    }

    pub async fn update_status<T: Record>(&self, obj: &T) -> StoreResult<T> {
        let kind = T::kind();
        decode(self.inner.update_status(&kind, encode(obj)?).await?)
    }

    pub async fn delete<T: Record>(&self, namespace: &str, name: &str) -> StoreResult<()> {
        self.inner.delete(&T::kind(), namespace, name).await
    }

    /// Delete, treating "not found" as already removed. Returns whether a record was deleted.
    pub async fn delete_if_exists<T: Record>(&self, namespace: &str, name: &str) -> StoreResult<bool> {
        match self.delete::<T>(namespace, name).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn decode<T: Record>(v: Json) -> StoreResult<T> {
    serde_json::from_value(v).map_err(|source| StoreError::Serde { kind: T::kind().kind, source })
}

/// Serialize a record with its type meta stamped on.
pub fn encode<T: Record>(obj: &T) -> StoreResult<Json> {
    let kind = T::kind();
    let mut v = serde_json::to_value(obj).map_err(|source| StoreError::Serde { kind: kind.kind.clone(), source })?;
    if let Some(map) = v.as_object_mut() {
        map.insert("apiVersion".into(), Json::String(kind.api_version()));
        map.insert("kind".into(), Json::String(kind.kind.clone()));
    }
    Ok(v)
}

/// Match a label selector of the form `key` or `key=value` against a JSON record.
pub fn label_matches(obj: &Json, selector: &str) -> bool {
    let labels = obj.get("metadata").and_then(|m| m.get("labels")).and_then(|l| l.as_object());
    let Some(labels) = labels else { return false };
    match selector.split_once('=') {
        Some((k, v)) => labels.get(k.trim()).and_then(|x| x.as_str()) == Some(v.trim()),
        None => labels.contains_key(selector.trim()),
    }
}
