//! In-memory `ClusterStore` with apiserver-like write semantics.
//!
//! Used as the fake cluster in tests and by the offline CLI. Besides resourceVersion
//! compare-and-swap and finalizer-gated deletion it supports fault injection
//! (forced status conflicts, failing deletes) and write accounting.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use metrics::counter;
use opreq_core::ResourceKind;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value as Json;
use tracing::debug;

use crate::{label_matches, ClusterStore, StoreError, StoreResult};

type Key = (String, String, String);

#[derive(Default)]
struct State {
    objects: FxHashMap<Key, Json>,
    next_rv: u64,
    status_conflicts: FxHashMap<String, u32>,
    failing_deletes: FxHashSet<Key>,
    deletes: FxHashMap<Key, u64>,
    status_writes: FxHashMap<String, u64>,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }
}

#[derive(Default)]
pub struct MemStore {
    state: Mutex<State>,
}

fn key(kind: &ResourceKind, namespace: &str, name: &str) -> Key {
    let ns = if kind.namespaced { namespace.to_string() } else { String::new() };
    (kind.gvk_key(), ns, name.to_string())
}

fn meta_str<'a>(obj: &'a Json, field: &str) -> Option<&'a str> {
    obj.get("metadata").and_then(|m| m.get(field)).and_then(|v| v.as_str())
}

fn set_meta(obj: &mut Json, field: &str, value: Json) {
    if let Some(map) = obj.as_object_mut() {
        let meta = map.entry("metadata").or_insert_with(|| Json::Object(Default::default()));
        if let Some(m) = meta.as_object_mut() {
            m.insert(field.to_string(), value);
        }
    }
}

fn has_finalizers(obj: &Json) -> bool {
    obj.get("metadata")
        .and_then(|m| m.get("finalizers"))
        .and_then(|f| f.as_array())
        .map(|a| !a.is_empty())
        .unwrap_or(false)
}

fn now_rfc3339() -> String { chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true) }

impl MemStore {
    pub fn new() -> Self { Self::default() }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `n` status writes of `kind` fail with `Conflict`.
    pub fn inject_status_conflicts(&self, kind: &ResourceKind, n: u32) {
        self.state().status_conflicts.insert(kind.gvk_key(), n);
    }

    /// Make every delete of this record fail with a backend error until cleared.
    pub fn fail_deletes(&self, kind: &ResourceKind, namespace: &str, name: &str, on: bool) {
        let k = key(kind, namespace, name);
        let mut st = self.state();
        if on { st.failing_deletes.insert(k); } else { st.failing_deletes.remove(&k); }
    }

    /// Number of successful delete calls issued against this record.
    pub fn delete_count(&self, kind: &ResourceKind, namespace: &str, name: &str) -> u64 {
        self.state().deletes.get(&key(kind, namespace, name)).copied().unwrap_or(0)
    }

    /// Number of successful status writes for `kind`.
    pub fn status_writes(&self, kind: &ResourceKind) -> u64 {
        self.state().status_writes.get(&kind.gvk_key()).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize { self.state().objects.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Check the caller's resourceVersion (if any) against the stored one.
    fn check_version(kind: &ResourceKind, stored: &Json, incoming: &Json, namespace: &str, name: &str) -> StoreResult<()> {
        let want = meta_str(incoming, "resourceVersion");
        let have = meta_str(stored, "resourceVersion");
        match want {
            Some(w) if Some(w) != have => Err(StoreError::conflict(
                kind,
                namespace,
                name,
                format!("the object has been modified (have {}, got {})", have.unwrap_or("-"), w),
            )),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ClusterStore for MemStore {
    async fn get(&self, kind: &ResourceKind, namespace: &str, name: &str) -> StoreResult<Option<Json>> {
        Ok(self.state().objects.get(&key(kind, namespace, name)).cloned())
    }

    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>, label: Option<&str>) -> StoreResult<Vec<Json>> {
        let gvk = kind.gvk_key();
        let st = self.state();
        let mut out: Vec<(&Key, &Json)> = st
            .objects
            .iter()
            .filter(|((g, ns, _), _)| *g == gvk && namespace.map(|want| want == ns).unwrap_or(true))
            .filter(|(_, obj)| label.map(|sel| label_matches(obj, sel)).unwrap_or(true))
            .collect();
        out.sort_by(|a, b| a.0.cmp(b.0));
        Ok(out.into_iter().map(|(_, v)| v.clone()).collect())
    }

    async fn create(&self, kind: &ResourceKind, mut obj: Json) -> StoreResult<Json> {
        let name = meta_str(&obj, "name").unwrap_or_default().to_string();
        let namespace = meta_str(&obj, "namespace").unwrap_or_default().to_string();
        if name.is_empty() {
            return Err(StoreError::Backend(format!("{}: metadata.name is required", kind.kind)));
        }
        if kind.namespaced && namespace.is_empty() {
            return Err(StoreError::Backend(format!("{} {}: metadata.namespace is required", kind.kind, name)));
        }
        let k = key(kind, &namespace, &name);
        let mut st = self.state();
        if st.objects.contains_key(&k) {
            return Err(StoreError::already_exists(kind, &namespace, &name));
        }
        let rv = st.bump();
        set_meta(&mut obj, "resourceVersion", Json::String(rv));
        set_meta(&mut obj, "uid", Json::String(uuid::Uuid::new_v4().to_string()));
        set_meta(&mut obj, "creationTimestamp", Json::String(now_rfc3339()));
        st.objects.insert(k, obj.clone());
        debug!(kind = %kind.kind, ns = %namespace, name = %name, "mem: created");
        Ok(obj)
    }

    async fn update(&self, kind: &ResourceKind, mut obj: Json) -> StoreResult<Json> {
        let name = meta_str(&obj, "name").unwrap_or_default().to_string();
        let namespace = meta_str(&obj, "namespace").unwrap_or_default().to_string();
        let k = key(kind, &namespace, &name);
        let mut st = self.state();
        let stored = st.objects.get(&k).ok_or_else(|| StoreError::not_found(kind, &namespace, &name))?;
        Self::check_version(kind, stored, &obj, &namespace, &name)?;
        // Status and server-owned metadata survive a spec update.
        let status = stored.get("status").cloned();
        let deletion = stored.get("metadata").and_then(|m| m.get("deletionTimestamp")).cloned();
        let uid = stored.get("metadata").and_then(|m| m.get("uid")).cloned();
        if let Some(map) = obj.as_object_mut() {
            match status {
                Some(s) => { map.insert("status".into(), s); }
                None => { map.remove("status"); }
            }
        }
        if let Some(d) = deletion { set_meta(&mut obj, "deletionTimestamp", d); }
        if let Some(u) = uid { set_meta(&mut obj, "uid", u); }
        let rv = st.bump();
        set_meta(&mut obj, "resourceVersion", Json::String(rv));
        if meta_str(&obj, "deletionTimestamp").is_some() && !has_finalizers(&obj) {
            st.objects.remove(&k);
            debug!(kind = %kind.kind, ns = %namespace, name = %name, "mem: finalized and removed");
        } else {
            st.objects.insert(k, obj.clone());
        }
        Ok(obj)
    }

    async fn update_status(&self, kind: &ResourceKind, obj: Json) -> StoreResult<Json> {
        let name = meta_str(&obj, "name").unwrap_or_default().to_string();
        let namespace = meta_str(&obj, "namespace").unwrap_or_default().to_string();
        let k = key(kind, &namespace, &name);
        let mut st = self.state();
        let gvk = kind.gvk_key();
        if let Some(left) = st.status_conflicts.get_mut(&gvk) {
            if *left > 0 {
                *left -= 1;
                counter!("mem_injected_conflicts_total", 1u64);
                return Err(StoreError::conflict(kind, &namespace, &name, "injected conflict"));
            }
        }
        let stored = st.objects.get(&k).ok_or_else(|| StoreError::not_found(kind, &namespace, &name))?;
        Self::check_version(kind, stored, &obj, &namespace, &name)?;
        let mut next = stored.clone();
        if let Some(map) = next.as_object_mut() {
            match obj.get("status") {
                Some(s) => { map.insert("status".into(), s.clone()); }
                None => { map.remove("status"); }
            }
        }
        let rv = st.bump();
        set_meta(&mut next, "resourceVersion", Json::String(rv));
        st.objects.insert(k, next.clone());
        *st.status_writes.entry(gvk).or_insert(0) += 1;
        Ok(next)
    }

    async fn delete(&self, kind: &ResourceKind, namespace: &str, name: &str) -> StoreResult<()> {
        let k = key(kind, namespace, name);
        let mut st = self.state();
        if st.failing_deletes.contains(&k) {
            return Err(StoreError::Backend(format!("injected delete failure for {} {}/{}", kind.kind, namespace, name)));
        }
        let Some(stored) = st.objects.get(&k).cloned() else {
            return Err(StoreError::not_found(kind, namespace, name));
        };
        *st.deletes.entry(k.clone()).or_insert(0) += 1;
        if has_finalizers(&stored) {
            if meta_str(&stored, "deletionTimestamp").is_none() {
                let mut marked = stored;
                set_meta(&mut marked, "deletionTimestamp", Json::String(now_rfc3339()));
                let rv = st.bump();
                set_meta(&mut marked, "resourceVersion", Json::String(rv));
                st.objects.insert(k, marked);
            }
            debug!(kind = %kind.kind, ns = %namespace, name = %name, "mem: marked for deletion");
        } else {
            st.objects.remove(&k);
            debug!(kind = %kind.kind, ns = %namespace, name = %name, "mem: deleted");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Records;
    use opreq_core::{ClusterPhase, Meta, Namespace, OperandRequest, Record, REQUEST_FINALIZER};
    use std::sync::Arc;

    fn records() -> (Arc<MemStore>, Records) {
        let mem = Arc::new(MemStore::new());
        (mem.clone(), Records::new(mem))
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let (_mem, rec) = records();
        let created = rec.create(&OperandRequest::new("ns", "r", vec![])).await.unwrap();
        let mut a = created.clone();
        let mut b = created.clone();
        a.metadata.labels.insert("x".into(), "1".into());
        rec.update(&a).await.unwrap();
        b.metadata.labels.insert("x".into(), "2".into());
        let err = rec.update(&b).await.unwrap_err();
        assert!(err.is_conflict(), "got {err}");
    }

    #[tokio::test]
    async fn update_keeps_status_and_update_status_keeps_spec() {
        let (_mem, rec) = records();
        let mut r = rec.create(&OperandRequest::new("ns", "r", vec![])).await.unwrap();
        r.status.phase = Some(ClusterPhase::Running);
        let r = rec.update_status(&r).await.unwrap();
        let mut spec_change = r.clone();
        spec_change.status.phase = None;
        spec_change.metadata.labels.insert("k".into(), "v".into());
        let after = rec.update(&spec_change).await.unwrap();
        assert_eq!(after.status.phase, Some(ClusterPhase::Running));
        assert_eq!(after.metadata.labels.get("k").map(String::as_str), Some("v"));
    }

    #[tokio::test]
    async fn finalizer_gates_deletion() {
        let (_mem, rec) = records();
        let mut r = OperandRequest::new("ns", "r", vec![]);
        r.metadata.finalizers.push(REQUEST_FINALIZER.into());
        rec.create(&r).await.unwrap();
        rec.delete::<OperandRequest>("ns", "r").await.unwrap();
        let mut marked = rec.get::<OperandRequest>("ns", "r").await.unwrap().expect("still present");
        assert!(marked.metadata.deletion_timestamp.is_some());
        marked.metadata.finalizers.clear();
        rec.update(&marked).await.unwrap();
        assert!(rec.get::<OperandRequest>("ns", "r").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn injected_conflicts_are_consumed() {
        let (mem, rec) = records();
        let r = rec.create(&OperandRequest::new("ns", "r", vec![])).await.unwrap();
        mem.inject_status_conflicts(&OperandRequest::kind(), 2);
        assert!(rec.update_status(&r).await.unwrap_err().is_conflict());
        assert!(rec.update_status(&r).await.unwrap_err().is_conflict());
        rec.update_status(&r).await.unwrap();
        assert_eq!(mem.status_writes(&OperandRequest::kind()), 1);
    }

    #[tokio::test]
    async fn cluster_scoped_ignores_namespace_and_create_is_idempotent() {
        let (_mem, rec) = records();
        assert!(rec.create_if_absent(&Namespace::named("ops")).await.unwrap());
        assert!(!rec.create_if_absent(&Namespace::named("ops")).await.unwrap());
        let ns = Namespace { metadata: Meta::named("", "ops") };
        assert!(rec.get::<Namespace>("whatever", &ns.metadata.name).await.unwrap().is_some());
        assert!(!rec.delete_if_exists::<Namespace>("", "missing").await.unwrap());
    }
}
