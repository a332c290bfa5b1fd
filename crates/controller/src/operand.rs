//! Operand configuration: once a component's ClusterServiceVersion succeeds, each
//! configured custom resource is rendered from the CSV's `alm-examples` template,
//! deep-merged with the configured payload, and created or updated.

use std::collections::BTreeMap;

use opreq_core::{ClusterServiceVersion, ConfigService, MemberStatus, ObjectKey, OperandConfig, ResourceKind, MANAGED_LABEL};
use opreq_store::{label_matches, StoreError, StoreResult};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::install::{ComponentState, InstallState};
use crate::resolve::{Resolution, ResolvedComponent};
use crate::{catalog, Context, Error, Result};

pub const CSV_NOT_READY: &str = "Cluster Service Version is not ready";
pub const MANAGED_OUTSIDE: &str = "subscription is managed outside this controller";

/// Members computed for every component, plus the per-operand errors that were
/// collected along the way. Callers write status first, then surface `errors[0]`.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub members: Vec<MemberStatus>,
    pub errors: Vec<Error>,
}

impl ApplyOutcome {
    pub fn into_result(mut self) -> Result<Vec<MemberStatus>> {
        if self.errors.is_empty() {
            return Ok(self.members);
        }
        Err(self.errors.swap_remove(0))
    }
}

/// `EtcdCluster` -> `etcdCluster`, the key config services use for a kind.
pub fn lower_first(kind: &str) -> String {
    let mut chars = kind.chars();
    match chars.next() {
        Some(c) => c.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Recursive object merge; `overlay` wins for every non-object value.
pub fn merge_json(base: &Json, overlay: &Json) -> Json {
    match (base, overlay) {
        (Json::Object(b), Json::Object(o)) => {
            let mut out = b.clone();
            for (k, v) in o {
                let merged = match out.get(k) {
                    Some(existing) => merge_json(existing, v),
                    None => v.clone(),
                };
                out.insert(k.clone(), merged);
            }
            Json::Object(out)
        }
        (_, other) => other.clone(),
    }
}

/// A custom resource to create for one config entry.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedResource {
    pub kind: ResourceKind,
    pub key: ObjectKey,
    pub object: Json,
}

/// Render every template the service configures. Templates whose kind has no config
/// entry are not installed.
pub fn render(templates: &[Json], service: &ConfigService, namespace: &str) -> Result<Vec<RenderedResource>> {
    let mut out = Vec::new();
    for template in templates {
        let kind = template.get("kind").and_then(Json::as_str).unwrap_or_default();
        let Some(payload) = service.spec.get(&lower_first(kind)) else {
            continue;
        };
        let api_version = template.get("apiVersion").and_then(Json::as_str).unwrap_or_default();
        let name = template.pointer("/metadata/name").and_then(Json::as_str).unwrap_or_default();
        if kind.is_empty() || api_version.is_empty() || name.is_empty() {
            return Err(Error::InvalidOperand {
                operand: service.name.clone(),
                reason: format!("alm-examples template for {:?} lacks apiVersion, kind or metadata.name", kind),
            });
        }
        let spec = merge_json(template.get("spec").unwrap_or(&Json::Null), payload);
        let mut object = template.clone();
        object["spec"] = spec;
        if stamp_metadata(&mut object, namespace).is_none() {
            return Err(Error::InvalidOperand {
                operand: service.name.clone(),
                reason: format!("alm-examples template {:?} has non-object metadata.labels", name),
            });
        }
        out.push(RenderedResource {
            kind: ResourceKind::from_api_version(api_version, kind),
            key: ObjectKey::new(namespace, name),
            object,
        });
    }
    Ok(out)
}

/// Namespace the object and add the managed label. `None` if labels are not a map.
fn stamp_metadata(object: &mut Json, namespace: &str) -> Option<()> {
    let meta = object.get_mut("metadata")?.as_object_mut()?;
    meta.insert("namespace".to_string(), Json::String(namespace.to_string()));
    let labels = meta.entry("labels").or_insert(Json::Null);
    if labels.is_null() {
        *labels = Json::Object(serde_json::Map::new());
    }
    labels.as_object_mut()?.insert(MANAGED_LABEL.to_string(), Json::String("true".to_string()));
    Some(())
}

fn managed_selector() -> String { format!("{}=true", MANAGED_LABEL) }

async fn create_or_update(ctx: &Context, res: &RenderedResource) -> Result<()> {
    let store = ctx.records.raw();
    let Some(mut existing) = store.get(&res.kind, &res.key.namespace, &res.key.name).await? else {
        match store.create(&res.kind, res.object.clone()).await {
            Ok(_) => info!(resource = %res.key, kind = %res.kind.kind, "operand resource created"),
            Err(e) if e.is_already_exists() => debug!(resource = %res.key, "operand resource appeared concurrently"),
            Err(e) => return Err(e.into()),
        }
        return Ok(());
    };
    if !label_matches(&existing, &managed_selector()) {
        debug!(resource = %res.key, kind = %res.kind.kind, "operand resource not managed here; left untouched");
        return Ok(());
    }
    let desired = res.object.get("spec").cloned().unwrap_or(Json::Null);
    if existing.get("spec") == Some(&desired) {
        return Ok(());
    }
    existing["spec"] = desired;
    match store.update(&res.kind, existing).await {
        Ok(_) => info!(resource = %res.key, kind = %res.kind.kind, "operand resource updated"),
        Err(e) if e.is_conflict() => debug!(resource = %res.key, "operand resource update conflicted; next reconcile retries"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn succeeded_csv(ctx: &Context, namespace: &str, state: &InstallState) -> Result<Option<ClusterServiceVersion>> {
    let Some(name) = state.csv() else { return Ok(None) };
    let csv = ctx.records.get::<ClusterServiceVersion>(namespace, name).await?;
    Ok(csv.filter(ClusterServiceVersion::succeeded))
}

async fn apply_component(
    ctx: &Context,
    comp: &ResolvedComponent,
    csv: &ClusterServiceVersion,
    configs: &mut BTreeMap<ObjectKey, OperandConfig>,
) -> Result<()> {
    if !configs.contains_key(&comp.registry) {
        let config = catalog::config(&ctx.records, &comp.registry).await?;
        configs.insert(comp.registry.clone(), config);
    }
    let Some(service) = configs.get(&comp.registry).and_then(|c| c.get_service(&comp.operand)) else {
        debug!(component = %comp.target, "no configuration for operand");
        return Ok(());
    };
    for res in render(&csv.alm_examples(), service, &comp.target.namespace)? {
        create_or_update(ctx, &res).await?;
    }
    Ok(())
}

/// Turn install states into member statuses, applying configuration to every managed
/// component whose CSV has succeeded.
pub async fn apply_configs(ctx: &Context, resolution: &Resolution, states: &[ComponentState]) -> Result<ApplyOutcome> {
    let mut outcome = ApplyOutcome::default();
    let mut configs: BTreeMap<ObjectKey, OperandConfig> = BTreeMap::new();
    for cs in states {
        let comp = &cs.component;
        let mut member = cs.state.member(&comp.operand);
        if !cs.state.is_settled() {
            outcome.members.push(member);
            continue;
        }
        let Some(csv) = succeeded_csv(ctx, &comp.target.namespace, &cs.state).await? else {
            member.message = CSV_NOT_READY.to_string();
            outcome.members.push(member);
            continue;
        };
        if let InstallState::Unmanaged { .. } = cs.state {
            member.ready = true;
            member.message = MANAGED_OUTSIDE.to_string();
            outcome.members.push(member);
            continue;
        }
        match apply_component(ctx, comp, &csv, &mut configs).await {
            Ok(()) => member.ready = true,
            Err(e) => {
                warn!(request = %resolution.request, component = %comp.target, error = %e, "applying configuration failed");
                member.message = e.to_string();
                outcome.errors.push(e);
            }
        }
        outcome.members.push(member);
    }
    Ok(outcome)
}

/// Delete the managed custom resources a component's configuration created. Missing
/// resources count as removed; unmanaged ones are left alone. Returns how many were deleted.
pub async fn delete_operands(ctx: &Context, comp: &ResolvedComponent, csv: &ClusterServiceVersion) -> StoreResult<usize> {
    let Some(config) = ctx.records.get::<OperandConfig>(&comp.registry.namespace, &comp.registry.name).await? else {
        warn!(component = %comp.target, registry = %comp.registry, "no config record; no operand resources to remove");
        return Ok(0);
    };
    let Some(service) = config.get_service(&comp.operand) else { return Ok(0) };
    let rendered = render(&csv.alm_examples(), service, &comp.target.namespace)
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    let store = ctx.records.raw();
    let mut deleted = 0;
    for res in rendered {
        let Some(existing) = store.get(&res.kind, &res.key.namespace, &res.key.name).await? else { continue };
        if !label_matches(&existing, &managed_selector()) {
            continue;
        }
        match store.delete(&res.kind, &res.key.namespace, &res.key.name).await {
            Ok(()) => {
                deleted += 1;
                info!(resource = %res.key, kind = %res.kind.kind, "operand resource deleted");
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service() -> ConfigService {
        ConfigService {
            name: "etcd".into(),
            spec: BTreeMap::from([("etcdCluster".to_string(), json!({"size": 5, "pod": {"labels": {"tier": "db"}}}))]),
        }
    }

    #[test]
    fn lower_first_matches_config_keys() {
        assert_eq!(lower_first("EtcdCluster"), "etcdCluster");
        assert_eq!(lower_first(""), "");
    }

    #[test]
    fn merge_is_deep_and_overlay_wins() {
        let base = json!({"size": 3, "pod": {"labels": {"app": "etcd"}, "resources": {}}, "version": "3.2"});
        let merged = merge_json(&base, &json!({"size": 5, "pod": {"labels": {"tier": "db"}}}));
        assert_eq!(merged, json!({"size": 5, "pod": {"labels": {"app": "etcd", "tier": "db"}, "resources": {}}, "version": "3.2"}));
    }

    #[test]
    fn render_selects_configured_templates_only() {
        let templates = vec![
            json!({"apiVersion": "etcd.database.coreos.com/v1beta2", "kind": "EtcdCluster",
                   "metadata": {"name": "example"}, "spec": {"size": 3, "version": "3.2"}}),
            json!({"apiVersion": "etcd.database.coreos.com/v1beta2", "kind": "EtcdBackup",
                   "metadata": {"name": "backup"}, "spec": {}}),
        ];
        let out = render(&templates, &service(), "ops").unwrap();
        assert_eq!(out.len(), 1);
        let r = &out[0];
        assert_eq!(r.kind.kind, "EtcdCluster");
        assert_eq!(r.kind.group, "etcd.database.coreos.com");
        assert_eq!(r.key, ObjectKey::new("ops", "example"));
        assert_eq!(r.object["spec"]["size"], 5);
        assert_eq!(r.object["spec"]["version"], "3.2");
        assert_eq!(r.object["metadata"]["labels"][MANAGED_LABEL], "true");
    }

    #[test]
    fn render_rejects_labels_that_are_not_a_map() {
        let templates = vec![json!({"apiVersion": "etcd.database.coreos.com/v1beta2", "kind": "EtcdCluster",
                                    "metadata": {"name": "example", "labels": ["not-a-map"]}, "spec": {}})];
        let err = render(&templates, &service(), "ops").unwrap_err();
        assert!(matches!(err, Error::InvalidOperand { ref operand, .. } if operand == "etcd"), "got {err}");
    }

    #[test]
    fn render_keeps_template_labels_and_fills_null_ones() {
        let templates = vec![
            json!({"apiVersion": "etcd.database.coreos.com/v1beta2", "kind": "EtcdCluster",
                   "metadata": {"name": "a", "labels": {"app": "etcd"}}, "spec": {}}),
            json!({"apiVersion": "etcd.database.coreos.com/v1beta2", "kind": "EtcdCluster",
                   "metadata": {"name": "b", "labels": null}, "spec": {}}),
        ];
        let out = render(&templates, &service(), "ops").unwrap();
        assert_eq!(out[0].object["metadata"]["labels"], json!({"app": "etcd", MANAGED_LABEL: "true"}));
        assert_eq!(out[1].object["metadata"]["labels"], json!({MANAGED_LABEL: "true"}));
        assert_eq!(out[1].object["metadata"]["namespace"], "ops");
    }

    #[test]
    fn render_rejects_nameless_template() {
        let templates = vec![json!({"apiVersion": "etcd.database.coreos.com/v1beta2", "kind": "EtcdCluster", "spec": {}})];
        let err = render(&templates, &service(), "ops").unwrap_err();
        assert!(matches!(err, Error::InvalidOperand { .. }), "got {err}");
    }
}
