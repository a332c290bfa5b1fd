//! Dependency resolution: request operand names -> concrete installable components.
//!
//! A missing registry record is a hard `NotFound`; an operand name the registry does
//! not list is skipped with a log line, since requests may name optional operands.

use std::collections::BTreeMap;

use opreq_core::{unique, ObjectKey, OperandRegistry, OperandRequest, Operator, Record};
use opreq_store::Records;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{catalog, Error, Result};

/// One installable component a request resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedComponent {
    /// Operand name as written in the request.
    pub operand: String,
    pub registry: ObjectKey,
    /// Where the installed component (subscription) lives.
    pub target: ObjectKey,
    pub operator: Operator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub request: ObjectKey,
    /// Sorted by (target, operand), without duplicates.
    pub components: Vec<ResolvedComponent>,
    /// Namespaces the components install into, deduplicated in component order.
    pub namespaces: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum OnMissing {
    Fail,
    Skip,
}

fn resolve_entries(
    request: &OperandRequest,
    registries: &BTreeMap<ObjectKey, OperandRegistry>,
    on_missing: OnMissing,
) -> Result<Resolution> {
    let mut components: Vec<ResolvedComponent> = Vec::new();
    for entry in &request.spec.requests {
        let reg_key = request.registry_key(entry);
        let Some(registry) = registries.get(&reg_key) else {
            if on_missing == OnMissing::Fail {
                return Err(Error::NotFound(format!("OperandRegistry {} referenced by request {}", reg_key, request.key())));
            }
            warn!(request = %request.key(), registry = %reg_key, "registry missing; entry ignored");
            continue;
        };
        for operand in &entry.operands {
            match registry.get_operator(&operand.name) {
                Some(op) => components.push(ResolvedComponent {
                    operand: operand.name.clone(),
                    registry: reg_key.clone(),
                    target: ObjectKey::new(op.namespace.clone(), op.name.clone()),
                    operator: op.clone(),
                }),
                None => {
                    debug!(request = %request.key(), registry = %reg_key, operand = %operand.name, "operand not in registry; skipped")
                }
            }
        }
    }
    components.sort_by(|a, b| a.target.cmp(&b.target).then_with(|| a.operand.cmp(&b.operand)));
    components.dedup_by(|a, b| a.target == b.target && a.operand == b.operand);
    let targets: Vec<String> = components.iter().map(|c| c.target.namespace.clone()).collect();
    Ok(Resolution { request: request.key(), namespaces: unique(&targets), components })
}

/// Resolve against an already-fetched registry snapshot. Pure.
pub fn resolve_with(request: &OperandRequest, registries: &BTreeMap<ObjectKey, OperandRegistry>) -> Result<Resolution> {
    resolve_entries(request, registries, OnMissing::Fail)
}

async fn fetch_registries(
    records: &Records,
    request: &OperandRequest,
    into: &mut BTreeMap<ObjectKey, OperandRegistry>,
    on_missing: OnMissing,
) -> Result<()> {
    for entry in &request.spec.requests {
        let key = request.registry_key(entry);
        if into.contains_key(&key) {
            continue;
        }
        match catalog::registry(records, &key).await {
            Ok(reg) => {
                into.insert(key, reg);
            }
            Err(e) if e.is_not_found() && on_missing == OnMissing::Skip => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Fetch the registries `request` references and resolve it.
pub async fn resolve(records: &Records, request: &OperandRequest) -> Result<Resolution> {
    let mut registries = BTreeMap::new();
    fetch_registries(records, request, &mut registries, OnMissing::Fail).await?;
    resolve_with(request, &registries)
}

/// Which live requests resolve to which installed component, computed from current
/// store state. Requests whose registries are gone contribute nothing for those entries.
#[derive(Debug, Clone, Default)]
pub struct ConsumerIndex {
    by_target: BTreeMap<ObjectKey, Vec<ObjectKey>>,
}

impl ConsumerIndex {
    pub fn from_resolutions<'a>(resolutions: impl IntoIterator<Item = &'a Resolution>) -> Self {
        let mut by_target: BTreeMap<ObjectKey, Vec<ObjectKey>> = BTreeMap::new();
        for res in resolutions {
            for c in &res.components {
                let consumers = by_target.entry(c.target.clone()).or_default();
                if !consumers.contains(&res.request) {
                    consumers.push(res.request.clone());
                }
            }
        }
        for consumers in by_target.values_mut() {
            consumers.sort();
        }
        Self { by_target }
    }

    /// Re-list and re-resolve every live request except `exclude`.
    pub async fn build(records: &Records, exclude: Option<&ObjectKey>) -> Result<Self> {
        let requests = catalog::live_requests(records, exclude).await?;
        let mut registries = BTreeMap::new();
        let mut resolutions = Vec::with_capacity(requests.len());
        for req in &requests {
            fetch_registries(records, req, &mut registries, OnMissing::Skip).await?;
            resolutions.push(resolve_entries(req, &registries, OnMissing::Skip)?);
        }
        Ok(Self::from_resolutions(&resolutions))
    }

    pub fn consumers_of(&self, target: &ObjectKey) -> &[ObjectKey] {
        self.by_target.get(target).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_referenced(&self, target: &ObjectKey) -> bool { !self.consumers_of(target).is_empty() }

    /// Namespaces of the requests consuming `target`, deduplicated.
    pub fn namespaces_of(&self, target: &ObjectKey) -> Vec<String> {
        let ns: Vec<String> = self.consumers_of(target).iter().map(|k| k.namespace.clone()).collect();
        unique(&ns)
    }
}
