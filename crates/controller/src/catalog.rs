//! Read-only lookups of catalog (registry), config, request and bind records.

use opreq_core::{
    Lifecycle, ObjectKey, OperandBindInfo, OperandConfig, OperandRegistry, OperandRequest, Record, REQUEST_FINALIZER,
};
use opreq_store::Records;
use tracing::debug;

use crate::Result;

/// The registry a request entry points at. Missing is a `NotFound` error.
pub async fn registry(records: &Records, key: &ObjectKey) -> Result<OperandRegistry> {
    Ok(records.fetch::<OperandRegistry>(key).await?)
}

/// Config records share the registry's namespaced name.
pub async fn config(records: &Records, registry: &ObjectKey) -> Result<OperandConfig> {
    Ok(records.fetch::<OperandConfig>(registry).await?)
}

pub async fn request(records: &Records, key: &ObjectKey) -> Result<Option<OperandRequest>> {
    Ok(records.get::<OperandRequest>(&key.namespace, &key.name).await?)
}

/// Requests across all namespaces that are not being deleted, optionally excluding one.
pub async fn live_requests(records: &Records, exclude: Option<&ObjectKey>) -> Result<Vec<OperandRequest>> {
    let all = records.list::<OperandRequest>(None, None).await?;
    let live: Vec<OperandRequest> = all
        .into_iter()
        .filter(|r| r.metadata.lifecycle(REQUEST_FINALIZER) == Lifecycle::Active)
        .filter(|r| exclude.map(|k| *k != r.key()).unwrap_or(true))
        .collect();
    debug!(count = live.len(), "catalog: live requests");
    Ok(live)
}

/// Bind records in `namespace` that publish `operand` from `registry`.
pub async fn bind_infos_for(records: &Records, registry: &ObjectKey, operand: &str) -> Result<Vec<OperandBindInfo>> {
    let all = records.list::<OperandBindInfo>(Some(&registry.namespace), None).await?;
    Ok(all.into_iter().filter(|b| b.spec.operand == operand && b.registry_key() == *registry).collect())
}
