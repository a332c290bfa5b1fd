//! Finalizer teardown: remove the components a deleted request resolved to, but only
//! those no other live request still resolves to.
//!
//! Reference counts are never cached. Every run re-lists and re-resolves the other live
//! requests, so a request created while this one was terminating keeps its components.
//! The whole step is re-entrant: anything already gone counts as removed.

use metrics::counter;
use opreq_core::{
    BindInfoPhase, ClusterPhase, ClusterServiceVersion, ObjectKey, OperandRequest, Ownership, Record, Subscription,
    MANAGED_LABEL,
};
use opreq_store::StoreResult;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::resolve::{self, ConsumerIndex, ResolvedComponent};
use crate::{catalog, operand, status, Context, Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    /// Components whose subscription was deleted by this run.
    pub removed: Vec<ObjectKey>,
    /// Components kept because other live requests still consume them.
    pub retained: Vec<ObjectKey>,
    /// Components whose subscription is not managed here.
    pub unowned: Vec<ObjectKey>,
}

/// Custom resources, then the CSV, then the subscription.
async fn remove_component(ctx: &Context, comp: &ResolvedComponent, sub: &Subscription) -> StoreResult<()> {
    let ns = &comp.target.namespace;
    if let Some(csv_name) = &sub.status.installed_csv {
        if let Some(csv) = ctx.records.get::<ClusterServiceVersion>(ns, csv_name).await? {
            let n = operand::delete_operands(ctx, comp, &csv).await?;
            debug!(component = %comp.target, resources = n, "operand resources removed");
        }
        if ctx.records.delete_if_exists::<ClusterServiceVersion>(ns, csv_name).await? {
            info!(component = %comp.target, csv = %csv_name, "cluster service version deleted");
        }
    }
    if ctx.records.delete_if_exists::<Subscription>(ns, &comp.target.name).await? {
        info!(component = %comp.target, "subscription deleted");
    }
    Ok(())
}

/// Run teardown for `request`, which must be terminating. Fails fast: the first delete
/// error aborts the run so the caller retries it whole.
pub async fn teardown(ctx: &Context, request: &OperandRequest) -> Result<TeardownReport> {
    let key = request.key();
    let selector = format!("{}=true", MANAGED_LABEL);
    let managed = ctx.records.list::<Subscription>(None, Some(&selector)).await?;
    let mut report = TeardownReport::default();
    if managed.is_empty() {
        debug!(request = %key, "no managed subscriptions; nothing to tear down");
        return Ok(report);
    }

    status::set_request_phase(ctx, &key, ClusterPhase::Deleting).await?;
    let resolution = resolve::resolve(&ctx.records, request).await?;

    for comp in &resolution.components {
        let sub = managed.iter().find(|s| s.key() == comp.target);
        let Some(sub) = sub else {
            let current = ctx.records.get::<Subscription>(&comp.target.namespace, &comp.target.name).await?;
            if current.map(|s| s.metadata.ownership()) == Some(Ownership::Unowned) {
                report.unowned.push(comp.target.clone());
            }
            status::untrack_request(ctx, &comp.registry, &comp.operand, &key, false).await?;
            continue;
        };
        // Liveness is decided right before each delete, not once per run.
        let index = ConsumerIndex::build(&ctx.records, Some(&key)).await?;
        let removed = !index.is_referenced(&comp.target);
        if removed {
            remove_component(ctx, comp, sub).await.map_err(|source| {
                warn!(request = %key, component = %comp.target, error = %source, "teardown delete failed");
                Error::TeardownFailure { component: comp.target.to_string(), source }
            })?;
            counter!("teardown_deleted_total", 1u64);
            report.removed.push(comp.target.clone());
        } else {
            info!(
                request = %key,
                component = %comp.target,
                consumers = index.consumers_of(&comp.target).len(),
                "component still referenced; kept"
            );
            report.retained.push(comp.target.clone());
        }
        status::untrack_request(ctx, &comp.registry, &comp.operand, &key, removed).await?;
    }

    let index = ConsumerIndex::build(&ctx.records, Some(&key)).await?;
    for comp in &resolution.components {
        let namespaces = index.namespaces_of(&comp.target);
        let removed = report.removed.contains(&comp.target);
        for bind in catalog::bind_infos_for(&ctx.records, &comp.registry, &comp.operand).await? {
            let phase = if removed { BindInfoPhase::Waiting } else { bind.status.phase.unwrap_or(BindInfoPhase::Waiting) };
            status::update_bind_info_phase(ctx, &bind.key(), phase, &namespaces, true).await?;
        }
    }

    info!(
        request = %key,
        removed = report.removed.len(),
        retained = report.retained.len(),
        "teardown complete"
    );
    Ok(report)
}
