//! Orchestration loop: one reconcile of one OperandRequest.
//!
//! defaults -> finalizer -> (teardown when terminating) -> resolve -> install -> wait
//! -> status -> configure -> status -> requeue until Running.

use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use opreq_core::{unique, ClusterPhase, Lifecycle, MemberStatus, ObjectKey, OperandRequest, Record, REQUEST_FINALIZER};
use tracing::{debug, info, warn};

use crate::install::{self, ComponentState, InstallState};
use crate::resolve::{self, ConsumerIndex, Resolution};
use crate::status::{self, write_with_retry, Write};
use crate::{catalog, operand, teardown, Context, Error, Result};

/// What the caller should do with the key after a successful reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Done,
    RequeueAfter(Duration),
}

pub async fn reconcile(ctx: &Context, key: &ObjectKey) -> Result<Action> {
    let started = Instant::now();
    counter!("reconcile_total", 1u64);
    let res = match reconcile_request(ctx, key).await {
        Err(Error::DeadlineExceeded(waited)) => {
            info!(request = %key, waited = ?waited, "bounded wait exceeded; requeueing");
            Ok(Action::RequeueAfter(ctx.config.requeue_after))
        }
        other => other,
    };
    histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
    match &res {
        Ok(action) => debug!(request = %key, action = ?action, "reconcile finished"),
        Err(e) => {
            counter!("reconcile_errors_total", 1u64, "kind" => e.metric_label());
            warn!(request = %key, error = %e, "reconcile failed");
        }
    }
    res
}

async fn reconcile_request(ctx: &Context, key: &ObjectKey) -> Result<Action> {
    let Some(request) = catalog::request(&ctx.records, key).await? else {
        debug!(request = %key, "request gone");
        return Ok(Action::Done);
    };
    match request.metadata.lifecycle(REQUEST_FINALIZER) {
        Lifecycle::Active => {}
        Lifecycle::Terminating => return finalize(ctx, &request).await,
        Lifecycle::Removed => return Ok(Action::Done),
    }

    let request = prepare(ctx, request).await?;
    let resolution = resolve::resolve(&ctx.records, &request).await?;
    install::ensure_installed(ctx, &resolution).await?;

    let index = ConsumerIndex::build(&ctx.records, None).await?;
    let consumers = consumer_namespaces(&index, &resolution);

    let snapshot = install::observe_all(ctx, &resolution).await?;
    let failed = snapshot.iter().any(|s| matches!(s.state, InstallState::Failed(_)));
    status::update_request_status(ctx, key, &install_members(&snapshot), failed, &consumers).await?;

    let states = match install::wait_for_install(ctx, &resolution).await {
        Ok(states) => states,
        Err(Error::InstallationFailure { component, reason }) => {
            status::mark_member_failed(ctx, key, &component, &reason).await?;
            return Err(Error::InstallationFailure { component, reason });
        }
        Err(e) => return Err(e),
    };
    status::update_request_status(ctx, key, &install_members(&states), false, &consumers).await?;

    let outcome = operand::apply_configs(ctx, &resolution, &states).await?;
    let phase = status::update_request_status(ctx, key, &outcome.members, false, &consumers).await?;
    status::sync_bind_infos(ctx, &resolution, &outcome.members, &index).await?;
    outcome.into_result()?;

    if phase == Some(ClusterPhase::Running) {
        info!(request = %key, components = resolution.components.len(), "request running");
        return Ok(Action::Done);
    }
    debug!(request = %key, phase = ?phase, "request not running yet; requeueing");
    Ok(Action::RequeueAfter(ctx.config.requeue_after))
}

/// Apply defaults and labels and add the finalizer, writing only when something changed.
async fn prepare(ctx: &Context, request: OperandRequest) -> Result<OperandRequest> {
    let updated = write_with_retry::<OperandRequest, _>(ctx, &request.key(), Write::Spec, |r| {
        let defaulted = r.set_defaults();
        let labelled = r.add_labels();
        let finalized = if r.metadata.has_finalizer(REQUEST_FINALIZER) {
            false
        } else {
            r.metadata.finalizers.push(REQUEST_FINALIZER.to_string());
            true
        };
        defaulted | labelled | finalized
    })
    .await?;
    Ok(updated.unwrap_or(request))
}

async fn finalize(ctx: &Context, request: &OperandRequest) -> Result<Action> {
    let key = request.key();
    let report = teardown::teardown(ctx, request).await?;
    debug!(request = %key, report = ?report, "teardown report");
    let released = write_with_retry::<OperandRequest, _>(ctx, &key, Write::Spec, |r| {
        let before = r.metadata.finalizers.len();
        r.metadata.finalizers.retain(|f| f != REQUEST_FINALIZER);
        r.metadata.finalizers.len() != before
    })
    .await;
    match released {
        Ok(_) => info!(request = %key, "finalizer released"),
        Err(e) if e.is_not_found() => debug!(request = %key, "request already removed"),
        Err(e) => return Err(e),
    }
    Ok(Action::Done)
}

fn install_members(states: &[ComponentState]) -> Vec<MemberStatus> {
    states.iter().map(|s| s.state.member(&s.component.operand)).collect()
}

/// Namespaces of every live request consuming any of this request's components.
fn consumer_namespaces(index: &ConsumerIndex, resolution: &Resolution) -> Vec<String> {
    let all: Vec<String> = resolution.components.iter().flat_map(|c| index.namespaces_of(&c.target)).collect();
    unique(&all)
}
