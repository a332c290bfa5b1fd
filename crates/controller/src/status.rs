//! Status aggregation with optimistic retries.
//!
//! Every write goes through `write_with_retry`: re-read the latest record, apply the
//! mutation, skip the write when nothing changed, otherwise write. A conflict makes
//! the poll re-read and try again; the poll deadline bounds the whole loop.

use metrics::counter;
use opreq_core::{
    unique, BindInfoPhase, ClusterPhase, MemberStatus, ObjectKey, OperandBindInfo, OperandRegistry, OperandRequest,
    OperatorPhase, OperatorStatus, Record,
};
use tracing::{debug, info};

use crate::poll::{poll_immediate, Progress};
use crate::resolve::{ConsumerIndex, Resolution};
use crate::{catalog, Context, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Write {
    Spec,
    Status,
}

/// Re-read `key`, let `mutate` bring it to the desired state (returning whether it
/// changed anything), and persist it, retrying on conflicts until the poll deadline.
pub async fn write_with_retry<T, F>(ctx: &Context, key: &ObjectKey, write: Write, mutate: F) -> Result<Option<T>>
where
    T: Record,
    F: Fn(&mut T) -> bool,
{
    let mutate = &mutate;
    let records = &ctx.records;
    let out = poll_immediate(ctx.config.poll_interval, ctx.config.poll_timeout, || async move {
        let Some(mut latest) = records.get::<T>(&key.namespace, &key.name).await? else {
            return Err(Error::NotFound(format!("{} {}", T::kind().kind, key)));
        };
        if !mutate(&mut latest) {
            return Ok(Progress::Done(None));
        }
        let res = match write {
            Write::Spec => records.update(&latest).await,
            Write::Status => records.update_status(&latest).await,
        };
        match res {
            Ok(stored) => Ok(Progress::Done(Some(stored))),
            Err(e) if e.is_conflict() => {
                counter!("status_write_conflicts_total", 1u64);
                debug!(kind = %T::kind().kind, key = %key, "write conflict; retrying on next poll");
                Ok(Progress::Pending)
            }
            Err(e) => Err(e.into()),
        }
    })
    .await?;
    Ok(out)
}

/// Running iff every member is ready; Failed if any member failed outright; otherwise
/// Updating after a prior Running, Creating before that.
pub fn compute_phase(prior: Option<ClusterPhase>, members: &[MemberStatus], failed: bool) -> ClusterPhase {
    if failed {
        return ClusterPhase::Failed;
    }
    if members.iter().all(|m| m.ready) {
        return ClusterPhase::Running;
    }
    match prior {
        Some(ClusterPhase::Running) | Some(ClusterPhase::Updating) => ClusterPhase::Updating,
        _ => ClusterPhase::Creating,
    }
}

fn canonical_members(members: &[MemberStatus]) -> Vec<MemberStatus> {
    let mut out: Vec<MemberStatus> = members.to_vec();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out.dedup_by(|a, b| a.name == b.name);
    out
}

/// Write members, phase and consumer namespaces onto the request.
pub async fn update_request_status(
    ctx: &Context,
    key: &ObjectKey,
    members: &[MemberStatus],
    failed: bool,
    request_namespaces: &[String],
) -> Result<Option<ClusterPhase>> {
    let stored = write_with_retry::<OperandRequest, _>(ctx, key, Write::Status, |req| {
        let members = canonical_members(members);
        let phase = compute_phase(req.status.phase, &members, failed);
        let mut ns = req.status.request_namespaces.clone();
        ns.extend(request_namespaces.iter().cloned());
        let ns = unique(&ns);
        if req.status.phase == Some(phase) && req.status.members == members && req.status.request_namespaces == ns {
            return false;
        }
        req.status.phase = Some(phase);
        req.status.members = members;
        req.status.request_namespaces = ns;
        true
    })
    .await?;
    let phase = match stored {
        Some(req) => req.status.phase,
        None => catalog::request(&ctx.records, key).await?.and_then(|r| r.status.phase),
    };
    debug!(request = %key, phase = ?phase, "request status aggregated");
    Ok(phase)
}

/// Set only the request phase (e.g. Deleting), leaving members alone.
pub async fn set_request_phase(ctx: &Context, key: &ObjectKey, phase: ClusterPhase) -> Result<()> {
    write_with_retry::<OperandRequest, _>(ctx, key, Write::Status, |req| {
        if req.status.phase == Some(phase) {
            return false;
        }
        req.status.phase = Some(phase);
        true
    })
    .await?;
    Ok(())
}

/// Mark one member failed and the request Failed, keeping other members as they are.
pub async fn mark_member_failed(ctx: &Context, key: &ObjectKey, operand: &str, reason: &str) -> Result<()> {
    write_with_retry::<OperandRequest, _>(ctx, key, Write::Status, |req| {
        let failed = MemberStatus { name: operand.to_string(), installed: false, ready: false, message: reason.to_string() };
        let mut members: Vec<MemberStatus> = req.status.members.iter().filter(|m| m.name != operand).cloned().collect();
        members.push(failed);
        members.sort_by(|a, b| a.name.cmp(&b.name));
        if req.status.phase == Some(ClusterPhase::Failed) && req.status.members == members {
            return false;
        }
        req.status.phase = Some(ClusterPhase::Failed);
        req.status.members = members;
        true
    })
    .await?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Track {
    /// Record `request` as a consumer (normal reconciliation only ever adds).
    Add,
    /// Drop `request` (teardown).
    Remove,
}

/// Mirror an installation phase onto the registry's per-operator status.
pub async fn set_operator_phase(
    ctx: &Context,
    registry: &ObjectKey,
    operator: &str,
    phase: OperatorPhase,
    request: &ObjectKey,
    track: Track,
) -> Result<()> {
    write_with_retry::<OperandRegistry, _>(ctx, registry, Write::Status, |reg| {
        let current = reg.status.operators_status.get(operator).cloned();
        let mut requests = current.as_ref().map(|s| s.reconcile_requests.clone()).unwrap_or_default();
        match track {
            Track::Add => {
                requests.push(request.clone());
                requests = unique(&requests);
            }
            Track::Remove => requests.retain(|r| r != request),
        }
        let desired = OperatorStatus { phase, reconcile_requests: requests };
        if current.as_ref() == Some(&desired) {
            return false;
        }
        reg.status.operators_status.insert(operator.to_string(), desired);
        true
    })
    .await?;
    Ok(())
}

/// Drop `request` from an operator's consumer list. When the component was just
/// uninstalled the phase becomes `NotFound` in the same write; otherwise it is kept.
pub async fn untrack_request(
    ctx: &Context,
    registry: &ObjectKey,
    operator: &str,
    request: &ObjectKey,
    uninstalled: bool,
) -> Result<()> {
    write_with_retry::<OperandRegistry, _>(ctx, registry, Write::Status, |reg| {
        let Some(st) = reg.status.operators_status.get_mut(operator) else { return false };
        let before = st.reconcile_requests.len();
        st.reconcile_requests.retain(|r| r != request);
        let mut changed = st.reconcile_requests.len() != before;
        if uninstalled && st.phase != OperatorPhase::NotFound {
            st.phase = OperatorPhase::NotFound;
            changed = true;
        }
        changed
    })
    .await?;
    Ok(())
}

/// Set a bind record's phase and consumer namespaces (its own namespace excluded).
/// An empty namespace list leaves the stored one as is unless `allow_shrink`.
pub async fn update_bind_info_phase(
    ctx: &Context,
    key: &ObjectKey,
    phase: BindInfoPhase,
    request_namespaces: &[String],
    allow_shrink: bool,
) -> Result<()> {
    write_with_retry::<OperandBindInfo, _>(ctx, key, Write::Status, |bind| {
        let ns: Vec<String> = request_namespaces.iter().filter(|n| **n != bind.metadata.namespace).cloned().collect();
        let ns = unique(&ns);
        let next_ns = if ns.is_empty() && !allow_shrink { bind.status.request_namespaces.clone() } else { ns };
        if bind.status.phase == Some(phase) && bind.status.request_namespaces == next_ns {
            return false;
        }
        bind.status.phase = Some(phase);
        bind.status.request_namespaces = next_ns;
        true
    })
    .await?;
    Ok(())
}

/// Update every bind record published by a resolved component.
pub async fn sync_bind_infos(ctx: &Context, resolution: &Resolution, members: &[MemberStatus], index: &ConsumerIndex) -> Result<()> {
    for comp in &resolution.components {
        let ready = members.iter().any(|m| m.name == comp.operand && m.ready);
        let phase = if ready { BindInfoPhase::Completed } else { BindInfoPhase::Waiting };
        let namespaces = index.namespaces_of(&comp.target);
        for bind in catalog::bind_infos_for(&ctx.records, &comp.registry, &comp.operand).await? {
            update_bind_info_phase(ctx, &bind.key(), phase, &namespaces, false).await?;
            info!(bindinfo = %bind.key(), phase = ?phase, "bindinfo status synced");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, ready: bool) -> MemberStatus {
        MemberStatus { name: name.into(), installed: ready, ready, message: String::new() }
    }

    #[test]
    fn phase_running_only_when_all_ready() {
        let all = [member("a", true), member("b", true)];
        let some = [member("a", true), member("b", false)];
        assert_eq!(compute_phase(None, &all, false), ClusterPhase::Running);
        assert_eq!(compute_phase(None, &some, false), ClusterPhase::Creating);
        assert_eq!(compute_phase(Some(ClusterPhase::Creating), &some, false), ClusterPhase::Creating);
        assert_eq!(compute_phase(Some(ClusterPhase::Running), &some, false), ClusterPhase::Updating);
        assert_eq!(compute_phase(Some(ClusterPhase::Running), &all, true), ClusterPhase::Failed);
    }

    #[test]
    fn members_are_canonicalised() {
        let merged = canonical_members(&[member("z", true), member("a", false), member("z", false)]);
        assert_eq!(merged.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(), vec!["a", "z"]);
    }
}
