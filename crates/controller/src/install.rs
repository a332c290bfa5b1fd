//! Installation driver: creates managed subscriptions for resolved components and
//! waits for the installation subsystem to finish them.

use metrics::counter;
use opreq_core::{
    InstallPlan, InstallPlanPhase, MemberStatus, Meta, Namespace, ObjectKey, OperatorGroup, OperatorPhase, Ownership,
    Subscription, SubscriptionSpec, OPERATOR_GROUP_NAME,
};
use tracing::{debug, info, warn};

use crate::poll::{poll_immediate, Progress};
use crate::resolve::{Resolution, ResolvedComponent};
use crate::status::{self, Track};
use crate::{Context, Error, Result};

pub const PLAN_NOT_READY: &str = "Install Plan is not ready";
pub const SUBSCRIPTION_NOT_READY: &str = "Subscription is not created";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallState {
    /// Install plan complete; `csv` is the installed ClusterServiceVersion, if reported.
    Installed { csv: Option<String> },
    Pending(String),
    /// A subscription this system does not own occupies the target.
    Unmanaged { csv: Option<String> },
    Failed(String),
}

impl InstallState {
    pub fn is_settled(&self) -> bool { matches!(self, Self::Installed { .. } | Self::Unmanaged { .. }) }

    pub fn csv(&self) -> Option<&str> {
        match self {
            Self::Installed { csv } | Self::Unmanaged { csv } => csv.as_deref(),
            _ => None,
        }
    }

    fn operator_phase(&self) -> OperatorPhase {
        match self {
            Self::Installed { .. } | Self::Unmanaged { .. } => OperatorPhase::Running,
            Self::Pending(_) => OperatorPhase::Pending,
            Self::Failed(_) => OperatorPhase::Failed,
        }
    }

    /// Member status before configuration is considered; readiness is decided later.
    pub fn member(&self, operand: &str) -> MemberStatus {
        let (installed, message) = match self {
            Self::Installed { .. } | Self::Unmanaged { .. } => (true, String::new()),
            Self::Pending(m) | Self::Failed(m) => (false, m.clone()),
        };
        MemberStatus { name: operand.to_string(), installed, ready: false, message }
    }
}

#[derive(Debug, Clone)]
pub struct ComponentState {
    pub component: ResolvedComponent,
    pub state: InstallState,
}

async fn ensure_namespace(ctx: &Context, comp: &ResolvedComponent) -> Result<()> {
    let ns = &comp.target.namespace;
    if ctx.records.create_if_absent(&Namespace::named(ns)).await? {
        info!(namespace = %ns, "namespace created");
    }
    let groups = ctx.records.list::<OperatorGroup>(Some(ns), None).await?;
    if !groups.is_empty() {
        return Ok(());
    }
    let mut group = OperatorGroup::default();
    group.metadata = Meta::named(ns, OPERATOR_GROUP_NAME);
    group.spec.target_namespaces = if comp.operator.target_namespaces.is_empty() {
        vec![ns.clone()]
    } else {
        comp.operator.target_namespaces.clone()
    };
    if ctx.records.create_if_absent(&group).await? {
        info!(namespace = %ns, "operator group created");
    }
    Ok(())
}

/// Create a managed subscription for every component that has none, and bring owned
/// subscriptions back to the registry's channel, source and approval mode.
pub async fn ensure_installed(ctx: &Context, resolution: &Resolution) -> Result<()> {
    for comp in &resolution.components {
        let existing = ctx.records.get::<Subscription>(&comp.target.namespace, &comp.target.name).await?;
        match existing {
            None => {
                ensure_namespace(ctx, comp).await?;
                if ctx.records.create_if_absent(&Subscription::for_operator(&comp.operator)).await? {
                    counter!("install_created_total", 1u64);
                    info!(request = %resolution.request, component = %comp.target, "subscription created");
                }
            }
            Some(sub) if sub.metadata.ownership() == Ownership::Unowned => {
                debug!(component = %comp.target, "subscription not managed here; left untouched");
            }
            Some(mut sub) => {
                let desired = SubscriptionSpec::for_operator(&comp.operator);
                if sub.spec == desired {
                    continue;
                }
                sub.spec = desired;
                match ctx.records.update(&sub).await {
                    Ok(_) => info!(component = %comp.target, "subscription spec updated"),
                    Err(e) if e.is_conflict() => {
                        debug!(component = %comp.target, "subscription update conflicted; next reconcile retries")
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
    Ok(())
}

/// One non-blocking look at a component's installation progress.
pub async fn observe(ctx: &Context, comp: &ResolvedComponent) -> Result<InstallState> {
    let Some(sub) = ctx.records.get::<Subscription>(&comp.target.namespace, &comp.target.name).await? else {
        return Ok(InstallState::Pending(SUBSCRIPTION_NOT_READY.to_string()));
    };
    let csv = sub.status.installed_csv.clone();
    if sub.metadata.ownership() == Ownership::Unowned {
        return Ok(InstallState::Unmanaged { csv });
    }
    let Some(plan_ref) = &sub.status.install_plan_ref else {
        return Ok(InstallState::Pending(PLAN_NOT_READY.to_string()));
    };
    let plan_ns = if plan_ref.namespace.is_empty() { &comp.target.namespace } else { &plan_ref.namespace };
    let plan = ctx.records.get::<InstallPlan>(plan_ns, &plan_ref.name).await?;
    let state = match plan {
        None => InstallState::Failed(format!("Install Plan {}/{} not found", plan_ns, plan_ref.name)),
        Some(ip) => match ip.status.phase {
            InstallPlanPhase::Complete => InstallState::Installed { csv },
            InstallPlanPhase::Failed => {
                InstallState::Failed(ip.status.message.unwrap_or_else(|| "Install Plan failed".to_string()))
            }
            _ => InstallState::Pending(PLAN_NOT_READY.to_string()),
        },
    };
    Ok(state)
}

pub async fn observe_all(ctx: &Context, resolution: &Resolution) -> Result<Vec<ComponentState>> {
    let mut out = Vec::with_capacity(resolution.components.len());
    for comp in &resolution.components {
        let state = observe(ctx, comp).await?;
        out.push(ComponentState { component: comp.clone(), state });
    }
    Ok(out)
}

async fn mirror_to_registry(ctx: &Context, request: &ObjectKey, states: &[ComponentState]) -> Result<()> {
    for cs in states {
        let c = &cs.component;
        status::set_operator_phase(ctx, &c.registry, &c.operand, cs.state.operator_phase(), request, Track::Add).await?;
    }
    Ok(())
}

/// Poll until every component is installed (or unmanaged). A failed install plan is
/// written onto the registry and returned as `InstallationFailure` at once.
pub async fn wait_for_install(ctx: &Context, resolution: &Resolution) -> Result<Vec<ComponentState>> {
    let request = &resolution.request;
    let states = poll_immediate(ctx.config.poll_interval, ctx.config.poll_timeout, || async move {
        let states = observe_all(ctx, resolution).await?;
        mirror_to_registry(ctx, request, &states).await?;
        if let Some(failed) = states.iter().find(|s| matches!(s.state, InstallState::Failed(_))) {
            let reason = match &failed.state {
                InstallState::Failed(r) => r.clone(),
                _ => String::new(),
            };
            warn!(request = %request, component = %failed.component.target, reason = %reason, "installation failed");
            return Err(Error::InstallationFailure { component: failed.component.operand.clone(), reason });
        }
        if states.iter().all(|s| s.state.is_settled()) {
            return Ok(Progress::Done(states));
        }
        debug!(request = %request, pending = states.iter().filter(|s| !s.state.is_settled()).count(), "waiting for install");
        Ok(Progress::Pending)
    })
    .await?;
    Ok(states)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_reflects_install_state() {
        let m = InstallState::Pending(PLAN_NOT_READY.into()).member("etcd");
        assert!(!m.installed && !m.ready);
        assert_eq!(m.message, PLAN_NOT_READY);
        let m = InstallState::Installed { csv: Some("etcd.v1".into()) }.member("etcd");
        assert!(m.installed && !m.ready);
        assert!(InstallState::Unmanaged { csv: None }.is_settled());
        assert!(!InstallState::Failed("x".into()).is_settled());
        assert_eq!(InstallState::Installed { csv: Some("c".into()) }.csv(), Some("c"));
    }
}
