mod common;

use std::time::Duration;

use common::*;
use opreq_controller::{reconcile, status, Action, Error};
use opreq_core::{
    BindInfoPhase, BindInfoSpec, ClusterPhase, ClusterServiceVersion, Meta, MemberStatus, ObjectKey, OperandBindInfo,
    OperandRegistry, OperandRequest, OperatorPhase, Record, ResourceKind,
};

fn etcd_cluster_kind() -> ResourceKind {
    ResourceKind::from_api_version("etcd.database.coreos.com/v1beta2", "EtcdCluster")
}

async fn delete_request(cluster: &Cluster, key: &ObjectKey) {
    cluster.records.delete::<OperandRequest>(&key.namespace, &key.name).await.unwrap();
}

async fn bind_info(cluster: &Cluster) -> OperandBindInfo {
    cluster.records.fetch::<OperandBindInfo>(&ObjectKey::new(CATALOG_NS, "etcd-public")).await.unwrap()
}

async fn publish_etcd(cluster: &Cluster) {
    let mut bind = OperandBindInfo { metadata: Meta::named(CATALOG_NS, "etcd-public"), ..Default::default() };
    bind.spec = BindInfoSpec { operand: "etcd".into(), registry: CATALOG.into(), ..Default::default() };
    cluster.records.create(&bind).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shared_component_outlives_first_request_and_goes_with_the_last() {
    let cluster = Cluster::new();
    cluster.seed_catalog(vec![operator("etcd", "ops")]).await;
    publish_etcd(&cluster).await;

    let r1 = cluster.request("team-a", "r1", &["etcd"]).await;
    let r2 = cluster.request("team-b", "r2", &["etcd"]).await;
    let _olm = spawn_olm(cluster.records.clone(), Duration::from_secs(5), Outcome::Complete);
    assert_eq!(reconcile(&cluster.ctx, &r1).await.unwrap(), Action::Done);
    assert_eq!(reconcile(&cluster.ctx, &r2).await.unwrap(), Action::Done);

    let bi = bind_info(&cluster).await;
    assert_eq!(bi.status.phase, Some(BindInfoPhase::Completed));
    assert_eq!(bi.status.request_namespaces, vec!["team-a", "team-b"]);
    let reg = cluster.registry().await;
    assert_eq!(reg.status.operators_status["etcd"].reconcile_requests, vec![r1.clone(), r2.clone()]);

    delete_request(&cluster, &r1).await;
    assert_eq!(reconcile(&cluster.ctx, &r1).await.unwrap(), Action::Done);
    assert!(cluster.get_request(&r1).await.is_none(), "finalizer released");
    assert!(cluster.subscription("ops", "etcd").await.is_some(), "still used by r2");
    assert_eq!(cluster.subscription_deletes("ops", "etcd"), 0);
    let reg = cluster.registry().await;
    assert_eq!(reg.status.operators_status["etcd"].reconcile_requests, vec![r2.clone()]);
    assert_eq!(reg.status.operators_status["etcd"].phase, OperatorPhase::Running);
    assert_eq!(bind_info(&cluster).await.status.request_namespaces, vec!["team-b"]);

    delete_request(&cluster, &r2).await;
    assert_eq!(reconcile(&cluster.ctx, &r2).await.unwrap(), Action::Done);
    assert!(cluster.get_request(&r2).await.is_none());
    assert!(cluster.subscription("ops", "etcd").await.is_none());
    assert_eq!(cluster.subscription_deletes("ops", "etcd"), 1);
    assert!(cluster.records.get::<ClusterServiceVersion>("ops", &csv_name("etcd")).await.unwrap().is_none());
    assert!(cluster.records.raw().get(&etcd_cluster_kind(), "ops", "example").await.unwrap().is_none());
    let bi = bind_info(&cluster).await;
    assert_eq!(bi.status.phase, Some(BindInfoPhase::Waiting));
    assert!(bi.status.request_namespaces.is_empty());
    let st = &cluster.registry().await.status.operators_status["etcd"];
    assert_eq!(st.phase, OperatorPhase::NotFound);
    assert!(st.reconcile_requests.is_empty());

    // A late duplicate event finds nothing left to do.
    assert_eq!(reconcile(&cluster.ctx, &r2).await.unwrap(), Action::Done);
    assert_eq!(cluster.subscription_deletes("ops", "etcd"), 1);
}

#[tokio::test(start_paused = true)]
async fn request_created_during_teardown_keeps_its_component() {
    let cluster = Cluster::new();
    cluster.seed_catalog(vec![operator("etcd", "ops")]).await;
    let r1 = cluster.request("team-a", "r1", &["etcd"]).await;
    let _olm = spawn_olm(cluster.records.clone(), Duration::from_secs(5), Outcome::Complete);
    assert_eq!(reconcile(&cluster.ctx, &r1).await.unwrap(), Action::Done);

    delete_request(&cluster, &r1).await;
    // Arrives after r1 was marked for deletion but before its teardown ran.
    cluster.request("team-c", "late", &["etcd"]).await;
    assert_eq!(reconcile(&cluster.ctx, &r1).await.unwrap(), Action::Done);
    assert!(cluster.subscription("ops", "etcd").await.is_some());
    assert_eq!(cluster.subscription_deletes("ops", "etcd"), 0);
}

#[tokio::test(start_paused = true)]
async fn liveness_is_rechecked_before_each_component_removal() {
    let cluster = Cluster::new();
    cluster.seed_catalog(vec![operator("etcd", "ops"), operator("mongo", "data")]).await;
    let r1 = cluster.request("team", "r1", &["etcd", "mongo"]).await;
    let _olm = spawn_olm(cluster.records.clone(), Duration::from_secs(5), Outcome::Complete);
    assert_eq!(reconcile(&cluster.ctx, &r1).await.unwrap(), Action::Done);

    // The registry write after data/mongo is removed stalls for one poll interval.
    cluster.mem.inject_status_conflicts(&OperandRegistry::kind(), 1);
    delete_request(&cluster, &r1).await;
    let (ctx, key) = (cluster.ctx.clone(), r1.clone());
    let run = tokio::spawn(async move { reconcile(&ctx, &key).await });

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(cluster.subscription("data", "mongo").await.is_none());
    assert!(cluster.subscription("ops", "etcd").await.is_some());
    cluster.request("team-c", "late", &["etcd"]).await;

    assert_eq!(run.await.unwrap().unwrap(), Action::Done);
    assert!(cluster.get_request(&r1).await.is_none());
    assert!(cluster.subscription("ops", "etcd").await.is_some(), "claimed by the late request");
    assert_eq!(cluster.subscription_deletes("ops", "etcd"), 0);
    assert_eq!(cluster.subscription_deletes("data", "mongo"), 1);
}

#[tokio::test(start_paused = true)]
async fn bind_info_never_lists_its_own_namespace() {
    let cluster = Cluster::new();
    cluster.seed_catalog(vec![operator("etcd", "ops")]).await;
    publish_etcd(&cluster).await;
    let local = cluster.request(CATALOG_NS, "local", &["etcd"]).await;
    let remote = cluster.request("team", "remote", &["etcd"]).await;
    let _olm = spawn_olm(cluster.records.clone(), Duration::from_secs(5), Outcome::Complete);
    assert_eq!(reconcile(&cluster.ctx, &local).await.unwrap(), Action::Done);
    assert_eq!(reconcile(&cluster.ctx, &remote).await.unwrap(), Action::Done);

    let bi = bind_info(&cluster).await;
    assert_eq!(bi.status.phase, Some(BindInfoPhase::Completed));
    assert_eq!(bi.status.request_namespaces, vec!["team"]);
}

#[tokio::test(start_paused = true)]
async fn empty_consumer_list_keeps_bind_namespaces_unless_shrinking() {
    let cluster = Cluster::new();
    publish_etcd(&cluster).await;
    let key = ObjectKey::new(CATALOG_NS, "etcd-public");
    let team = vec!["team".to_string()];
    status::update_bind_info_phase(&cluster.ctx, &key, BindInfoPhase::Completed, &team, false).await.unwrap();
    assert_eq!(bind_info(&cluster).await.status.request_namespaces, team);

    // Nothing but the record's own namespace counts as empty too.
    let own = vec![CATALOG_NS.to_string()];
    status::update_bind_info_phase(&cluster.ctx, &key, BindInfoPhase::Completed, &own, false).await.unwrap();
    status::update_bind_info_phase(&cluster.ctx, &key, BindInfoPhase::Waiting, &[], false).await.unwrap();
    let bi = bind_info(&cluster).await;
    assert_eq!(bi.status.phase, Some(BindInfoPhase::Waiting));
    assert_eq!(bi.status.request_namespaces, team);

    status::update_bind_info_phase(&cluster.ctx, &key, BindInfoPhase::Waiting, &[], true).await.unwrap();
    assert!(bind_info(&cluster).await.status.request_namespaces.is_empty());
}

#[tokio::test(start_paused = true)]
async fn delete_failure_aborts_teardown_and_keeps_finalizer() {
    let cluster = Cluster::new();
    cluster.seed_catalog(vec![operator("etcd", "ops"), operator("mongo", "data")]).await;
    let r1 = cluster.request("team", "r1", &["etcd", "mongo"]).await;
    let _olm = spawn_olm(cluster.records.clone(), Duration::from_secs(5), Outcome::Complete);
    assert_eq!(reconcile(&cluster.ctx, &r1).await.unwrap(), Action::Done);

    let sub_kind = opreq_core::Subscription::kind();
    cluster.mem.fail_deletes(&sub_kind, "data", "mongo", true);
    delete_request(&cluster, &r1).await;

    let err = reconcile(&cluster.ctx, &r1).await.unwrap_err();
    assert!(matches!(&err, Error::TeardownFailure { component, .. } if component == "data/mongo"), "got {err}");
    // Fail-fast: the component after the failing one was not touched.
    assert_eq!(cluster.subscription_deletes("ops", "etcd"), 0);
    let req = cluster.get_request(&r1).await.unwrap();
    assert_eq!(req.status.phase, Some(ClusterPhase::Deleting));
    assert!(req.metadata.has_finalizer(opreq_core::REQUEST_FINALIZER));

    cluster.mem.fail_deletes(&sub_kind, "data", "mongo", false);
    assert_eq!(reconcile(&cluster.ctx, &r1).await.unwrap(), Action::Done);
    assert!(cluster.get_request(&r1).await.is_none());
    assert!(cluster.subscription("data", "mongo").await.is_none());
    assert!(cluster.subscription("ops", "etcd").await.is_none());
    assert_eq!(cluster.subscription_deletes("ops", "etcd"), 1);
}

#[tokio::test(start_paused = true)]
async fn status_write_retries_through_conflicts() {
    let cluster = Cluster::new();
    let key = cluster.request("team", "r1", &[]).await;
    cluster.mem.inject_status_conflicts(&OperandRequest::kind(), 3);

    let members = vec![MemberStatus { name: "etcd".into(), installed: true, ready: true, message: String::new() }];
    let started = tokio::time::Instant::now();
    let phase = status::update_request_status(&cluster.ctx, &key, &members, false, &["team".to_string()]).await.unwrap();
    assert_eq!(phase, Some(ClusterPhase::Running));
    // Three conflicts, each followed by one poll interval.
    assert_eq!(started.elapsed(), Duration::from_secs(60));
    assert_eq!(cluster.get_request(&key).await.unwrap().status.members, members);
}

#[tokio::test(start_paused = true)]
async fn endless_conflicts_surface_deadline() {
    let cluster = Cluster::new();
    let key = cluster.request("team", "r1", &[]).await;
    cluster.mem.inject_status_conflicts(&OperandRequest::kind(), 1_000);

    let started = tokio::time::Instant::now();
    let err = status::set_request_phase(&cluster.ctx, &key, ClusterPhase::Creating).await.unwrap_err();
    assert!(err.is_deadline(), "got {err}");
    assert_eq!(started.elapsed(), Duration::from_secs(600));
    assert_eq!(cluster.get_request(&key).await.unwrap().status.phase, None);
}

#[tokio::test(start_paused = true)]
async fn last_writer_wins_after_conflicting_writers() {
    let cluster = Cluster::new();
    let key = cluster.request("team", "r1", &[]).await;
    let pending = vec![MemberStatus { name: "etcd".into(), installed: false, ready: false, message: "waiting".into() }];
    let ready = vec![MemberStatus { name: "etcd".into(), installed: true, ready: true, message: String::new() }];

    cluster.mem.inject_status_conflicts(&OperandRequest::kind(), 1);
    let (ctx_a, key_a) = (cluster.ctx.clone(), key.clone());
    let first = tokio::spawn(async move { status::update_request_status(&ctx_a, &key_a, &pending, false, &[]).await });
    // The first writer lost its race and retries at 20s; the second writes at 10s.
    tokio::time::sleep(Duration::from_secs(10)).await;
    status::update_request_status(&cluster.ctx, &key, &ready, false, &[]).await.unwrap();
    assert_eq!(cluster.get_request(&key).await.unwrap().status.phase, Some(ClusterPhase::Running));

    let phase = first.await.unwrap().unwrap();
    assert_eq!(phase, Some(ClusterPhase::Updating));
    let stored = cluster.get_request(&key).await.unwrap();
    assert_eq!(stored.status.phase, Some(ClusterPhase::Updating));
    assert_eq!(stored.status.members[0].message, "waiting");
}
