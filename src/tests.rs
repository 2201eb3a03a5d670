use std::{future::Future, sync::Arc, time::Duration};

use futures::future;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    resolver::{PodIp, Resolver},
    subscriber::{
        Cluster, Event, EventType, Intake, Listing, NamespacePhase, PodInfo, PodKey, Resource,
        ResourceKind, Scope, WatchStream,
    },
    AddressTable, Config, Reconciler, RunError, Warden,
};

use fake::FakeCluster;

const PATIENCE: Duration = Duration::from_secs(5);

pub(crate) fn test_config() -> Config {
    Config::default()
        .with_list_timeout(Duration::from_secs(2))
        .with_backoff(Duration::from_millis(5), Duration::from_millis(20))
}

fn ns(name: &str) -> Scope {
    Scope::Namespace(name.to_string())
}

fn key(namespace: &str, name: &str) -> PodKey {
    PodKey::new(namespace, name)
}

pub(crate) async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + PATIENCE;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Drives the reconciler by hand so tests can observe it between messages.
struct Harness {
    fake: Arc<FakeCluster>,
    reconciler: Reconciler<FakeCluster>,
    intake: mpsc::Receiver<Intake>,
    table: AddressTable,
}

impl Harness {
    async fn start(fake: FakeCluster) -> Self {
        Self::start_with(fake, crate::resolver::Unresolved).await
    }

    async fn start_with(fake: FakeCluster, resolver: impl Resolver) -> Self {
        let fake = Arc::new(fake);
        let warden = Warden::new(Arc::clone(&fake), test_config()).with_resolver(resolver);
        let table = warden.table();
        let (reconciler, intake) = warden
            .bootstrap(&CancellationToken::new())
            .await
            .unwrap()
            .expect("startup was not cancelled");
        Self {
            fake,
            reconciler,
            intake,
            table,
        }
    }

    async fn pump_until(&mut self, what: &str, done: impl Fn(&Self) -> bool) {
        let deadline = Instant::now() + PATIENCE;
        while !done(self) {
            let msg = tokio::time::timeout_at(deadline, self.intake.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
                .expect("intake closed");
            self.reconciler.apply(msg).await;
        }
    }

    async fn watching(&self, kind: ResourceKind, namespace: &str) {
        let fake = Arc::clone(&self.fake);
        wait_for("watch to open", || fake.open_watches(kind, ns(namespace)) == 1).await;
    }

    fn live(&self, namespace: &str) -> usize {
        self.reconciler.supervisor().live_sessions(namespace)
    }
}

#[tokio::test]
async fn two_namespaces_from_listing_to_teardown() {
    let mut h = Harness::start(FakeCluster::with_pods(
        &["default", "kube-system"],
        &["p1", "p2"],
    ))
    .await;

    h.pump_until("initial listing", |h| h.table.len() == 4).await;
    for namespace in ["default", "kube-system"] {
        for pod in ["p1", "p2"] {
            assert_eq!(h.table.get(&key(namespace, pod)), Some(None));
        }
    }

    h.fake.delete_pod("default", "p1");
    h.pump_until("pod deletion", |h| h.table.len() == 3).await;
    assert!(!h.table.contains(&key("default", "p1")));
    assert_eq!(h.live("kube-system"), 2);

    h.fake.delete_namespace("kube-system");
    h.pump_until("namespace deletion", |h| h.table.len() == 1).await;
    assert!(h.table.contains(&key("default", "p2")));
    assert_eq!(h.table.namespace_len("kube-system"), 0);
    assert_eq!(h.live("kube-system"), 0);
    assert_eq!(h.fake.open_watches(ResourceKind::Pod, ns("kube-system")), 0);
    assert_eq!(
        h.fake.open_watches(ResourceKind::Service, ns("kube-system")),
        0
    );
    assert_eq!(h.live("default"), 2);

    h.reconciler.shutdown().await;
    assert_eq!(h.reconciler.supervisor().total_live(), 0);
    assert_eq!(h.fake.total_open_watches(), 0);
}

#[tokio::test]
async fn event_replay_converges_to_listing() {
    let mut h = Harness::start(FakeCluster::with_pods(&["a", "b"], &["p1", "p2", "p3"])).await;
    h.pump_until("initial listing", |h| h.table.len() == 6).await;

    let fake = &h.fake;
    fake.add_pod("a", "p4");
    fake.delete_pod("b", "p2");
    fake.modify_pod("a", "p1", "10.0.0.1");
    fake.add_namespace("c");
    fake.add_pod("c", "q1");
    fake.add_pod("b", "p5");
    fake.delete_pod("a", "p4");
    fake.add_service("c", "web");
    fake.add_pod("c", "q2");
    fake.delete_pod("c", "q1");
    fake.delete_pod("b", "missing");

    let expected = h.fake.pod_snapshot();
    assert_eq!(expected.len(), 7);
    h.pump_until("convergence", |h| h.table.snapshot() == expected).await;
    assert_eq!(h.live("c"), 2);
}

#[tokio::test]
async fn expiry_resumes_from_cursor() {
    let mut h = Harness::start(FakeCluster::with_pods(&["a"], &["p1", "p2"])).await;
    h.pump_until("initial listing", |h| h.table.len() == 2).await;
    h.watching(ResourceKind::Pod, "a").await;

    h.fake.expire(ResourceKind::Pod, ns("a"));
    h.fake.add_pod("a", "p3");
    h.fake.delete_pod("a", "p1");

    let expected = h.fake.pod_snapshot();
    h.pump_until("resumed watch", |h| h.table.snapshot() == expected).await;
    assert!(h.fake.watch_count(ResourceKind::Pod, ns("a")) >= 2);
    assert_eq!(h.fake.list_count(ResourceKind::Pod, ns("a")), 1);
}

#[tokio::test]
async fn stale_cursor_resyncs_only_its_scope() {
    let mut h = Harness::start(FakeCluster::with_pods(&["a", "b"], &["p1", "p2"])).await;
    h.pump_until("initial listing", |h| h.table.len() == 4).await;
    h.watching(ResourceKind::Pod, "a").await;

    h.fake.compact(ResourceKind::Pod, ns("a"));
    h.fake.delete_pod("a", "p1");
    h.fake.add_pod("a", "p9");

    let expected = h.fake.pod_snapshot();
    h.pump_until("resync", |h| h.table.snapshot() == expected).await;
    assert_eq!(h.fake.list_count(ResourceKind::Pod, ns("a")), 2);
    assert_eq!(h.fake.list_count(ResourceKind::Pod, ns("b")), 1);
}

#[tokio::test]
async fn gone_error_in_stream_resyncs() {
    let mut h = Harness::start(FakeCluster::with_pods(&["a"], &["p1"])).await;
    h.pump_until("initial listing", |h| h.table.len() == 1).await;

    h.watching(ResourceKind::Pod, "a").await;
    let fake = Arc::clone(&h.fake);
    fake.reject_watchers(ResourceKind::Pod, ns("a"), 410);
    wait_for("relisting", || fake.list_count(ResourceKind::Pod, ns("a")) == 2).await;

    fake.add_pod("a", "p2");
    h.pump_until("event after resync", |h| h.table.len() == 2).await;
}

#[tokio::test]
async fn bookmark_moves_cursor_only() {
    let mut h = Harness::start(FakeCluster::with_pods(&["a"], &["p1"])).await;
    h.pump_until("initial listing", |h| h.table.len() == 1).await;
    h.watching(ResourceKind::Pod, "a").await;
    let before = h.table.snapshot();

    let version = h.fake.bookmark(ResourceKind::Pod, ns("a"));
    h.fake.expire(ResourceKind::Pod, ns("a"));
    let fake = Arc::clone(&h.fake);
    wait_for("reopen", || fake.open_watches(ResourceKind::Pod, ns("a")) == 1).await;

    assert_eq!(fake.watch_count(ResourceKind::Pod, ns("a")), 2);
    assert_eq!(
        fake.last_cursor(ResourceKind::Pod, ns("a")),
        Some(version.to_string())
    );
    assert_eq!(fake.list_count(ResourceKind::Pod, ns("a")), 1);
    while let Ok(msg) = h.intake.try_recv() {
        assert!(!matches!(msg, Intake::Event(_)), "unexpected {msg:?}");
        h.reconciler.apply(msg).await;
    }
    assert_eq!(h.table.snapshot(), before);
}

#[tokio::test]
async fn transient_watch_errors_keep_entries() {
    let mut h = Harness::start(FakeCluster::with_pods(&["a"], &["p1"])).await;
    h.pump_until("initial listing", |h| h.table.len() == 1).await;
    h.watching(ResourceKind::Pod, "a").await;

    let fake = Arc::clone(&h.fake);
    fake.fail_next_watch(ResourceKind::Pod, ns("a"), 500);
    fake.fail_next_watch(ResourceKind::Pod, ns("a"), 503);
    fake.expire(ResourceKind::Pod, ns("a"));
    wait_for("reopen after backoff", || {
        fake.open_watches(ResourceKind::Pod, ns("a")) == 1
    })
    .await;
    assert_eq!(fake.watch_count(ResourceKind::Pod, ns("a")), 4);
    assert!(h.table.contains(&key("a", "p1")));

    fake.add_pod("a", "p2");
    h.pump_until("event after reopen", |h| h.table.len() == 2).await;
    assert_eq!(fake.list_count(ResourceKind::Pod, ns("a")), 1);
}

#[tokio::test]
async fn namespace_deleted_before_watch_is_discarded() {
    let mut h = Harness::start(FakeCluster::with_pods(&["default"], &["p1"])).await;
    h.pump_until("initial listing", |h| h.table.len() == 1).await;

    h.fake.vanish("ghost");
    h.fake.add_namespace("ghost");
    h.pump_until("namespace added", |h| {
        h.reconciler.namespace_phase("ghost").is_some()
    })
    .await;

    let supervisor = h.reconciler.supervisor();
    wait_for("ghost sessions to stop", || supervisor.live_sessions("ghost") == 0).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.fake.list_count(ResourceKind::Pod, ns("ghost")), 1);
    assert_eq!(h.fake.list_count(ResourceKind::Service, ns("ghost")), 1);
    assert_eq!(h.live("default"), 2);
}

#[tokio::test]
async fn terminating_namespace_keeps_watching() {
    let mut h = Harness::start(FakeCluster::with_pods(&["default"], &["p1"])).await;
    h.pump_until("initial listing", |h| h.table.len() == 1).await;

    h.fake.terminate_namespace("default");
    h.pump_until("terminating phase", |h| {
        h.reconciler.namespace_phase("default") == Some(NamespacePhase::Deleting)
    })
    .await;
    assert_eq!(h.live("default"), 2);
    assert_eq!(h.table.len(), 1);
}

#[tokio::test]
async fn pod_events_for_unknown_namespace_are_dropped() {
    let mut h = Harness::start(FakeCluster::with_pods(&["default"], &[])).await;

    h.reconciler
        .apply(Intake::Event(Event::new(
            EventType::Added,
            Resource::Pod(PodInfo::new("removed", "p1")),
        )))
        .await;
    h.reconciler
        .apply(Intake::Resync {
            kind: ResourceKind::Pod,
            scope: ns("removed"),
            items: vec![Resource::Pod(PodInfo::new("removed", "p2"))],
        })
        .await;
    assert!(h.table.is_empty());
}

#[tokio::test]
async fn pod_ip_resolver_keeps_known_address() {
    let mut h = Harness::start_with(FakeCluster::with_pods(&["a"], &["p1"]), PodIp).await;
    h.pump_until("initial listing", |h| h.table.len() == 1).await;
    assert_eq!(h.table.get(&key("a", "p1")), Some(None));

    h.fake.modify_pod("a", "p1", "10.0.0.7");
    h.pump_until("address", |h| {
        h.table.get(&key("a", "p1")) == Some(Some("10.0.0.7".to_string()))
    })
    .await;

    h.fake.apply(
        EventType::Modified,
        Resource::Pod(PodInfo::new("a", "p1")),
    );
    h.fake.add_pod("a", "p2");
    h.pump_until("second pod", |h| h.table.len() == 2).await;
    assert_eq!(
        h.table.get(&key("a", "p1")),
        Some(Some("10.0.0.7".to_string()))
    );
}

#[tokio::test]
async fn startup_fails_without_namespaces() {
    let fake = Arc::new(FakeCluster::with_pods(&["default"], &["p1"]));
    fake.fail_next_list(ResourceKind::Namespace, Scope::Cluster, 503);

    let result = Warden::new(fake, test_config())
        .run(CancellationToken::new())
        .await;
    match result {
        Err(RunError::Startup(err)) => {
            assert_eq!(err.kind, ResourceKind::Namespace);
            assert_eq!(err.scope, Scope::Cluster);
        }
        other => panic!("expected startup failure, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_config_is_rejected_before_listing() {
    let fake = Arc::new(FakeCluster::default());
    let config = test_config().with_intake_capacity(0);

    let result = Warden::new(Arc::clone(&fake), config)
        .run(CancellationToken::new())
        .await;
    assert!(matches!(result, Err(RunError::Config(_))));
    assert_eq!(fake.list_count(ResourceKind::Namespace, Scope::Cluster), 0);
}

/// Never answers.
struct Unresponsive;

impl Cluster for Unresponsive {
    fn list(
        &self,
        _kind: ResourceKind,
        _scope: &Scope,
    ) -> impl Future<Output = Result<Listing, kube_client::Error>> + Send {
        future::pending()
    }

    fn watch(
        &self,
        _kind: ResourceKind,
        _scope: &Scope,
        _cursor: &str,
        _timeout: Duration,
    ) -> impl Future<Output = Result<WatchStream, kube_client::Error>> + Send {
        future::pending()
    }
}

#[tokio::test]
async fn cancel_interrupts_startup_listing() {
    let cancel = CancellationToken::new();
    let warden = Warden::new(Arc::new(Unresponsive), Config::default());
    let task = tokio::spawn(warden.run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(20)).await;

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("startup ignored cancellation")
        .expect("warden panicked");
    assert!(result.is_ok(), "{result:?}");
}

#[tokio::test]
async fn shutdown_stops_late_sessions() {
    let fake = Arc::new(FakeCluster::with_pods(&["default"], &["p1"]));
    let warden = Warden::new(Arc::clone(&fake), test_config());
    let table = warden.table();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(warden.run(cancel.clone()));

    for i in 0..5 {
        let namespace = format!("late-{i}");
        fake.add_namespace(&namespace);
        fake.add_pod(&namespace, "p");
    }
    wait_for("late pods", || table.len() == 6).await;
    // One namespace watch plus pods and services for six namespaces.
    wait_for("all watches open", || fake.total_open_watches() == 13).await;

    cancel.cancel();
    tokio::time::timeout(PATIENCE, task)
        .await
        .expect("shutdown did not finish")
        .expect("warden panicked")
        .expect("warden failed");
    assert_eq!(fake.total_open_watches(), 0);
}
