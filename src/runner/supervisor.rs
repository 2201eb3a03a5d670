use std::{collections::HashMap, panic, sync::Arc};

use log::{debug, info};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    config::Config,
    subscriber::{
        session::{Exit, WatchSession},
        Cluster, Intake, ResourceKind, Scope,
    },
};

/// Kinds watched inside every namespace.
const NAMESPACED_KINDS: [ResourceKind; 2] = [ResourceKind::Pod, ResourceKind::Service];

struct SessionHandle {
    join_handle: JoinHandle<Exit>,
    token: CancellationToken,
}

impl SessionHandle {
    fn is_live(&self) -> bool {
        !self.join_handle.is_finished()
    }

    async fn cancel(self) {
        self.token.cancel();
        if let Err(err) = self.join_handle.await {
            if let Ok(panic) = err.try_into_panic() {
                panic::resume_unwind(panic)
            }
        }
    }
}

/// Starts, tracks and stops every watch session.
///
/// Sessions register with a [`TaskTracker`] as they are spawned, so shutdown
/// waits for sessions created at any point, not a count fixed at startup.
pub struct Supervisor<C> {
    cluster: Arc<C>,
    config: Config,
    intake: mpsc::Sender<Intake>,
    root: CancellationToken,
    tracker: TaskTracker,
    cluster_sessions: Vec<SessionHandle>,
    namespaces: HashMap<String, Vec<SessionHandle>>,
}

impl<C: Cluster> Supervisor<C> {
    pub fn new(
        cluster: Arc<C>,
        config: Config,
        intake: mpsc::Sender<Intake>,
        root: CancellationToken,
    ) -> Self {
        Self {
            cluster,
            config,
            intake,
            root,
            tracker: TaskTracker::new(),
            cluster_sessions: Vec::new(),
            namespaces: HashMap::new(),
        }
    }

    fn spawn(
        &self,
        kind: ResourceKind,
        scope: Scope,
        cursor: Option<String>,
        token: CancellationToken,
    ) -> SessionHandle {
        debug!("spawning {kind} session in {scope}");
        let session = WatchSession::new(
            kind,
            scope,
            Arc::clone(&self.cluster),
            &self.config,
            self.intake.clone(),
            token.clone(),
        )
        .resume_from(cursor);
        SessionHandle {
            join_handle: self.tracker.spawn(session.run()),
            token,
        }
    }

    /// Starts the cluster-wide namespace watch, resuming from `cursor` if given.
    pub fn watch_namespaces(&mut self, cursor: Option<String>) {
        let handle = self.spawn(
            ResourceKind::Namespace,
            Scope::Cluster,
            cursor,
            self.root.child_token(),
        );
        self.cluster_sessions.push(handle);
    }

    /// Starts the sessions of `namespace` unless they are already running.
    ///
    /// Returns whether anything was started.
    pub fn start_namespace(&mut self, namespace: &str) -> bool {
        if self.root.is_cancelled() {
            return false;
        }
        if self
            .namespaces
            .get(namespace)
            .is_some_and(|handles| handles.iter().any(SessionHandle::is_live))
        {
            return false;
        }

        let token = self.root.child_token();
        let handles = NAMESPACED_KINDS
            .iter()
            .map(|&kind| {
                self.spawn(
                    kind,
                    Scope::Namespace(namespace.to_string()),
                    None,
                    token.clone(),
                )
            })
            .collect();
        self.namespaces.insert(namespace.to_string(), handles);
        info!("started watches for namespace {namespace}");
        true
    }

    /// Cancels the sessions of `namespace` and waits for them to stop.
    ///
    /// Returns how many sessions were retired.
    pub async fn retire_namespace(&mut self, namespace: &str) -> usize {
        let Some(handles) = self.namespaces.remove(namespace) else {
            return 0;
        };
        let count = handles.len();
        for handle in handles {
            handle.cancel().await;
        }
        info!("retired {count} watches for namespace {namespace}");
        count
    }

    pub fn live_sessions(&self, namespace: &str) -> usize {
        self.namespaces
            .get(namespace)
            .map_or(0, |handles| handles.iter().filter(|h| h.is_live()).count())
    }

    /// Number of sessions that have not yet stopped, across all scopes.
    pub fn total_live(&self) -> usize {
        self.tracker.len()
    }

    /// Cancels every session and waits until all of them have stopped.
    pub async fn shutdown(&mut self) {
        self.root.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.cluster_sessions.clear();
        self.namespaces.clear();
        info!("all watches stopped");
    }
}
