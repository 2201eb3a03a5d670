use std::collections::{HashMap, HashSet};

use log::{debug, info};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    resolver::Resolver,
    subscriber::{
        Cluster, Event, EventType, Intake, NamespaceInfo, NamespacePhase, PodInfo, Resource,
        ResourceKind, Scope,
    },
    table::TableWriter,
};

use super::supervisor::Supervisor;

/// The only writer of the address table.
///
/// Applies intake messages one at a time, in the order they were received.
pub struct Reconciler<C> {
    table: TableWriter,
    resolver: Box<dyn Resolver>,
    supervisor: Supervisor<C>,
    namespaces: HashMap<String, NamespacePhase>,
}

impl<C: Cluster> Reconciler<C> {
    pub fn new(table: TableWriter, resolver: Box<dyn Resolver>, supervisor: Supervisor<C>) -> Self {
        Self {
            table,
            resolver,
            supervisor,
            namespaces: HashMap::new(),
        }
    }

    pub fn supervisor(&self) -> &Supervisor<C> {
        &self.supervisor
    }

    pub fn namespace_phase(&self, namespace: &str) -> Option<NamespacePhase> {
        self.namespaces.get(namespace).copied()
    }

    /// Records namespaces known from the initial listing and starts their sessions.
    pub fn seed(&mut self, namespaces: impl IntoIterator<Item = Resource>) {
        for resource in namespaces {
            if let Resource::Namespace(ns) = resource {
                self.observe_namespace(ns);
            }
        }
    }

    /// Consumes the intake until `cancel` fires, then stops every session.
    pub async fn run(mut self, mut intake: mpsc::Receiver<Intake>, cancel: CancellationToken) {
        loop {
            let msg = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                msg = intake.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            self.apply(msg).await;
        }
        self.shutdown().await;
    }

    pub async fn shutdown(&mut self) {
        self.supervisor.shutdown().await;
    }

    pub async fn apply(&mut self, msg: Intake) {
        match msg {
            Intake::Event(event) => self.apply_event(event).await,
            Intake::Resync { kind, scope, items } => self.resync(kind, scope, items).await,
        }
    }

    async fn apply_event(&mut self, event: Event) {
        info!("{event}");
        let Event {
            event_type,
            resource,
        } = event;
        match resource {
            Resource::Namespace(ns) => self.reconcile_namespace(event_type, ns).await,
            Resource::Pod(pod) => self.reconcile_pod(event_type, pod),
            Resource::Service(_) => {}
        }
    }

    async fn reconcile_namespace(&mut self, event_type: EventType, ns: NamespaceInfo) {
        match event_type {
            EventType::Added | EventType::Modified => self.observe_namespace(ns),
            EventType::Deleted => self.forget_namespace(&ns.name).await,
            EventType::Bookmark | EventType::Error => {}
        }
    }

    fn reconcile_pod(&mut self, event_type: EventType, pod: PodInfo) {
        if !self.namespaces.contains_key(&pod.key.namespace) {
            debug!("ignoring pod {} in unknown namespace", pod.key);
            return;
        }
        match event_type {
            EventType::Added | EventType::Modified => {
                let address = self.resolver.resolve(&pod);
                self.table.upsert(pod.key, address);
            }
            EventType::Deleted => {
                if !self.table.remove(&pod.key) {
                    debug!("pod {} was not in the table", pod.key);
                }
            }
            EventType::Bookmark | EventType::Error => {}
        }
    }

    fn observe_namespace(&mut self, ns: NamespaceInfo) {
        let previous = self.namespaces.insert(ns.name.clone(), ns.phase);
        if ns.phase == NamespacePhase::Deleting && previous != Some(NamespacePhase::Deleting) {
            info!("namespace {} is terminating", ns.name);
        }
        self.supervisor.start_namespace(&ns.name);
    }

    async fn forget_namespace(&mut self, namespace: &str) {
        self.namespaces.remove(namespace);
        let purged = self.table.purge_namespace(namespace);
        let retired = self.supervisor.retire_namespace(namespace).await;
        info!("namespace {namespace} removed: purged {purged} pods, retired {retired} watches");
    }

    async fn resync(&mut self, kind: ResourceKind, scope: Scope, items: Vec<Resource>) {
        info!("resync {kind} in {scope}: {} objects", items.len());
        match kind {
            ResourceKind::Namespace => {
                let live: HashSet<String> =
                    items.iter().map(|item| item.name().to_string()).collect();
                let vanished: Vec<String> = self
                    .namespaces
                    .keys()
                    .filter(|name| !live.contains(*name))
                    .cloned()
                    .collect();
                for namespace in vanished {
                    self.forget_namespace(&namespace).await;
                }
                self.seed(items);
            }
            ResourceKind::Pod => {
                let targets: Vec<String> = match scope {
                    Scope::Namespace(ns) if self.namespaces.contains_key(&ns) => vec![ns],
                    Scope::Namespace(ns) => {
                        debug!("ignoring pod listing for unknown namespace {ns}");
                        Vec::new()
                    }
                    Scope::Cluster => self.namespaces.keys().cloned().collect(),
                };
                for namespace in targets {
                    let pods = items.iter().filter_map(|item| match item {
                        Resource::Pod(pod) if pod.key.namespace == namespace => {
                            Some((pod.key.clone(), self.resolver.resolve(pod)))
                        }
                        _ => None,
                    });
                    self.table.replace_namespace(&namespace, pods);
                }
            }
            ResourceKind::Service => {}
        }
    }
}
