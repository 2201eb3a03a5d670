//! Watch-side model: what the cluster hands us and what we hand the reconciler.

use std::{fmt, future::Future, time::Duration};

use futures::stream::BoxStream;
use kube_core::ErrorResponse;

/// Uniquely identifies a namespaced object of a known kind by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedName {
    /// The object namespace
    pub namespace: String,
    /// The object name
    pub name: String,
}

impl QualifiedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identity of a pod in the address table.
pub type PodKey = QualifiedName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Namespace,
    Pod,
    Service,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Namespace => "Namespace",
            Self::Pod => "Pod",
            Self::Service => "Service",
        })
    }
}

/// Where a list or watch applies.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    Cluster,
    Namespace(String),
}

impl Scope {
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Self::Cluster => None,
            Self::Namespace(ns) => Some(ns),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cluster => f.write_str("cluster"),
            Self::Namespace(ns) => write!(f, "namespace {ns}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
    Bookmark,
    Error,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Added => "Added",
            Self::Modified => "Modified",
            Self::Deleted => "Deleted",
            Self::Bookmark => "Bookmark",
            Self::Error => "Error",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamespacePhase {
    Active,
    Deleting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceInfo {
    pub name: String,
    pub phase: NamespacePhase,
}

impl NamespaceInfo {
    pub fn active(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phase: NamespacePhase::Active,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    pub key: PodKey,
    /// The IP reported in the pod status, if scheduled.
    pub pod_ip: Option<String>,
}

impl PodInfo {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: PodKey::new(namespace, name),
            pod_ip: None,
        }
    }
}

/// A normalized cluster object, one variant per watched kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Namespace(NamespaceInfo),
    Pod(PodInfo),
    Service(QualifiedName),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Namespace(_) => ResourceKind::Namespace,
            Self::Pod(_) => ResourceKind::Pod,
            Self::Service(_) => ResourceKind::Service,
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        match self {
            Self::Namespace(_) => None,
            Self::Pod(pod) => Some(&pod.key.namespace),
            Self::Service(svc) => Some(&svc.namespace),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Namespace(ns) => &ns.name,
            Self::Pod(pod) => &pod.key.name,
            Self::Service(svc) => &svc.name,
        }
    }
}

/// A change delivered by one watch session, in the canonical shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub event_type: EventType,
    pub resource: Resource,
}

impl Event {
    pub fn new(event_type: EventType, resource: Resource) -> Self {
        Self {
            event_type,
            resource,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "event={} resource={} namespace={} name={}",
            self.event_type,
            self.resource.kind(),
            self.resource.namespace().unwrap_or("-"),
            self.resource.name(),
        )
    }
}

/// Messages accepted by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intake {
    Event(Event),
    /// The complete current contents of one scope, replacing whatever was known about it.
    Resync {
        kind: ResourceKind,
        scope: Scope,
        items: Vec<Resource>,
    },
}

/// A full read of one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub items: Vec<Resource>,
    /// The collection version to resume a watch from.
    pub resource_version: Option<String>,
}

/// Raw item yielded by a watch stream.
#[derive(Debug)]
pub enum WatchItem {
    Applied {
        event_type: EventType,
        resource: Resource,
        resource_version: Option<String>,
    },
    Bookmark {
        resource_version: String,
    },
    Error(ErrorResponse),
}

pub type WatchStream = BoxStream<'static, Result<WatchItem, kube_client::Error>>;

/// Read-only access to the cluster's list and watch endpoints.
pub trait Cluster: Send + Sync + 'static {
    /// Lists every object of `kind` in `scope`.
    fn list(
        &self,
        kind: ResourceKind,
        scope: &Scope,
    ) -> impl Future<Output = Result<Listing, kube_client::Error>> + Send;

    /// Opens a watch of `kind` in `scope` starting after `cursor`.
    ///
    /// The server closes the stream after `timeout`.
    fn watch(
        &self,
        kind: ResourceKind,
        scope: &Scope,
        cursor: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<WatchStream, kube_client::Error>> + Send;
}

pub mod kube;
pub use self::kube::KubeCluster;
pub mod lister;
pub use lister::Lister;
pub mod session;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_renders_log_shape() {
        let event = Event::new(EventType::Added, Resource::Pod(PodInfo::new("default", "p1")));
        assert_eq!(
            event.to_string(),
            "event=Added resource=Pod namespace=default name=p1"
        );

        let event = Event::new(
            EventType::Deleted,
            Resource::Namespace(NamespaceInfo::active("kube-system")),
        );
        assert_eq!(
            event.to_string(),
            "event=Deleted resource=Namespace namespace=- name=kube-system"
        );
    }

    #[test]
    fn scope_namespace() {
        assert_eq!(Scope::Cluster.namespace(), None);
        assert_eq!(Scope::Namespace("a".into()).namespace(), Some("a"));
    }
}
