//! [`Cluster`] backed by the Kubernetes apiserver.

use std::{fmt::Debug, future::Future, time::Duration};

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::{
    api::core::v1::{Namespace, Pod, Service},
    NamespaceResourceScope,
};
use kube_client::{Api, Client};
use kube_core::{
    params::{ListParams, WatchParams},
    Resource as KubeResource, WatchEvent,
};
use serde::de::DeserializeOwned;

use super::{
    Cluster, EventType, Listing, NamespaceInfo, NamespacePhase, PodInfo, QualifiedName, Resource,
    ResourceKind, Scope, WatchItem, WatchStream,
};

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, scope: &Scope) -> Api<K>
    where
        K: KubeResource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        match scope {
            Scope::Cluster => Api::all(self.client.clone()),
            Scope::Namespace(ns) => Api::namespaced(self.client.clone(), ns),
        }
    }
}

impl Cluster for KubeCluster {
    fn list(
        &self,
        kind: ResourceKind,
        scope: &Scope,
    ) -> impl Future<Output = Result<Listing, kube_client::Error>> + Send {
        let this = self.clone();
        let scope = scope.clone();
        async move {
            match kind {
                ResourceKind::Namespace => {
                    list_with(Api::<Namespace>::all(this.client), namespace_info).await
                }
                ResourceKind::Pod => list_with(this.api::<Pod>(&scope), pod_info).await,
                ResourceKind::Service => list_with(this.api::<Service>(&scope), service_name).await,
            }
        }
    }

    fn watch(
        &self,
        kind: ResourceKind,
        scope: &Scope,
        cursor: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<WatchStream, kube_client::Error>> + Send {
        let this = self.clone();
        let scope = scope.clone();
        let cursor = cursor.to_string();
        // The apiserver takes whole seconds.
        let params = WatchParams::default().timeout(timeout.as_secs().max(1) as u32);
        async move {
            match kind {
                ResourceKind::Namespace => {
                    watch_with(
                        Api::<Namespace>::all(this.client),
                        params,
                        cursor,
                        namespace_info,
                    )
                    .await
                }
                ResourceKind::Pod => {
                    watch_with(this.api::<Pod>(&scope), params, cursor, pod_info).await
                }
                ResourceKind::Service => {
                    watch_with(this.api::<Service>(&scope), params, cursor, service_name).await
                }
            }
        }
    }
}

async fn list_with<K>(api: Api<K>, convert: fn(&K) -> Resource) -> kube_client::Result<Listing>
where
    K: KubeResource + Clone + DeserializeOwned + Debug,
{
    let list = api.list(&ListParams::default()).await?;
    Ok(Listing {
        items: list.items.iter().map(convert).collect(),
        resource_version: list.metadata.resource_version,
    })
}

async fn watch_with<K>(
    api: Api<K>,
    params: WatchParams,
    cursor: String,
    convert: fn(&K) -> Resource,
) -> kube_client::Result<WatchStream>
where
    K: KubeResource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let stream = api.watch(&params, &cursor).await?;
    Ok(stream
        .map_ok(move |event| match event {
            WatchEvent::Added(obj) => applied(EventType::Added, &obj, convert),
            WatchEvent::Modified(obj) => applied(EventType::Modified, &obj, convert),
            WatchEvent::Deleted(obj) => applied(EventType::Deleted, &obj, convert),
            WatchEvent::Bookmark(bookmark) => WatchItem::Bookmark {
                resource_version: bookmark.metadata.resource_version,
            },
            WatchEvent::Error(resp) => WatchItem::Error(resp),
        })
        .boxed())
}

fn applied<K: KubeResource>(
    event_type: EventType,
    obj: &K,
    convert: fn(&K) -> Resource,
) -> WatchItem {
    WatchItem::Applied {
        event_type,
        resource: convert(obj),
        resource_version: obj.meta().resource_version.clone(),
    }
}

fn namespace_info(ns: &Namespace) -> Resource {
    let terminating = ns.metadata.deletion_timestamp.is_some()
        || ns
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            == Some("Terminating");
    Resource::Namespace(NamespaceInfo {
        name: ns.metadata.name.clone().unwrap_or_default(),
        phase: if terminating {
            NamespacePhase::Deleting
        } else {
            NamespacePhase::Active
        },
    })
}

fn pod_info(pod: &Pod) -> Resource {
    Resource::Pod(PodInfo {
        key: qualified_name(pod),
        pod_ip: pod.status.as_ref().and_then(|status| status.pod_ip.clone()),
    })
}

fn service_name(svc: &Service) -> Resource {
    Resource::Service(qualified_name(svc))
}

fn qualified_name<K: KubeResource>(obj: &K) -> QualifiedName {
    QualifiedName::new(
        obj.meta().namespace.clone().unwrap_or_default(),
        obj.meta().name.clone().unwrap_or_default(),
    )
}
