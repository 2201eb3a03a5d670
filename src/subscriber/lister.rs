use std::{sync::Arc, time::Duration};

use crate::error::{Cause, Error, Operation};

use super::{Cluster, Listing, ResourceKind, Scope};

/// Bulk reads of the watched kinds, each bounded by a timeout.
///
/// A failed call yields no items at all.
pub struct Lister<C> {
    cluster: Arc<C>,
    timeout: Duration,
}

impl<C> Clone for Lister<C> {
    fn clone(&self) -> Self {
        Self {
            cluster: Arc::clone(&self.cluster),
            timeout: self.timeout,
        }
    }
}

impl<C: Cluster> Lister<C> {
    pub fn new(cluster: Arc<C>, timeout: Duration) -> Self {
        Self { cluster, timeout }
    }

    pub async fn list_namespaces(&self) -> Result<Listing, Error> {
        self.list(ResourceKind::Namespace, Scope::Cluster).await
    }

    pub async fn list_pods(&self, namespace: &str) -> Result<Listing, Error> {
        self.list(ResourceKind::Pod, Scope::Namespace(namespace.to_string()))
            .await
    }

    pub async fn list_services(&self, namespace: &str) -> Result<Listing, Error> {
        self.list(ResourceKind::Service, Scope::Namespace(namespace.to_string()))
            .await
    }

    pub async fn list(&self, kind: ResourceKind, scope: Scope) -> Result<Listing, Error> {
        let result = tokio::time::timeout(self.timeout, self.cluster.list(kind, &scope)).await;
        match result {
            Ok(Ok(listing)) => Ok(listing),
            Ok(Err(err)) => Err(Error::new(Operation::List, kind, scope, err)),
            Err(_) => Err(Error::new(
                Operation::List,
                kind,
                scope,
                Cause::Timeout(self.timeout),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ErrorClass,
        subscriber::Resource,
        tests::fake::FakeCluster,
    };

    #[tokio::test]
    async fn lists_each_kind_in_its_scope() {
        let fake = Arc::new(FakeCluster::with_pods(&["a", "b"], &["p1", "p2"]));
        fake.add_service("a", "web");
        let lister = Lister::new(Arc::clone(&fake), Duration::from_secs(1));

        assert_eq!(lister.list_namespaces().await.unwrap().items.len(), 2);
        let pods = lister.list_pods("a").await.unwrap();
        assert_eq!(pods.items.len(), 2);
        assert!(pods
            .items
            .iter()
            .all(|item| matches!(item, Resource::Pod(pod) if pod.key.namespace == "a")));
        assert_eq!(lister.list_services("a").await.unwrap().items.len(), 1);
        assert!(lister.list_services("b").await.unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn failed_listing_carries_context() {
        let fake = Arc::new(FakeCluster::with_pods(&["a"], &["p1"]));
        fake.vanish("a");
        let lister = Lister::new(Arc::clone(&fake), Duration::from_secs(1));

        let err = lister.list_pods("a").await.unwrap_err();
        assert_eq!(err.kind, ResourceKind::Pod);
        assert_eq!(err.scope, Scope::Namespace("a".to_string()));
        assert_eq!(err.class(), ErrorClass::RaceNotFound);
    }
}
