use std::sync::Arc;

use log::info;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{Config, ConfigError},
    error::Error,
    resolver::{Resolver, Unresolved},
    subscriber::{Cluster, Intake, Lister},
    table::{AddressTable, TableWriter},
};

pub mod reconciler;
pub mod supervisor;

pub use reconciler::Reconciler;
pub use supervisor::Supervisor;

/// Watches the cluster and keeps an [`AddressTable`] up to date.
pub struct Warden<C> {
    cluster: Arc<C>,
    config: Config,
    resolver: Box<dyn Resolver>,
    writer: TableWriter,
    table: AddressTable,
}

impl<C: Cluster> Warden<C> {
    pub fn new(cluster: Arc<C>, config: Config) -> Self {
        let (writer, table) = TableWriter::new();
        Self {
            cluster,
            config,
            resolver: Box::new(Unresolved),
            writer,
            table,
        }
    }

    /// Sets how pod addresses are derived. Defaults to [`Unresolved`].
    pub fn with_resolver(mut self, resolver: impl Resolver) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    /// A read handle on the table this warden maintains.
    pub fn table(&self) -> AddressTable {
        self.table.clone()
    }

    /// Runs until `cancel` fires and every watch session has stopped.
    ///
    /// Fails only if startup fails.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), RunError> {
        let Some((reconciler, intake)) = self.bootstrap(&cancel).await? else {
            return Ok(());
        };
        reconciler.run(intake, cancel).await;
        Ok(())
    }

    /// Lists the initial namespaces and starts every session.
    ///
    /// Returns `None` if `cancel` fires before the listing completes.
    pub(crate) async fn bootstrap(
        self,
        cancel: &CancellationToken,
    ) -> Result<Option<(Reconciler<C>, mpsc::Receiver<Intake>)>, RunError> {
        self.config.validate()?;

        let lister = Lister::new(Arc::clone(&self.cluster), self.config.list_timeout);
        let listing = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!("cancelled during startup");
                return Ok(None);
            }
            listing = lister.list_namespaces() => listing?,
        };
        info!("found {} namespaces", listing.items.len());

        let (tx, rx) = mpsc::channel(self.config.intake_capacity);
        let mut supervisor = Supervisor::new(self.cluster, self.config, tx, cancel.child_token());
        supervisor.watch_namespaces(listing.resource_version);

        let mut reconciler = Reconciler::new(self.writer, self.resolver, supervisor);
        reconciler.seed(listing.items);
        Ok(Some((reconciler, rx)))
    }
}

/// Failures that prevent the warden from starting.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("failed to build cluster client")]
    Client(#[source] kube_client::Error),
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
    #[error("initial namespace listing failed")]
    Startup(#[from] Error),
}
