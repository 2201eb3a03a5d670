//! hma-warden observes namespace, pod and service lifecycle events
//! and maintains a mapping from pod identity to a resolved network address.
//!
//! One watch session runs per (namespace, resource kind), plus one cluster-wide
//! namespace watch. Sessions only enqueue events; a single reconciler task
//! applies them to the [`AddressTable`], starting sessions for namespaces that
//! appear and retiring those of namespaces that go away.
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use hma_warden::{subscriber::KubeCluster, Config, Warden};
//! use tokio_util::sync::CancellationToken;
//!
//! let client = kube_client::Client::try_default().await?;
//! let warden = Warden::new(Arc::new(KubeCluster::new(client)), Config::default());
//! let table = warden.table();
//! warden.run(CancellationToken::new()).await?;
//! # drop(table);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub use config::Config;
pub mod error;
pub mod resolver;
mod runner;
pub use runner::{Reconciler, RunError, Supervisor, Warden};
pub mod subscriber;
pub mod table;
pub use table::AddressTable;

#[cfg(test)]
mod tests;
